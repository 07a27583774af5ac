//! Remote service contract consumed by the transfer engine.
//!
//! Every authenticated call receives the bearer token to use, so that the
//! session can replay a call with a refreshed token after a 401.

use async_trait::async_trait;
use bytes::Bytes;
use zeroize::{Zeroize, ZeroizeOnDrop};

use nimbus_core::keys::EncryptedFileKey;
use nimbus_core::types::{
    CompleteS3UploadRequest, CompleteUploadRequest, FileUploadRequest, GeneralSettings,
    MissingKeysFilter, MissingKeysResponse, Node, NodeId, PresignedUrlList, S3UploadStatus,
    UploadSession, UserFileKeySet,
};
use nimbus_core::NimbusResult;

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn get_node(&self, token: &str, node_id: NodeId) -> NimbusResult<Node>;

    async fn get_server_general_settings(&self, token: &str) -> NimbusResult<GeneralSettings>;

    async fn create_file_upload(
        &self,
        token: &str,
        request: &FileUploadRequest,
    ) -> NimbusResult<UploadSession>;

    /// Send one chunk at `offset` of the upload session.
    async fn upload_chunk(
        &self,
        token: &str,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
    ) -> NimbusResult<()>;

    async fn complete_file_upload(
        &self,
        token: &str,
        upload_id: &str,
        request: &CompleteUploadRequest,
    ) -> NimbusResult<Node>;

    /// Short-lived, pre-authorized URL for ranged reads of a file.
    async fn get_download_url(&self, token: &str, node_id: NodeId) -> NimbusResult<String>;

    /// Read `size` bytes at `offset` from a pre-authorized download URL.
    async fn download_range(&self, url: &str, offset: u64, size: u64) -> NimbusResult<Bytes>;

    /// Presigned PUT URLs for parts `first_part_number..first_part_number + count` (1-based).
    async fn get_s3_upload_urls(
        &self,
        token: &str,
        upload_id: &str,
        first_part_number: u32,
        count: u32,
        size: u64,
    ) -> NimbusResult<PresignedUrlList>;

    /// PUT one part to a presigned URL, returning the raw `ETag` header.
    async fn put_s3_part(&self, url: &str, chunk: Bytes) -> NimbusResult<String>;

    async fn complete_s3_upload(
        &self,
        token: &str,
        upload_id: &str,
        request: &CompleteS3UploadRequest,
    ) -> NimbusResult<()>;

    async fn get_s3_upload_status(&self, token: &str, upload_id: &str)
        -> NimbusResult<S3UploadStatus>;

    /// The caller's own wrapped key for a file.
    async fn get_user_file_key(&self, token: &str, node_id: NodeId)
        -> NimbusResult<EncryptedFileKey>;

    async fn get_missing_file_keys(
        &self,
        token: &str,
        filter: MissingKeysFilter,
        offset: u64,
        limit: u64,
    ) -> NimbusResult<MissingKeysResponse>;

    async fn set_file_keys(&self, token: &str, keys: &[UserFileKeySet]) -> NimbusResult<()>;
}

/// Exchanges a refresh token for new credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> NimbusResult<Credentials>;
}

/// Bearer credentials. Zeroized on drop.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}
