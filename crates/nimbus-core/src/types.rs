use serde::{Deserialize, Serialize};

use crate::error::{ApiErrorKind, NimbusError};
use crate::keys::{EncryptedFileKey, UserPublicKey};

pub type NodeId = i64;
pub type UserId = i64;

/// A file (or container) node as returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub is_encrypted: Option<bool>,
}

/// Position bookkeeping for one transfer.
///
/// `offset` is the only field that moves during a transfer and never passes
/// `total_length` when the latter is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub id: String,
    pub node_id: Option<NodeId>,
    pub chunk_size: u64,
    pub total_length: Option<u64>,
    pub offset: u64,
}

impl TransferDescriptor {
    pub fn new(id: impl Into<String>, node_id: Option<NodeId>, chunk_size: u64) -> Self {
        Self {
            id: id.into(),
            node_id,
            chunk_size,
            total_length: None,
            offset: 0,
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.total_length.map(|t| t - self.offset)
    }

    /// Move the offset forward, refusing to run past the known total.
    pub fn advance(&mut self, n: u64) -> Result<(), NimbusError> {
        let next = self.offset + n;
        if let Some(total) = self.total_length {
            if next > total {
                return Err(NimbusError::State(format!(
                    "offset {next} would exceed total length {total}"
                )));
            }
        }
        self.offset = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralSettings {
    pub use_s3_storage: bool,
    pub s3_tags_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    #[default]
    Autorename,
    Overwrite,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expiration {
    pub enable_expiration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<String>,
}

/// Metadata for a new upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadRequest {
    pub parent_id: NodeId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Expiration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip)]
    pub resolution_strategy: ResolutionStrategy,
    #[serde(skip)]
    pub keep_share_links: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_s3_upload: Option<bool>,
}

impl FileUploadRequest {
    pub fn new(parent_id: NodeId, name: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
            size: None,
            expiration: None,
            classification: None,
            notes: None,
            resolution_strategy: ResolutionStrategy::default(),
            keep_share_links: false,
            direct_s3_upload: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_resolution_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.resolution_strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    #[serde(default)]
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub resolution_strategy: ResolutionStrategy,
    pub keep_share_links: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key: Option<EncryptedFileKey>,
}

/// One direct-storage part; `part_number` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3UploadPart {
    pub part_number: u32,
    pub part_etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteS3UploadRequest {
    pub parts: Vec<S3UploadPart>,
    pub resolution_strategy: ResolutionStrategy,
    pub keep_share_links: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key: Option<EncryptedFileKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub url: String,
    pub part_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlList {
    pub urls: Vec<PresignedUrl>,
}

/// Progress of an asynchronous direct-storage completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum S3UploadState {
    Transfer,
    Finishing,
    Done,
    Error,
    Other(String),
}

impl From<String> for S3UploadState {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "transfer" => S3UploadState::Transfer,
            "finishing" => S3UploadState::Finishing,
            "done" => S3UploadState::Done,
            "error" => S3UploadState::Error,
            _ => S3UploadState::Other(s),
        }
    }
}

impl From<S3UploadState> for String {
    fn from(s: S3UploadState) -> Self {
        match s {
            S3UploadState::Transfer => "transfer".into(),
            S3UploadState::Finishing => "finishing".into(),
            S3UploadState::Done => "done".into(),
            S3UploadState::Error => "error".into(),
            S3UploadState::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_code: Option<i64>,
}

impl ErrorDetails {
    pub fn into_error(self) -> NimbusError {
        NimbusError::Api {
            kind: ApiErrorKind::classify(self.code, self.error_code),
            status: self.code,
            code: self.error_code,
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3UploadStatus {
    pub status: S3UploadState,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadToken {
    pub download_url: String,
}

/// Narrows a missing-key listing to one room or one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissingKeysFilter {
    pub room_id: Option<NodeId>,
    pub file_id: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub limit: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdFileIdItem {
    pub user_id: UserId,
    pub file_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUserPublicKey {
    pub id: UserId,
    pub public_key_container: UserPublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFileKey {
    pub id: NodeId,
    pub file_key_container: EncryptedFileKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingKeysResponse {
    pub range: Range,
    #[serde(default)]
    pub items: Vec<UserIdFileIdItem>,
    #[serde(default)]
    pub users: Vec<UserUserPublicKey>,
    #[serde(default)]
    pub files: Vec<FileFileKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFileKeySet {
    pub user_id: UserId,
    pub file_id: NodeId,
    pub file_key: EncryptedFileKey,
}
