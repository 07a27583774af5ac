//! Client facade composing the service, session and engines.

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::config::{AuthConfig, NimbusConfig, TransferConfig};
use nimbus_core::keys::{UserKeyPair, UserPublicKey};
use nimbus_core::types::{FileUploadRequest, NodeId};
use nimbus_core::{ApiErrorKind, NimbusError, NimbusResult};
use nimbus_crypto::PlainFileKey;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::api::{Credentials, StorageApi, TokenRefresher};
use crate::download::DownloadEngine;
use crate::http::HttpApi;
use crate::keys::FileKeyManager;
use crate::session::Session;
use crate::upload::UploadEngine;

/// Refresher for sessions without a refresh grant: every refresh fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _refresh_token: &str) -> NimbusResult<Credentials> {
        Err(NimbusError::api(
            ApiErrorKind::Unauthorized,
            401,
            "credentials expired and refresh is not configured",
        ))
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    api: Option<Arc<dyn StorageApi>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    credentials: Option<Credentials>,
    transfer: TransferConfig,
    auth: AuthConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take transfer and auth settings from a loaded config and talk HTTP
    /// to `config.api.base_url`.
    pub fn from_config(config: &NimbusConfig) -> NimbusResult<Self> {
        Ok(Self::new()
            .http(HttpApi::new(&config.api)?)
            .transfer_config(config.transfer.clone())
            .auth_config(config.auth.clone()))
    }

    /// Use the HTTP service for both calls and token refresh.
    pub fn http(mut self, api: HttpApi) -> Self {
        let api = Arc::new(api);
        self.api = Some(api.clone());
        self.refresher = Some(api);
        self
    }

    pub fn api(mut self, api: Arc<dyn StorageApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn auth_config(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn build(self) -> NimbusResult<Client> {
        let api = self
            .api
            .ok_or_else(|| NimbusError::Config("no service implementation configured".into()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| NimbusError::Config("no credentials configured".into()))?;
        let refresher = self.refresher.unwrap_or_else(|| Arc::new(NoRefresh));
        let session = Session::new(api, refresher, credentials, self.transfer, &self.auth);
        Ok(Client {
            session: Arc::new(session),
        })
    }
}

/// Entry point for transfers and key management.
#[derive(Debug, Clone)]
pub struct Client {
    session: Arc<Session>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &TransferConfig {
        self.session.config()
    }

    /// Download engine for `node_id`; pass the plain key for encrypted files.
    pub fn download(&self, node_id: NodeId, file_key: Option<PlainFileKey>) -> DownloadEngine {
        DownloadEngine::new(
            self.session.clone(),
            node_id,
            file_key,
            CancellationToken::new(),
        )
    }

    /// Resolve the caller's file key, then build a decrypting download.
    pub async fn encrypted_download(
        &self,
        node_id: NodeId,
        key_pair: &UserKeyPair,
        passphrase: &SecretString,
    ) -> NimbusResult<DownloadEngine> {
        let cancel = CancellationToken::new();
        let file_key = self
            .file_keys()
            .get_plain_file_key(&cancel, node_id, key_pair, passphrase)
            .await?;
        Ok(DownloadEngine::new(
            self.session.clone(),
            node_id,
            Some(file_key),
            cancel,
        ))
    }

    /// Upload engine; `recipient` makes it an encrypted upload.
    pub fn upload(
        &self,
        request: FileUploadRequest,
        recipient: Option<UserPublicKey>,
    ) -> UploadEngine {
        UploadEngine::new(
            self.session.clone(),
            request,
            recipient,
            CancellationToken::new(),
        )
    }

    pub fn file_keys(&self) -> FileKeyManager {
        FileKeyManager::new(self.session.clone())
    }
}
