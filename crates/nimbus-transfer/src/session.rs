//! Explicit credential context: executor + auth gate + service handle.

use std::future::Future;
use std::sync::Arc;

use nimbus_core::config::{AuthConfig, TransferConfig};
use nimbus_core::NimbusResult;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{Credentials, StorageApi, TokenRefresher};
use crate::auth::AuthRefreshGate;
use crate::executor::RequestExecutor;

pub struct Session {
    api: Arc<dyn StorageApi>,
    executor: RequestExecutor,
    auth: Arc<AuthRefreshGate>,
    config: TransferConfig,
}

impl Session {
    pub fn new(
        api: Arc<dyn StorageApi>,
        refresher: Arc<dyn TokenRefresher>,
        credentials: Credentials,
        transfer: TransferConfig,
        auth: &AuthConfig,
    ) -> Self {
        let executor = RequestExecutor::from_config(&transfer);
        Self {
            api,
            auth: Arc::new(AuthRefreshGate::new(
                refresher,
                credentials,
                auth.refresh_cooldown(),
                executor.clone(),
            )),
            executor,
            config: transfer,
        }
    }

    pub fn api(&self) -> &dyn StorageApi {
        self.api.as_ref()
    }

    pub fn auth(&self) -> &Arc<AuthRefreshGate> {
        &self.auth
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Run an authenticated call. `op` receives the bearer token.
    ///
    /// A 401 triggers one refresh through the gate and exactly one replay of
    /// the call with the new token. Cancellation during the refresh yields
    /// [`NimbusError::Canceled`](nimbus_core::NimbusError::Canceled).
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> NimbusResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = NimbusResult<T>>,
    {
        let token = self.auth.access_token().await;
        match self.executor.execute(cancel, || op(token.clone())).await {
            Err(e) if e.is_unauthorized() => {
                debug!("request unauthorized, refreshing credentials");
                self.auth.ensure_fresh_token(cancel).await?;
                let token = self.auth.access_token().await;
                self.executor.execute(cancel, || op(token.clone())).await
            }
            other => other,
        }
    }

    /// Run a call against a pre-authorized URL (no bearer token, no refresh).
    pub async fn call_unauthenticated<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> NimbusResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NimbusResult<T>>,
    {
        self.executor.execute(cancel, op).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("executor", &self.executor)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}
