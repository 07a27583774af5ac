//! Shared credential holder with a serialized, rate-limited refresh.

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{ApiErrorKind, NimbusError, NimbusResult};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Credentials, TokenRefresher};
use crate::executor::RequestExecutor;

#[derive(Debug, Default)]
struct RefreshState {
    last_attempt: Option<Instant>,
    last_error: Option<NimbusError>,
}

/// One per client. Every transfer shares it through the session.
///
/// Refreshes are mutually exclusive. Within `cooldown` of the previous
/// attempt, callers get that attempt's outcome replayed instead of a new
/// refresh, so a burst of 401s produces one refresh and one consistent error.
/// The refresh call itself runs through the executor: transport failures are
/// retried before anything is cached, and a canceled refresh is never cached.
pub struct AuthRefreshGate {
    refresher: Arc<dyn TokenRefresher>,
    executor: RequestExecutor,
    credentials: RwLock<Credentials>,
    state: Mutex<RefreshState>,
    cooldown: Duration,
}

impl AuthRefreshGate {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        credentials: Credentials,
        cooldown: Duration,
        executor: RequestExecutor,
    ) -> Self {
        Self {
            refresher,
            executor,
            credentials: RwLock::new(credentials),
            state: Mutex::new(RefreshState::default()),
            cooldown,
        }
    }

    /// Current access token.
    pub async fn access_token(&self) -> String {
        self.credentials.read().await.access_token.clone()
    }

    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = credentials;
    }

    pub async fn ensure_fresh_token(&self, cancel: &CancellationToken) -> NimbusResult<()> {
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NimbusError::Canceled),
            guard = self.state.lock() => guard,
        };

        if let Some(at) = state.last_attempt {
            if at.elapsed() < self.cooldown {
                debug!("credential refresh within cooldown, replaying last outcome");
                return match &state.last_error {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                };
            }
        }

        let refresh_token = self.credentials.read().await.refresh_token.clone();
        let result = match refresh_token {
            Some(token) => {
                let refresher = self.refresher.as_ref();
                let token = token.as_str();
                self.executor
                    .execute(cancel, || refresher.refresh(token))
                    .await
            }
            None => Err(NimbusError::api(
                ApiErrorKind::Unauthorized,
                401,
                "access token rejected and no refresh token available",
            )),
        };
        if matches!(result, Err(NimbusError::Canceled)) {
            debug!("credential refresh canceled");
            return Err(NimbusError::Canceled);
        }
        state.last_attempt = Some(Instant::now());

        match result {
            Ok(mut fresh) => {
                let mut creds = self.credentials.write().await;
                // Keep the old refresh token if the grant did not rotate it.
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = creds.refresh_token.clone();
                }
                *creds = fresh;
                state.last_error = None;
                info!("credentials refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed");
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for AuthRefreshGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRefreshGate")
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}
