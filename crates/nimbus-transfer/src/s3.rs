//! Direct-to-object-storage multipart uploads.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nimbus_core::config::TransferConfig;
use nimbus_core::keys::EncryptedFileKey;
use nimbus_core::types::{
    CompleteS3UploadRequest, Node, ResolutionStrategy, S3UploadPart, S3UploadState,
};
use nimbus_core::{ApiErrorKind, NimbusError, NimbusResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::Session;

/// Backoff schedule for completion polling.
///
/// Waits start at `initial`, double after every poll and never exceed
/// `max_delay`. At most `max_attempts` status requests are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            initial: config.s3_poll_initial(),
            max_delay: config.s3_poll_max_delay(),
            max_attempts: config.s3_poll_max_attempts,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

pub struct S3Coordinator {
    session: Arc<Session>,
    upload_id: String,
    parts: Vec<S3UploadPart>,
    poll: PollPolicy,
}

impl S3Coordinator {
    pub fn new(session: Arc<Session>, upload_id: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            session,
            upload_id: upload_id.into(),
            parts: Vec::new(),
            poll,
        }
    }

    /// Whether the service routes upload bytes straight to object storage.
    pub async fn is_enabled(session: &Session, cancel: &CancellationToken) -> NimbusResult<bool> {
        let api = session.api();
        let settings = session
            .call(cancel, |token| async move {
                api.get_server_general_settings(&token).await
            })
            .await?;
        Ok(settings.use_s3_storage)
    }

    pub fn parts(&self) -> &[S3UploadPart] {
        &self.parts
    }

    /// Upload the chunk with 0-based index `index` as part `index + 1`.
    pub async fn upload_part(
        &mut self,
        cancel: &CancellationToken,
        index: u32,
        chunk: Bytes,
    ) -> NimbusResult<()> {
        let part_number = index + 1;
        let size = chunk.len() as u64;
        let api = self.session.api();
        let upload_id = self.upload_id.as_str();

        let urls = self
            .session
            .call(cancel, |token| async move {
                api.get_s3_upload_urls(&token, upload_id, part_number, 1, size)
                    .await
            })
            .await?;
        let url = urls
            .urls
            .into_iter()
            .find(|u| u.part_number == part_number)
            .map(|u| u.url)
            .ok_or_else(|| {
                NimbusError::api(
                    ApiErrorKind::Other,
                    200,
                    format!("no presigned URL returned for part {part_number}"),
                )
            })?;

        let chunk = &chunk;
        let url = url.as_str();
        let etag = self
            .session
            .call_unauthenticated(cancel, || async move {
                api.put_s3_part(url, chunk.clone()).await
            })
            .await?;

        debug!(upload_id = %self.upload_id, part_number, bytes = size, "uploaded part");
        self.parts.push(S3UploadPart {
            part_number,
            part_etag: strip_etag_quotes(&etag).to_string(),
        });
        Ok(())
    }

    /// Submit the part list and wait for the service to assemble the file.
    ///
    /// Returns `Ok(None)` when the poll budget runs out before the service
    /// reports `done`: the upload may still complete.
    pub async fn complete(
        &mut self,
        cancel: &CancellationToken,
        resolution_strategy: ResolutionStrategy,
        keep_share_links: bool,
        file_key: Option<EncryptedFileKey>,
    ) -> NimbusResult<Option<Node>> {
        if self.parts.is_empty() {
            self.upload_part(cancel, 0, Bytes::new()).await?;
        }

        let request = CompleteS3UploadRequest {
            parts: self.parts.clone(),
            resolution_strategy,
            keep_share_links,
            file_key,
        };
        let api = self.session.api();
        let upload_id = self.upload_id.as_str();
        let request = &request;
        self.session
            .call(cancel, |token| async move {
                api.complete_s3_upload(&token, upload_id, request).await
            })
            .await?;
        info!(upload_id = %self.upload_id, parts = self.parts.len(), "direct upload submitted");

        self.poll_status(cancel).await
    }

    async fn poll_status(&self, cancel: &CancellationToken) -> NimbusResult<Option<Node>> {
        let api = self.session.api();
        let upload_id = self.upload_id.as_str();
        let mut delay = self.poll.initial;

        for attempt in 1..=self.poll.max_attempts {
            let status = self
                .session
                .call(cancel, |token| async move {
                    api.get_s3_upload_status(&token, upload_id).await
                })
                .await?;

            match status.status {
                S3UploadState::Done => {
                    info!(upload_id, attempt, "direct upload done");
                    return Ok(status.node);
                }
                S3UploadState::Transfer | S3UploadState::Finishing => {
                    debug!(upload_id, attempt, state = ?status.status, "direct upload still in progress");
                }
                other => {
                    let err = match status.error_details {
                        Some(details) => details.into_error(),
                        None => NimbusError::api(
                            ApiErrorKind::ServerError,
                            500,
                            format!("direct upload ended in state {}", String::from(other)),
                        ),
                    };
                    return Err(err);
                }
            }

            if attempt == self.poll.max_attempts {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NimbusError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.poll.max_delay);
        }

        warn!(
            upload_id,
            attempts = self.poll.max_attempts,
            "direct upload completion could not be confirmed"
        );
        Ok(None)
    }
}

/// `"abc"` → `abc`. Unquoted values pass through.
pub fn strip_etag_quotes(etag: &str) -> &str {
    let trimmed = etag.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
}
