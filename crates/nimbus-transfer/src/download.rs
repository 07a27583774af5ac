//! Pull-based ranged download with streaming decryption.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use nimbus_core::types::{NodeId, TransferDescriptor};
use nimbus_core::{NimbusError, NimbusResult};
use nimbus_crypto::{ChunkCodec, FileDecryptionCipher, PlainFileKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listener::{ProgressThrottle, TransferListener};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Created,
    Started,
    Reading,
    Refilling,
    Finished,
    Canceled,
    Failed,
    Closed,
}

/// One file download. Owned by a single task.
///
/// Bytes are fetched one chunk at a time into an internal buffer and handed
/// out through [`read`](Self::read). `offset` is the delivered position;
/// `fetched` is how far the remote ranges have been consumed.
pub struct DownloadEngine {
    session: Arc<Session>,
    descriptor: TransferDescriptor,
    state: DownloadState,
    file_key: Option<PlainFileKey>,
    codec: Option<FileDecryptionCipher>,
    url: Option<String>,
    buffer: BytesMut,
    fetched: u64,
    finalized: bool,
    cancel: CancellationToken,
    listener: Option<Arc<dyn TransferListener>>,
    throttle: ProgressThrottle,
}

impl DownloadEngine {
    pub fn new(
        session: Arc<Session>,
        node_id: NodeId,
        file_key: Option<PlainFileKey>,
        cancel: CancellationToken,
    ) -> Self {
        let config = session.config();
        let descriptor = TransferDescriptor::new(
            uuid::Uuid::new_v4().to_string(),
            Some(node_id),
            config.chunk_size,
        );
        let throttle = ProgressThrottle::new(config.progress_interval());
        Self {
            session,
            descriptor,
            state: DownloadState::Created,
            file_key,
            codec: None,
            url: None,
            buffer: BytesMut::new(),
            fetched: 0,
            finalized: false,
            cancel,
            listener: None,
            throttle,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn set_listener(&mut self, listener: Arc<dyn TransferListener>) {
        self.listener = Some(listener);
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_encrypted(&self) -> bool {
        self.file_key.is_some()
    }

    /// Bytes delivered to the caller so far.
    pub fn offset(&self) -> u64 {
        self.descriptor.offset
    }

    pub fn total_length(&self) -> Option<u64> {
        self.descriptor.total_length
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve the size and a download URL; build the decrypt cipher.
    pub async fn start(&mut self) -> NimbusResult<()> {
        if self.state != DownloadState::Created {
            return Err(NimbusError::State(format!(
                "download already started (state {:?})",
                self.state
            )));
        }
        let result = self.start_inner().await;
        self.settle(result)
    }

    async fn start_inner(&mut self) -> NimbusResult<()> {
        if let Some(key) = &self.file_key {
            self.codec = Some(FileDecryptionCipher::new(key)?);
        }

        let node_id = self
            .descriptor
            .node_id
            .ok_or_else(|| NimbusError::State("download has no node id".into()))?;
        let api = self.session.api();
        let node = self
            .session
            .call(&self.cancel, |token| async move {
                api.get_node(&token, node_id).await
            })
            .await?;
        let total = node.size.unwrap_or(0);
        self.descriptor.total_length = Some(total);

        let url = self
            .session
            .call(&self.cancel, |token| async move {
                api.get_download_url(&token, node_id).await
            })
            .await?;
        self.url = Some(url);
        self.state = DownloadState::Started;

        info!(
            id = %self.descriptor.id,
            node_id,
            size = total,
            encrypted = self.codec.is_some(),
            "download started"
        );
        Ok(())
    }

    /// Fill `buf` from the stream. `Ok(0)` means end of file.
    ///
    /// A short read does not mean end of file; loop until `Ok(0)`.
    pub async fn read(&mut self, buf: &mut [u8]) -> NimbusResult<usize> {
        self.ensure_readable()?;
        if buf.is_empty() {
            return Ok(0);
        }

        while self.buffer.is_empty() {
            if self.at_end() {
                self.finish();
                return Ok(0);
            }
            let result = self.refill().await;
            self.settle(result)?;
        }

        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.deliver(n)?;
        Ok(n)
    }

    /// Skip up to `n` bytes; returns how many were skipped.
    ///
    /// Plain downloads jump over unfetched bytes without requesting them.
    /// Encrypted downloads still fetch and decrypt everything skipped.
    pub async fn skip(&mut self, n: u64) -> NimbusResult<u64> {
        self.ensure_readable()?;
        let mut skipped = 0u64;

        while skipped < n {
            if !self.buffer.is_empty() {
                let take = (n - skipped).min(self.buffer.len() as u64) as usize;
                self.deliver(take)?;
                skipped += take as u64;
                continue;
            }
            if self.at_end() {
                self.finish();
                break;
            }
            if self.codec.is_none() {
                let total = self.total();
                let jump = (n - skipped).min(total - self.fetched);
                self.fetched += jump;
                self.descriptor.advance(jump)?;
                skipped += jump;
                if self.fetched == total {
                    self.finalized = true;
                }
                continue;
            }
            let result = self.refill().await;
            self.settle(result)?;
        }

        debug!(id = %self.descriptor.id, requested = n, skipped, "skip");
        Ok(skipped)
    }

    /// Bytes still obtainable: buffered plus not yet fetched.
    pub fn available(&self) -> u64 {
        match self.descriptor.total_length {
            None => 0,
            Some(total) => {
                let unflushed = self.codec.as_ref().map_or(0, |c| c.unflushed_len() as u64);
                self.buffer.len() as u64 + (total - self.fetched) + unflushed
            }
        }
    }

    /// Release the buffer. Idempotent; later reads fail.
    pub fn close(&mut self) {
        if self.state != DownloadState::Closed {
            debug!(id = %self.descriptor.id, from = ?self.state, "download closed");
        }
        self.state = DownloadState::Closed;
        self.buffer = BytesMut::new();
        self.codec = None;
    }

    fn total(&self) -> u64 {
        self.descriptor.total_length.unwrap_or(0)
    }

    fn at_end(&self) -> bool {
        self.fetched >= self.total() && self.finalized
    }

    fn ensure_readable(&self) -> NimbusResult<()> {
        match self.state {
            DownloadState::Started
            | DownloadState::Reading
            | DownloadState::Refilling
            | DownloadState::Finished => Ok(()),
            DownloadState::Created => Err(NimbusError::State("download not started".into())),
            DownloadState::Canceled => Err(NimbusError::Canceled),
            DownloadState::Failed => Err(NimbusError::State("download has failed".into())),
            DownloadState::Closed => Err(NimbusError::State("download is closed".into())),
        }
    }

    fn deliver(&mut self, n: usize) -> NimbusResult<()> {
        self.buffer.advance(n);
        self.descriptor.advance(n as u64)?;
        if self.state != DownloadState::Finished {
            self.state = DownloadState::Reading;
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.state != DownloadState::Finished {
            info!(id = %self.descriptor.id, bytes = self.descriptor.offset, "download finished");
            self.state = DownloadState::Finished;
        }
    }

    /// Record a terminal state for an error and pass it through.
    fn settle<T>(&mut self, result: NimbusResult<T>) -> NimbusResult<T> {
        if let Err(e) = &result {
            if e.is_canceled() {
                self.state = DownloadState::Canceled;
                self.throttle.cancel();
            } else {
                self.state = DownloadState::Failed;
            }
        }
        result
    }

    async fn refill(&mut self) -> NimbusResult<()> {
        if self.cancel.is_cancelled() {
            return Err(NimbusError::Canceled);
        }
        self.state = DownloadState::Refilling;

        let total = self.total();
        let remaining = total - self.fetched;
        if remaining == 0 {
            return self.finalize_codec();
        }

        let size = remaining.min(self.descriptor.chunk_size.max(1));
        let offset = self.fetched;
        let api = self.session.api();
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| NimbusError::State("download URL not resolved".into()))?;

        let mut data = self
            .session
            .call_unauthenticated(&self.cancel, || async move {
                api.download_range(url, offset, size).await
            })
            .await?;

        if data.len() as u64 > size {
            data.truncate(size as usize);
        }
        if data.is_empty() {
            return Err(NimbusError::Network(format!(
                "unexpected end of range at offset {offset} ({remaining} bytes remaining)"
            )));
        }
        self.fetched += data.len() as u64;

        match self.codec.as_mut() {
            Some(codec) => {
                let plain = codec.process_chunk(&data)?;
                self.buffer.extend_from_slice(&plain);
            }
            None => self.buffer.extend_from_slice(&data),
        }
        debug!(id = %self.descriptor.id, offset, bytes = data.len(), "fetched range");

        if self.fetched == total {
            self.finalize_codec()?;
        }
        self.state = DownloadState::Reading;
        self.report_progress();
        Ok(())
    }

    fn finalize_codec(&mut self) -> NimbusResult<()> {
        if self.finalized {
            return Ok(());
        }
        if let Some(codec) = self.codec.as_mut() {
            let last = codec.finalize()?;
            self.buffer.extend_from_slice(&last.bytes);
        }
        self.finalized = true;
        Ok(())
    }

    fn report_progress(&mut self) {
        if self.cancel.is_cancelled() {
            self.throttle.cancel();
            return;
        }
        if let Some(listener) = &self.listener {
            if self.throttle.should_emit() {
                listener.on_running(
                    &self.descriptor.id,
                    self.fetched,
                    self.descriptor.total_length,
                );
            }
        }
    }
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .field("fetched", &self.fetched)
            .field("buffered", &self.buffer.len())
            .field("encrypted", &self.file_key.is_some())
            .finish()
    }
}
