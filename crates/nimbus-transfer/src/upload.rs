//! Push-based chunked upload with streaming encryption.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use nimbus_core::keys::{FileKeyVersion, UserPublicKey};
use nimbus_core::types::{CompleteUploadRequest, FileUploadRequest, Node, TransferDescriptor};
use nimbus_core::{NimbusError, NimbusResult};
use nimbus_crypto::{generate_file_key, wrap_file_key, ChunkCodec, FileEncryptionCipher, PlainFileKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listener::{ProgressThrottle, TransferListener};
use crate::s3::{PollPolicy, S3Coordinator};
use crate::session::Session;

/// Smallest part size accepted by direct-storage multipart uploads.
pub const S3_MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Created,
    Started,
    Writing,
    Completing,
    Completed,
    Canceled,
    Failed,
    Closed,
}

enum Dispatch {
    Standard { upload_id: String },
    Direct(S3Coordinator),
}

/// One file upload. Owned by a single task.
///
/// Writes are buffered; every time the buffer grows past the chunk size one
/// full chunk is encrypted and sent. [`complete`](Self::complete) sends the
/// remainder as the final chunk, seals the cipher and commits the file.
pub struct UploadEngine {
    session: Arc<Session>,
    descriptor: TransferDescriptor,
    request: FileUploadRequest,
    recipient: Option<UserPublicKey>,
    state: UploadState,
    buffer: BytesMut,
    file_key: Option<PlainFileKey>,
    codec: Option<FileEncryptionCipher>,
    dispatch: Option<Dispatch>,
    chunks_sent: u32,
    sent: u64,
    cancel: CancellationToken,
    listener: Option<Arc<dyn TransferListener>>,
    throttle: ProgressThrottle,
}

impl UploadEngine {
    /// `recipient` is the public key the file key gets wrapped for; `Some`
    /// makes this an encrypted upload.
    pub fn new(
        session: Arc<Session>,
        request: FileUploadRequest,
        recipient: Option<UserPublicKey>,
        cancel: CancellationToken,
    ) -> Self {
        let config = session.config();
        let mut descriptor = TransferDescriptor::new(
            uuid::Uuid::new_v4().to_string(),
            None,
            config.chunk_size.max(1),
        );
        descriptor.total_length = request.size;
        let throttle = ProgressThrottle::new(config.progress_interval());
        Self {
            session,
            descriptor,
            request,
            recipient,
            state: UploadState::Created,
            buffer: BytesMut::new(),
            file_key: None,
            codec: None,
            dispatch: None,
            chunks_sent: 0,
            sent: 0,
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

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    /// Effective chunk size; raised for direct-storage uploads by `start`.
    pub fn chunk_size(&self) -> u64 {
        self.descriptor.chunk_size
    }

    /// Plaintext bytes accepted through `write`.
    pub fn offset(&self) -> u64 {
        self.descriptor.offset
    }

    /// Bytes sent to the service so far.
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    pub fn uses_direct_upload(&self) -> bool {
        matches!(self.dispatch, Some(Dispatch::Direct(_)))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The file key, once generated. Carries the tag after `complete`.
    pub fn file_key(&self) -> Option<&PlainFileKey> {
        self.file_key.as_ref()
    }

    pub async fn start(&mut self) -> NimbusResult<()> {
        if self.state != UploadState::Created {
            return Err(NimbusError::State(format!(
                "upload already started (state {:?})",
                self.state
            )));
        }
        let result = self.start_inner().await;
        self.settle(result)
    }

    async fn start_inner(&mut self) -> NimbusResult<()> {
        if self.recipient.is_some() {
            let key = generate_file_key(FileKeyVersion::Aes256Gcm);
            self.codec = Some(FileEncryptionCipher::new(&key)?);
            self.file_key = Some(key);
        }

        let direct = S3Coordinator::is_enabled(&self.session, &self.cancel).await?;
        if direct {
            self.descriptor.chunk_size = self.descriptor.chunk_size.max(S3_MIN_CHUNK_SIZE);
            self.request.direct_s3_upload = Some(true);
        }

        let api = self.session.api();
        let request = &self.request;
        let upload = self
            .session
            .call(&self.cancel, |token| async move {
                api.create_file_upload(&token, request).await
            })
            .await?;

        self.dispatch = Some(if direct {
            let poll = PollPolicy::from_config(self.session.config());
            Dispatch::Direct(S3Coordinator::new(
                self.session.clone(),
                upload.upload_id.clone(),
                poll,
            ))
        } else {
            Dispatch::Standard {
                upload_id: upload.upload_id.clone(),
            }
        });
        self.state = UploadState::Started;

        info!(
            id = %self.descriptor.id,
            upload_id = %upload.upload_id,
            name = %self.request.name,
            encrypted = self.codec.is_some(),
            direct,
            chunk_size = self.descriptor.chunk_size,
            "upload started"
        );
        Ok(())
    }

    /// Buffer `data`, sending every full chunk that becomes available.
    pub async fn write(&mut self, data: &[u8]) -> NimbusResult<()> {
        self.ensure_writable()?;
        if self.cancel.is_cancelled() {
            return self.settle(Err(NimbusError::Canceled));
        }

        self.buffer.extend_from_slice(data);
        let advanced = self.descriptor.advance(data.len() as u64);
        self.settle(advanced)?;
        self.state = UploadState::Writing;

        let chunk_size = self.descriptor.chunk_size as usize;
        while self.buffer.len() > chunk_size {
            let chunk = self.buffer.split_to(chunk_size).freeze();
            let result = self.send_chunk(chunk, false).await;
            self.settle(result)?;
        }
        Ok(())
    }

    /// Send the remaining bytes as the final chunk and commit the file.
    ///
    /// A declared `size` must have been written in full.
    ///
    /// Returns the created node, or `None` when a direct-storage upload could
    /// not be confirmed within the poll budget.
    pub async fn complete(&mut self) -> NimbusResult<Option<Node>> {
        self.ensure_writable()?;
        self.state = UploadState::Completing;
        let result = self.complete_inner().await;
        let node = self.settle(result)?;
        self.state = UploadState::Completed;
        info!(
            id = %self.descriptor.id,
            bytes = self.descriptor.offset,
            chunks = self.chunks_sent,
            node_id = node.as_ref().map(|n| n.id),
            "upload completed"
        );
        Ok(node)
    }

    async fn complete_inner(&mut self) -> NimbusResult<Option<Node>> {
        if self.cancel.is_cancelled() {
            return Err(NimbusError::Canceled);
        }
        if let Some(declared) = self.descriptor.total_length {
            if self.descriptor.offset != declared {
                return Err(NimbusError::State(format!(
                    "upload declared {declared} bytes but {} were written",
                    self.descriptor.offset
                )));
            }
        }
        let last = self.buffer.split().freeze();
        self.send_chunk(last, true).await?;

        let wrapped = match (&self.file_key, &self.recipient) {
            (Some(key), Some(recipient)) => Some(wrap_file_key(key, recipient)?),
            _ => None,
        };

        let strategy = self.request.resolution_strategy;
        let keep_share_links = self.request.keep_share_links;
        match self.dispatch.as_mut() {
            Some(Dispatch::Standard { upload_id }) => {
                let api = self.session.api();
                let upload_id = upload_id.as_str();
                let request = CompleteUploadRequest {
                    resolution_strategy: strategy,
                    keep_share_links,
                    file_key: wrapped,
                };
                let request = &request;
                let node = self
                    .session
                    .call(&self.cancel, |token| async move {
                        api.complete_file_upload(&token, upload_id, request).await
                    })
                    .await?;
                Ok(Some(node))
            }
            Some(Dispatch::Direct(s3)) => {
                s3.complete(&self.cancel, strategy, keep_share_links, wrapped)
                    .await
            }
            None => Err(NimbusError::State("upload session missing".into())),
        }
    }

    /// Drop buffered data. Idempotent; later writes fail.
    pub fn close(&mut self) {
        if self.state != UploadState::Closed {
            debug!(id = %self.descriptor.id, from = ?self.state, "upload closed");
        }
        self.state = UploadState::Closed;
        self.buffer = BytesMut::new();
        self.codec = None;
    }

    fn ensure_writable(&self) -> NimbusResult<()> {
        match self.state {
            UploadState::Started | UploadState::Writing => Ok(()),
            UploadState::Created => Err(NimbusError::State("upload not started".into())),
            UploadState::Canceled => Err(NimbusError::Canceled),
            UploadState::Completing | UploadState::Completed => {
                Err(NimbusError::State("upload already completed".into()))
            }
            UploadState::Failed => Err(NimbusError::State("upload has failed".into())),
            UploadState::Closed => Err(NimbusError::State("upload is closed".into())),
        }
    }

    fn settle<T>(&mut self, result: NimbusResult<T>) -> NimbusResult<T> {
        if let Err(e) = &result {
            if e.is_canceled() {
                self.state = UploadState::Canceled;
                self.throttle.cancel();
            } else {
                self.state = UploadState::Failed;
            }
        }
        result
    }

    /// Encrypt (sealing the cipher when `last`) and send one chunk.
    async fn send_chunk(&mut self, plain: Bytes, last: bool) -> NimbusResult<()> {
        if self.cancel.is_cancelled() {
            return Err(NimbusError::Canceled);
        }

        let payload = match self.codec.as_mut() {
            Some(codec) => {
                let mut out = codec.process_chunk(&plain)?;
                if last {
                    let sealed = codec.finalize()?;
                    out.extend_from_slice(&sealed.bytes);
                    if let Some(key) = self.file_key.as_mut() {
                        key.set_tag(sealed.tag);
                    }
                }
                Bytes::from(out)
            }
            None => plain,
        };

        let offset = self.sent;
        let len = payload.len() as u64;
        let index = self.chunks_sent;
        match self.dispatch.as_mut() {
            Some(Dispatch::Standard { upload_id }) => {
                let api = self.session.api();
                let upload_id = upload_id.as_str();
                let payload = &payload;
                self.session
                    .call(&self.cancel, |token| async move {
                        api.upload_chunk(&token, upload_id, offset, payload.clone())
                            .await
                    })
                    .await?;
            }
            Some(Dispatch::Direct(s3)) => {
                s3.upload_part(&self.cancel, index, payload).await?;
            }
            None => return Err(NimbusError::State("upload session missing".into())),
        }

        self.chunks_sent += 1;
        self.sent += len;
        debug!(id = %self.descriptor.id, offset, bytes = len, last, "sent chunk");
        self.report_progress();
        Ok(())
    }

    fn report_progress(&mut self) {
        if self.cancel.is_cancelled() {
            self.throttle.cancel();
            return;
        }
        if let Some(listener) = &self.listener {
            if self.throttle.should_emit() {
                listener.on_running(&self.descriptor.id, self.sent, self.descriptor.total_length);
            }
        }
    }
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .field("chunks_sent", &self.chunks_sent)
            .field("buffered", &self.buffer.len())
            .field("encrypted", &self.recipient.is_some())
            .finish()
    }
}
