//! Drive engines against local I/O, inline or as cancellable tasks.

use std::sync::Arc;

use nimbus_core::types::Node;
use nimbus_core::{NimbusError, NimbusResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::download::{DownloadEngine, DownloadState};
use crate::listener::TransferListener;
use crate::upload::{UploadEngine, UploadState};

/// Copy a whole download into `writer`, `block_size` bytes at a time.
///
/// Starts the engine if needed and closes it on success. Returns the
/// number of bytes written.
pub async fn download_to_writer<W>(
    engine: &mut DownloadEngine,
    writer: &mut W,
    block_size: usize,
) -> NimbusResult<u64>
where
    W: AsyncWrite + Unpin,
{
    if engine.state() == DownloadState::Created {
        engine.start().await?;
    }
    let mut block = vec![0u8; block_size.max(1)];
    let mut written = 0u64;
    loop {
        let n = engine.read(&mut block).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&block[..n]).await?;
        written += n as u64;
    }
    writer.flush().await?;
    engine.close();
    Ok(written)
}

/// Feed `reader` into an upload until EOF, then complete it.
pub async fn upload_from_reader<R>(
    engine: &mut UploadEngine,
    reader: &mut R,
    block_size: usize,
) -> NimbusResult<Option<Node>>
where
    R: AsyncRead + Unpin,
{
    if engine.state() == UploadState::Created {
        engine.start().await?;
    }
    let mut block = vec![0u8; block_size.max(1)];
    loop {
        if engine.cancel_token().is_cancelled() {
            return Err(NimbusError::Canceled);
        }
        let n = reader.read(&mut block).await?;
        if n == 0 {
            break;
        }
        engine.write(&block[..n]).await?;
    }
    let node = engine.complete().await?;
    engine.close();
    Ok(node)
}

/// A transfer running on its own task.
pub struct TransferHandle<T> {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<NimbusResult<T>>,
}

impl<T> TransferHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation. The task stops at its next network call or
    /// buffer boundary and reports `on_canceled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> NimbusResult<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(NimbusError::Canceled),
            Err(e) => Err(NimbusError::State(format!("transfer task panicked: {e}"))),
        }
    }
}

/// Run a download on a new task with exactly one terminal callback.
pub fn spawn_download<W>(
    mut engine: DownloadEngine,
    mut writer: W,
    block_size: usize,
    listener: Arc<dyn TransferListener>,
) -> TransferHandle<u64>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = engine.id().to_string();
    let cancel = engine.cancel_token().clone();
    engine.set_listener(listener.clone());

    let task_id = id.clone();
    let task = tokio::spawn(async move {
        listener.on_started(&task_id);
        let result = download_to_writer(&mut engine, &mut writer, block_size).await;
        if result.is_err() {
            engine.close();
        }
        report_outcome(listener.as_ref(), &task_id, &result, None);
        result
    });

    TransferHandle { id, cancel, task }
}

/// Run an upload on a new task with exactly one terminal callback.
pub fn spawn_upload<R>(
    mut engine: UploadEngine,
    mut reader: R,
    block_size: usize,
    listener: Arc<dyn TransferListener>,
) -> TransferHandle<Option<Node>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let id = engine.id().to_string();
    let cancel = engine.cancel_token().clone();
    engine.set_listener(listener.clone());

    let task_id = id.clone();
    let task = tokio::spawn(async move {
        listener.on_started(&task_id);
        let result = upload_from_reader(&mut engine, &mut reader, block_size).await;
        if result.is_err() {
            engine.close();
        }
        let node = result.as_ref().ok().and_then(|n| n.as_ref());
        report_outcome(listener.as_ref(), &task_id, &result, node);
        result
    });

    TransferHandle { id, cancel, task }
}

fn report_outcome<T>(
    listener: &dyn TransferListener,
    id: &str,
    result: &NimbusResult<T>,
    node: Option<&Node>,
) {
    match result {
        Ok(_) => {
            info!(id, "transfer finished");
            listener.on_finished(id, node);
        }
        Err(NimbusError::Canceled) => {
            info!(id, "transfer canceled");
            listener.on_canceled(id);
        }
        Err(e) => {
            error!(id, error = %e, "transfer failed");
            listener.on_failed(id, e);
        }
    }
}
