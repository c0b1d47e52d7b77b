//! Ordered background writer feeding a [`FileStore`].

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::rocks::{FileStore, StoreError};

enum PersistRequest {
    Save { path: String, content: String },
    Flush(oneshot::Sender<Result<(), StoreError>>),
    Close(oneshot::Sender<()>),
}

/// Handle used to queue saves for the writer task.
///
/// Saves are applied in the order they were queued, so queueing under the
/// hub's lock keeps the store in the same last-write-wins order as memory.
/// The queue is bounded: when the database falls behind, new saves are
/// refused rather than buffered without limit.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistRequest>,
}

impl PersistHandle {
    /// Queue a full-content save. Never blocks.
    pub fn save(&self, path: &str, content: &str) -> Result<(), StoreError> {
        let request = PersistRequest::Save {
            path: path.to_string(),
            content: content.to_string(),
        };
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => StoreError::QueueFull,
            TrySendError::Closed(_) => StoreError::WriterClosed,
        })
    }

    /// Wait until every save queued so far is written and flushed.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::Flush(ack_tx))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        ack_rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Drain pending saves, flush, and release the database.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistRequest::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Move `store` onto a blocking writer thread and return its handle.
///
/// At most `queue_capacity` requests wait for the writer at once.
pub fn spawn_writer(store: FileStore, queue_capacity: usize) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(queue_capacity.max(1));

    let task = tokio::task::spawn_blocking(move || {
        while let Some(request) = rx.blocking_recv() {
            match request {
                PersistRequest::Save { path, content } => match store.save_file(&path, &content) {
                    Ok(meta) => log::debug!(
                        "Persisted {path} rev {} ({} -> {} bytes)",
                        meta.revision,
                        meta.size,
                        meta.compressed_size
                    ),
                    Err(e) => log::error!("Failed to persist {path}: {e}"),
                },
                PersistRequest::Flush(ack) => {
                    let _ = ack.send(store.sync());
                }
                PersistRequest::Close(ack) => {
                    if let Err(e) = store.sync() {
                        log::error!("Failed to flush file store on close: {e}");
                    }
                    drop(store);
                    let _ = ack.send(());
                    return;
                }
            }
        }
        if let Err(e) = store.sync() {
            log::error!("Failed to flush file store: {e}");
        }
    });

    (PersistHandle { tx }, task)
}
