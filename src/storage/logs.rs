use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::Stream;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};

use crate::daemon::events::{DaemonEvent, EventBus};
use crate::errors::DaemonError;
use crate::models::ExecutionStatus;
use crate::storage::{ExecutionStore, LogStore};

/// How often a tail reader re-checks the file for appended bytes.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(150);
const READ_CHUNK_SIZE: usize = 8192;
/// Buffered chunks per reader before backpressure applies.
const STREAM_BUFFER: usize = 64;

/// Filesystem log store: one append-only `{id}.log` file per execution
/// under `data_dir/logs/`.
pub struct FsLogStore {
    logs_dir: PathBuf,
    store: Arc<dyn ExecutionStore>,
    bus: EventBus,
}

impl FsLogStore {
    /// Create a new FsLogStore rooted at `data_dir/logs/`.
    pub async fn new(
        data_dir: PathBuf,
        store: Arc<dyn ExecutionStore>,
        bus: EventBus,
    ) -> Result<Self> {
        let logs_dir = data_dir.join("logs");
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .context("Failed to create logs directory")?;
        Ok(Self {
            logs_dir,
            store,
            bus,
        })
    }

    fn log_path(&self, id: i64) -> PathBuf {
        self.logs_dir.join(format!("{}.log", id))
    }
}

/// Append handle for an execution's log. Exactly one exists per
/// execution, held by the runner for the duration of the pipeline.
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    /// Append a chunk and flush it so concurrently attached tail
    /// readers observe the bytes promptly.
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .context("Failed to append to log file")?;
        self.file.flush().await.context("Failed to flush log file")?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.file.flush().await.context("Failed to flush log file")?;
        Ok(())
    }
}

/// Idempotent cancellation handle for a log stream: the first trigger
/// wins, later calls are no-ops.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Byte stream over an execution log, produced by [`LogStore::read_log`].
///
/// For a finished execution this yields the complete file and ends; the
/// stop handle is a no-op. For a running execution it tails the file
/// until `stop()` is called, the stream is dropped, or the execution
/// finishes — whichever comes first — draining bytes already on disk
/// before terminating.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    stop: StopHandle,
}

impl LogStream {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

impl Stream for LogStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn create_log(&self, id: i64) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.log_path(id))
            .await
            .with_context(|| format!("Failed to create log file for execution {}", id))?;
        Ok(())
    }

    async fn open_for_write(&self, id: i64) -> Result<LogWriter> {
        let file = OpenOptions::new()
            .append(true)
            .open(self.log_path(id))
            .await
            .with_context(|| format!("Failed to open log file for execution {}", id))?;
        Ok(LogWriter { file })
    }

    async fn read_log(&self, id: i64) -> Result<LogStream> {
        // Subscribe before the running check so a finish landing in
        // between cannot be missed by the tail loop.
        let events = self.bus.subscribe();
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("execution {} not found", id)))?;

        let file = File::open(self.log_path(id))
            .await
            .with_context(|| format!("Failed to open log file for execution {}", id))?;

        let (stop, stop_rx) = StopHandle::new();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        if execution.is_running() {
            let store = Arc::clone(&self.store);
            tokio::spawn(tail_log(id, file, tx, events, stop_rx, store));
        } else {
            drop(events);
            tokio::spawn(read_full(file, tx));
        }

        Ok(LogStream { rx, stop })
    }
}

/// Pump the whole file once. The log of a finished execution is
/// immutable, so EOF is the end of the stream.
async fn read_full(mut file: File, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let _ = drain(&mut file, &tx).await;
}

/// Send every byte currently readable past the file's own cursor.
/// Returns false when the receiving side is gone.
async fn drain(file: &mut File, tx: &mpsc::Sender<io::Result<Vec<u8>>>) -> bool {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => return true,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return false;
            }
        }
    }
}

/// Tail loop for a running execution's log.
///
/// Terminates on the first of: `stop()` (or every stop handle dropped),
/// an `ExecutionUpdated` event marking this execution finished, or bus
/// shutdown. Bytes written up to that point are drained before the
/// stream ends, so a finish racing the first read loses no data.
async fn tail_log(
    id: i64,
    mut file: File,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    mut events: broadcast::Receiver<DaemonEvent>,
    mut stop_rx: watch::Receiver<bool>,
    store: Arc<dyn ExecutionStore>,
) {
    loop {
        if !drain(&mut file, &tx).await {
            return;
        }
        if *stop_rx.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = stop_rx.changed() => {
                let _ = changed;
                break;
            }
            event = events.recv() => match event {
                Ok(DaemonEvent::ExecutionUpdated { execution })
                    if execution.id == id
                        && execution.status == ExecutionStatus::Finished =>
                {
                    break;
                }
                Ok(DaemonEvent::Shutdown) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // The finish event may be among the dropped
                    // messages; fall back to the store predicate.
                    match store.get_execution(id).await {
                        Ok(Some(execution)) if execution.is_running() => {}
                        _ => break,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
        }
    }

    // Final drain: bytes on disk before the terminating trigger still
    // reach the reader.
    let _ = drain(&mut file, &tx).await;
}
