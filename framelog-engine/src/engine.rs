//! Asynchronous writer engine.
//!
//! Producers hand records to [`WriterEngine`] through a bounded queue. A
//! single writer task owns the active file, appends frames in admission
//! order, rotates files and resolves each producer once its record is
//! durable according to the fsync policy.

use crate::config::{Backpressure, EngineConfig};
use crate::error::EngineError;
use crate::writer::Writer;
use framelog_codec::{BinaryCodec, DigestAdapter, HexCodec, Sha256Digest};
use framelog_store::{ChainLink, LogRecord};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// Number of digest bytes in a stream id.
const STREAM_ID_LEN: usize = 12;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for records.
    Idle,
    /// Processing a batch.
    Writing,
    /// Closing the active file and opening the next one.
    RotationPending,
    /// The next file could not be created; appends fail until it can.
    Degraded,
    /// Shut down.
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Writing => "writing",
            EngineState::RotationPending => "rotation_pending",
            EngineState::Degraded => "degraded",
            EngineState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Records appended and committed.
    pub records_appended: u64,
    /// Bytes of committed frames.
    pub bytes_written: u64,
    /// Completed file rotations.
    pub rotations: u64,
    /// Fsync operations.
    pub fsyncs: u64,
    /// Records skipped because the producer went away.
    pub cancelled: u64,
    /// Records that failed.
    pub failed: u64,
}

/// Where a record ended up.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub sequence: u64,
    /// Rotation index of the file holding the record.
    pub file_index: u64,
    pub path: PathBuf,
    /// Offset of the frame within the file.
    pub offset: u64,
    /// Size of the frame in bytes.
    pub len: u64,
    pub link: ChainLink,
}

/// Result channel of one append.
///
/// Holds the record's queue slot, so a record counts against the queue
/// capacity until its producer is resolved.
pub(crate) struct AppendReply {
    tx: oneshot::Sender<Result<AppendResult, EngineError>>,
    _slot: OwnedSemaphorePermit,
}

impl AppendReply {
    /// Returns true if the producer dropped its [`PendingAppend`].
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves the producer and frees the queue slot.
    pub(crate) fn send(self, result: Result<AppendResult, EngineError>) {
        let _ = self.tx.send(result);
    }
}

/// Commands processed by the writer, in queue order.
pub(crate) enum Command {
    Append { record: LogRecord, reply: AppendReply },
    Flush { reply: oneshot::Sender<Result<(), EngineError>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// State shared between the engine handle and the writer.
pub(crate) struct Shared {
    pub(crate) closed: AtomicBool,
    pub(crate) state: watch::Sender<EngineState>,
    pub(crate) last_sequence: parking_lot::Mutex<Option<u64>>,
    pub(crate) records_appended: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) rotations: AtomicU64,
    pub(crate) fsyncs: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) failed: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            closed: AtomicBool::new(false),
            state,
            last_sequence: parking_lot::Mutex::new(None),
            records_appended: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            fsyncs: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_state(&self, next: EngineState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// A record admitted to the queue but not yet resolved.
///
/// Resolves once the writer has appended (and, per policy, synced) the record.
/// Dropping it before the writer reaches the record cancels the record.
#[must_use = "dropping a PendingAppend cancels the record"]
#[derive(Debug)]
pub struct PendingAppend {
    rx: oneshot::Receiver<Result<AppendResult, EngineError>>,
}

impl Future for PendingAppend {
    type Output = Result<AppendResult, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(EngineError::EngineClosed)))
    }
}

/// Single-writer log engine for one stream.
pub struct WriterEngine {
    tx: mpsc::Sender<Command>,
    /// One permit per queue slot; held until the record is resolved.
    slots: Arc<Semaphore>,
    queue_capacity: usize,
    shared: Arc<Shared>,
    backpressure: Backpressure,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stream_id: String,
    dir: PathBuf,
}

impl WriterEngine {
    /// Opens the stream, resuming its latest file, and starts the writer task.
    ///
    /// Must be called within a tokio runtime.
    pub async fn open(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        create_dir(&config.dir, config.dir_mode).map_err(framelog_store::StoreError::from)?;

        let stream_id = stream_id(&config.dir, config.naming.name());
        let span = tracing::info_span!("framelog", stream = %stream_id);
        let shared = Arc::new(Shared::new());

        let writer = {
            let _enter = span.enter();
            Writer::open(&config, shared.clone())?
        };

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let worker = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            writer.run(rx);
        });

        Ok(Self {
            tx,
            slots: Arc::new(Semaphore::new(config.queue_capacity)),
            queue_capacity: config.queue_capacity,
            shared,
            backpressure: config.backpressure,
            worker: parking_lot::Mutex::new(Some(worker)),
            stream_id,
            dir: config.dir,
        })
    }

    /// Admits a record to the queue.
    ///
    /// With [`Backpressure::Suspend`] this waits for queue capacity; with
    /// [`Backpressure::FailFast`] a full queue returns [`EngineError::QueueFull`].
    pub async fn submit(&self, record: LogRecord) -> Result<PendingAppend, EngineError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EngineError::EngineClosed);
        }

        let slot = match self.backpressure {
            Backpressure::Suspend => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::EngineClosed)?,
            Backpressure::FailFast => {
                self.slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::NoPermits => EngineError::QueueFull,
                        TryAcquireError::Closed => EngineError::EngineClosed,
                    })?
            }
        };

        let (tx, rx) = oneshot::channel();
        let command = Command::Append {
            record,
            reply: AppendReply { tx, _slot: slot },
        };
        match self.backpressure {
            Backpressure::Suspend => self
                .tx
                .send(command)
                .await
                .map_err(|_| EngineError::EngineClosed)?,
            Backpressure::FailFast => self.tx.try_send(command).map_err(|e| match e {
                TrySendError::Full(_) => EngineError::QueueFull,
                TrySendError::Closed(_) => EngineError::EngineClosed,
            })?,
        }

        Ok(PendingAppend { rx })
    }

    /// Appends a record and waits until it is written.
    pub async fn enqueue(&self, record: LogRecord) -> Result<AppendResult, EngineError> {
        self.submit(record).await?.await
    }

    /// Waits until every record admitted before this call is synced to disk.
    ///
    /// Always waits for queue capacity, whatever the backpressure mode.
    pub async fn flush(&self) -> Result<(), EngineError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EngineError::EngineClosed);
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { reply })
            .await
            .map_err(|_| EngineError::EngineClosed)?;
        rx.await.map_err(|_| EngineError::EngineClosed)?
    }

    /// Stops accepting records, drains the queue and closes the active file.
    ///
    /// Idempotent. Records admitted before the call are written; anything
    /// admitted concurrently fails with [`EngineError::EngineClosed`].
    pub async fn shutdown(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(stream = %self.stream_id, "Shutting down writer engine");
        }
        // Producers waiting for a slot fail with EngineClosed.
        self.slots.close();

        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }

        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(stream = %self.stream_id, "Writer task failed: {}", e);
                    self.shared.set_state(EngineState::Closed);
                }
            }
            None => {
                let mut state = self.shared.state.subscribe();
                let _ = state.wait_for(|s| *s == EngineState::Closed).await;
            }
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Highest committed sequence number of the stream, including previous runs.
    pub fn last_sequence(&self) -> Option<u64> {
        *self.shared.last_sequence.lock()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            records_appended: self.shared.records_appended.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            rotations: self.shared.rotations.load(Ordering::Relaxed),
            fsyncs: self.shared.fsyncs.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Hex id derived from the stream's directory and name.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of records admitted but not yet resolved.
    pub fn queued(&self) -> usize {
        self.queue_capacity - self.slots.available_permits()
    }
}

impl fmt::Debug for WriterEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterEngine")
            .field("stream_id", &self.stream_id)
            .field("dir", &self.dir)
            .field("state", &self.state())
            .finish()
    }
}

fn create_dir(dir: &Path, mode: Option<u32>) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir)
}

fn stream_id(dir: &Path, name: &str) -> String {
    let base = std::fs::canonicalize(dir)
        .unwrap_or_else(|_| dir.to_path_buf())
        .join(name);
    let digest = Sha256Digest.digest(base.to_string_lossy().as_bytes());
    HexCodec.encode(&digest[..STREAM_ID_LEN])
}
