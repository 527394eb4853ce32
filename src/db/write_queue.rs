//! Serial write queue for one database path.
//!
//! Operations submitted to a [`WriteQueue`] run one at a time, strictly in
//! submission order, on a background worker that owns the path's write
//! handle for the duration of each operation (it holds the path's exclusive
//! lock while running one).
//!
//! Dropping a [`QueuedWrite`] before the worker reaches it removes the
//! operation from the queue. Dropping it after pickup does not interrupt
//! the statement; its result is discarded.

use crate::db::coordinator::PathLock;
use crate::db::registry::DbHandle;
use crate::error::{DbError, DbResult};
use crate::models::QueryOutput;
use futures_util::future::BoxFuture;
use sqlx::SqliteConnection;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An operation run by the queue worker against the write connection.
pub type WriteOp = Box<
    dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<QueryOutput>> + Send,
>;

/// Box a closure as a [`WriteOp`].
///
/// The bound lets the compiler infer the closure's higher-ranked signature,
/// which a bare `Box::new(|conn| ...)` does not.
pub fn write_op<F>(f: F) -> WriteOp
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<QueryOutput>>
        + Send
        + 'static,
{
    Box::new(f)
}

/// What happens to pending operations when a queue stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Run every pending operation, then stop.
    #[default]
    Drain,
    /// Fail every pending operation with `Cancelled`; the one already
    /// running completes.
    Cancel,
}

struct QueueItem {
    seq: u64,
    op: WriteOp,
    reply: oneshot::Sender<DbResult<QueryOutput>>,
}

struct QueueInner {
    path: String,
    sender: StdMutex<Option<mpsc::UnboundedSender<QueueItem>>>,
    next_seq: AtomicU64,
    cancelled: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a path's write queue. Clones share the same worker.
#[derive(Clone)]
pub struct WriteQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WriteQueue {
    /// Start a worker for `path` that runs operations on `handle`.
    pub fn spawn(path: &str, handle: DbHandle, lock: Arc<PathLock>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(
            path.to_string(),
            receiver,
            handle,
            lock,
            Arc::clone(&cancelled),
        ));
        debug!(path = %path, "Write queue started");

        Self {
            inner: Arc::new(QueueInner {
                path: path.to_string(),
                sender: StdMutex::new(Some(sender)),
                next_seq: AtomicU64::new(0),
                cancelled,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// True until shutdown starts.
    pub fn is_open(&self) -> bool {
        self.sender()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    fn sender(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<QueueItem>>> {
        self.inner.sender.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Submit an operation. The returned future resolves with its result.
    pub fn submit(&self, op: WriteOp) -> DbResult<QueuedWrite> {
        let (reply, receiver) = oneshot::channel();
        let guard = self.sender();
        let Some(sender) = guard.as_ref() else {
            return Err(self.closed_error());
        };
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        sender
            .send(QueueItem { seq, op, reply })
            .map_err(|_| self.closed_error())?;
        debug!(path = %self.inner.path, seq, "Write queued");
        Ok(QueuedWrite { seq, receiver })
    }

    fn closed_error(&self) -> DbError {
        DbError::cancelled(format!("write queue for '{}' is shut down", self.inner.path))
    }

    /// Stop accepting operations and wait for the worker to finish.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        if mode == ShutdownMode::Cancel {
            self.inner.cancelled.store(true, Ordering::Release);
        }
        let sender = self.sender().take();
        drop(sender);

        let worker = self.inner.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(path = %self.inner.path, error = %e, "Write queue worker ended abnormally");
            }
        }
        info!(path = %self.inner.path, mode = ?mode, "Write queue stopped");
    }
}

async fn run_worker(
    path: String,
    mut receiver: mpsc::UnboundedReceiver<QueueItem>,
    handle: DbHandle,
    lock: Arc<PathLock>,
    cancelled: Arc<AtomicBool>,
) {
    while let Some(item) = receiver.recv().await {
        let QueueItem { seq, op, reply } = item;

        if cancelled.load(Ordering::Acquire) {
            let _ = reply.send(Err(DbError::cancelled(format!(
                "queued write {} on '{}' discarded at shutdown",
                seq, path
            ))));
            continue;
        }
        if reply.is_closed() {
            debug!(path = %path, seq, "Skipping write cancelled before pickup");
            continue;
        }

        let result = run_item(&handle, &lock, op).await;
        if let Err(e) = &result {
            debug!(path = %path, seq, error = %e, "Queued write failed");
        }
        if reply.send(result).is_err() {
            debug!(path = %path, seq, "Caller gone, result of queued write discarded");
        }
    }
    debug!(path = %path, "Write queue worker exiting");
}

async fn run_item(handle: &DbHandle, lock: &Arc<PathLock>, op: WriteOp) -> DbResult<QueryOutput> {
    let _exclusive = lock.write().await?;
    let mut conn = handle.acquire().await?;
    op(&mut *conn).await
}

/// Pending result of a queued operation.
#[derive(Debug)]
pub struct QueuedWrite {
    seq: u64,
    receiver: oneshot::Receiver<DbResult<QueryOutput>>,
}

impl QueuedWrite {
    /// Position of the operation in its queue's submission order.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for QueuedWrite {
    type Output = DbResult<QueryOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let seq = self.seq;
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(DbError::cancelled(format!(
                    "queued write {} was dropped by its worker",
                    seq
                )))
            })
        })
    }
}
