//! Per-database concurrency coordination.
//!
//! Every open path gets a [`PathLock`]: readers share it, writers take it
//! exclusively. The first reader in acquires the exclusion permit on behalf
//! of all readers and the last reader out releases it, so readers never
//! block each other while any writer waits for the room to empty.
//!
//! The coordinator also owns the per-path write queues.

use crate::db::registry::DbHandle;
use crate::db::write_queue::{ShutdownMode, WriteQueue};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

#[derive(Debug, Default)]
struct ReaderState {
    count: usize,
    permit: Option<OwnedSemaphorePermit>,
}

/// Reader/writer exclusion for one database path.
#[derive(Debug)]
pub struct PathLock {
    /// Serializes reader entry so only one reader ever waits for the room.
    entry: Mutex<()>,
    room: Arc<Semaphore>,
    readers: StdMutex<ReaderState>,
}

impl Default for PathLock {
    fn default() -> Self {
        Self::new()
    }
}

impl PathLock {
    pub fn new() -> Self {
        Self {
            entry: Mutex::new(()),
            room: Arc::new(Semaphore::new(1)),
            readers: StdMutex::new(ReaderState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ReaderState> {
        self.readers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter a shared read section.
    pub async fn read(self: &Arc<Self>) -> DbResult<ReadGuard> {
        let _entry = self.entry.lock().await;

        {
            let mut state = self.state();
            if state.count > 0 {
                state.count += 1;
                return Ok(ReadGuard {
                    lock: Arc::clone(self),
                });
            }
        }

        // First reader: nobody can leave (count is 0) and nobody else can
        // enter (entry is held) until the permit is recorded.
        let permit = Arc::clone(&self.room)
            .acquire_owned()
            .await
            .map_err(|_| DbError::internal("path lock closed"))?;
        let mut state = self.state();
        state.count += 1;
        state.permit = Some(permit);
        Ok(ReadGuard {
            lock: Arc::clone(self),
        })
    }

    /// Enter an exclusive write section. Waits for every reader to leave.
    pub async fn write(self: &Arc<Self>) -> DbResult<WriteGuard> {
        let permit = Arc::clone(&self.room)
            .acquire_owned()
            .await
            .map_err(|_| DbError::internal("path lock closed"))?;
        Ok(WriteGuard { _permit: permit })
    }

    /// Number of readers currently inside.
    pub fn reader_count(&self) -> usize {
        self.state().count
    }

    /// True while a writer (or the reader group) holds the room.
    pub fn is_held(&self) -> bool {
        self.room.available_permits() == 0
    }
}

/// Shared read section; the last one dropped lets writers in.
#[derive(Debug)]
pub struct ReadGuard {
    lock: Arc<PathLock>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let released = {
            let mut state = self.lock.state();
            state.count = state.count.saturating_sub(1);
            if state.count == 0 {
                state.permit.take()
            } else {
                None
            }
        };
        drop(released);
    }
}

/// Exclusive write section.
#[derive(Debug)]
pub struct WriteGuard {
    _permit: OwnedSemaphorePermit,
}

/// Locks and write queues for every path.
#[derive(Debug, Default)]
pub struct ConcurrencyCoordinator {
    locks: RwLock<HashMap<String, Arc<PathLock>>>,
    queues: RwLock<HashMap<String, WriteQueue>>,
}

impl ConcurrencyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `path`, created on first use.
    pub async fn path_lock(&self, path: &str) -> Arc<PathLock> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(path) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(path.to_string()).or_default())
    }

    pub async fn read_section(&self, path: &str) -> DbResult<ReadGuard> {
        let lock = self.path_lock(path).await;
        debug!(path = %path, readers = lock.reader_count(), "Entering read section");
        lock.read().await
    }

    pub async fn exclusive_section(&self, path: &str) -> DbResult<WriteGuard> {
        let lock = self.path_lock(path).await;
        debug!(path = %path, "Waiting for exclusive section");
        lock.write().await
    }

    /// The write queue of `path`, spawning its worker on first use.
    pub async fn queue(&self, path: &str, handle: &DbHandle) -> WriteQueue {
        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(path) {
                if queue.is_open() {
                    return queue.clone();
                }
            }
        }

        let lock = self.path_lock(path).await;
        let mut queues = self.queues.write().await;
        match queues.get(path) {
            Some(queue) if queue.is_open() => queue.clone(),
            _ => {
                let queue = WriteQueue::spawn(path, handle.clone(), lock);
                queues.insert(path.to_string(), queue.clone());
                queue
            }
        }
    }

    /// Stop the write queue of `path`. Returns `false` if it had none.
    pub async fn shutdown_queue(&self, path: &str, mode: ShutdownMode) -> bool {
        let queue = self.queues.write().await.remove(path);
        match queue {
            Some(queue) => {
                queue.shutdown(mode).await;
                true
            }
            None => false,
        }
    }

    /// Drain the queue of `path` and drop its coordination state.
    pub async fn forget(&self, path: &str) {
        self.shutdown_queue(path, ShutdownMode::Drain).await;
        self.locks.write().await.remove(path);
    }

    /// Drain every queue and drop all coordination state.
    pub async fn forget_all(&self) {
        let queues: Vec<WriteQueue> = self.queues.write().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.shutdown(ShutdownMode::Drain).await;
        }
        self.locks.write().await.clear();
    }

    /// Move coordination state to a renamed path.
    pub async fn rename(&self, old: &str, new: &str) {
        {
            let mut locks = self.locks.write().await;
            if let Some(lock) = locks.remove(old) {
                locks.insert(new.to_string(), lock);
            }
        }
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.remove(old) {
            queues.insert(new.to_string(), queue);
        }
    }
}
