//! Query history recording.
//!
//! The manager reports every executed statement (and every COMMIT/ROLLBACK it
//! issues) to an optional [`HistoryRecorder`]. Recording failures are logged
//! and never reach the caller of the statement.
//!
//! [`BufferedHistory`] is the bundled recorder: entries collect in a bounded
//! [`HistoryBuffer`] and are handed to a [`HistorySink`] in batches.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ManagerConfig;
use crate::error::{DbError, DbResult};
use crate::models::Params;

/// Result of the recorded statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum HistoryOutcome {
    Success,
    Failure(String),
}

/// One recorded statement.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub path: String,
    pub query: String,
    pub params: Params,
    /// Short description of the result, e.g. "3 row(s)"
    pub summary: Option<String>,
    pub outcome: HistoryOutcome,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(path: impl Into<String>, query: impl Into<String>, params: Params) -> Self {
        Self {
            path: path.into(),
            query: query.into(),
            params,
            summary: None,
            outcome: HistoryOutcome::Success,
            timestamp: Utc::now(),
        }
    }

    /// Entry for a COMMIT or ROLLBACK issued by the manager.
    pub fn control(path: impl Into<String>, statement: &str) -> Self {
        Self::new(path, statement, Params::None)
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_failure(mut self, error: &DbError) -> Self {
        self.outcome = HistoryOutcome::Failure(error.to_string());
        self
    }

    pub fn is_control(&self) -> bool {
        matches!(self.query.as_str(), "COMMIT" | "ROLLBACK")
    }

    /// Single-line JSON rendering for sinks that write JSON lines.
    pub fn to_json(&self) -> DbResult<String> {
        serde_json::to_string(self)
            .map_err(|e| DbError::history(format!("Failed to serialize history entry: {}", e)))
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timestamp = self.timestamp.to_rfc3339();
        if self.is_control() {
            return writeln!(f, "[{}]({}) : {}", timestamp, self.path, self.query);
        }
        writeln!(f, "[{}]({})", timestamp, self.path)?;
        writeln!(f, "{}", self.query)?;
        writeln!(f, "Input: {:?}", self.params)?;
        match &self.outcome {
            HistoryOutcome::Success => {
                writeln!(f, "Output: {}", self.summary.as_deref().unwrap_or("-"))
            }
            HistoryOutcome::Failure(e) => writeln!(f, "Error: {}", e),
        }
    }
}

/// Receives executed statements.
pub trait HistoryRecorder: Send + Sync {
    fn record(&self, entry: HistoryEntry) -> BoxFuture<'_, DbResult<()>>;

    /// Push out anything buffered. Called on manager shutdown.
    fn flush(&self) -> BoxFuture<'_, DbResult<()>>;
}

/// Destination for batches of history entries (a file writer, a table...).
pub trait HistorySink: Send + Sync {
    fn write_batch(&self, entries: Vec<HistoryEntry>) -> BoxFuture<'_, DbResult<()>>;
}

/// Result of [`HistoryBuffer::try_append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The buffer reached `max_length` and should be flushed.
    Full,
}

/// Bounded buffer with an overflow tolerance.
///
/// The buffer is full at `max_length` entries. Appends keep succeeding up
/// to `max_length + tolerance` (without limit when `tolerance` is `None`);
/// once the buffer is already beyond that, appends are refused.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: Vec<HistoryEntry>,
    max_length: usize,
    tolerance: Option<usize>,
}

impl HistoryBuffer {
    pub fn new(max_length: usize, tolerance: Option<usize>) -> Self {
        Self {
            entries: Vec::with_capacity(max_length),
            max_length,
            tolerance,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn tolerance(&self) -> Option<usize> {
        self.tolerance
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_length
    }

    pub fn is_tolerable(&self) -> bool {
        match self.tolerance {
            None => true,
            Some(tolerance) => self.entries.len() <= self.max_length + tolerance,
        }
    }

    pub fn try_append(&mut self, entry: HistoryEntry) -> DbResult<AppendOutcome> {
        if !self.is_tolerable() {
            return Err(DbError::history(format!(
                "History buffer holds {} entries, beyond its limit of {} + {}",
                self.entries.len(),
                self.max_length,
                self.tolerance.unwrap_or(0)
            )));
        }
        self.entries.push(entry);
        Ok(if self.is_full() {
            AppendOutcome::Full
        } else {
            AppendOutcome::Appended
        })
    }

    /// Remove and return every entry.
    pub fn flush(&mut self) -> Vec<HistoryEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Remove and return the entries at `indices`, in index order.
    ///
    /// An empty index list behaves like [`flush`](Self::flush). Any index out
    /// of range rejects the whole call and leaves the buffer untouched.
    pub fn extract(&mut self, indices: &[usize]) -> DbResult<Vec<HistoryEntry>> {
        if indices.is_empty() {
            return Ok(self.flush());
        }
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if let Some(&bad) = sorted.iter().find(|&&i| i >= self.entries.len()) {
            return Err(DbError::validation(format!(
                "History index {} out of range (len: {})",
                bad,
                self.entries.len()
            )));
        }

        let mut extracted: Vec<HistoryEntry> = sorted
            .iter()
            .rev()
            .map(|&i| self.entries.remove(i))
            .collect();
        extracted.reverse();
        Ok(extracted)
    }
}

/// [`HistoryRecorder`] backed by a [`HistoryBuffer`] and an optional sink.
pub struct BufferedHistory {
    buffer: Mutex<HistoryBuffer>,
    sink: Option<Arc<dyn HistorySink>>,
}

impl fmt::Debug for BufferedHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedHistory")
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl BufferedHistory {
    pub fn new(buffer: HistoryBuffer, sink: Option<Arc<dyn HistorySink>>) -> Self {
        Self {
            buffer: Mutex::new(buffer),
            sink,
        }
    }

    /// Buffer sized from `history_length` / `history_tolerance`.
    pub fn from_config(config: &ManagerConfig, sink: Option<Arc<dyn HistorySink>>) -> Self {
        let buffer = HistoryBuffer::new(
            config.history_length_or_default(),
            Some(config.history_tolerance_or_default()),
        );
        Self::new(buffer, sink)
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.lock().await.is_empty()
    }

    /// Copy of the buffered entries.
    pub async fn snapshot(&self) -> Vec<HistoryEntry> {
        self.buffer.lock().await.entries().to_vec()
    }

    async fn drain_into_sink(&self, buffer: &mut HistoryBuffer) -> DbResult<()> {
        let batch = buffer.flush();
        if batch.is_empty() {
            return Ok(());
        }
        match &self.sink {
            Some(sink) => sink.write_batch(batch).await,
            None => {
                debug!(entries = batch.len(), "No history sink configured, dropping batch");
                Ok(())
            }
        }
    }
}

impl HistoryRecorder for BufferedHistory {
    fn record(&self, entry: HistoryEntry) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            let mut buffer = self.buffer.lock().await;
            match buffer.try_append(entry)? {
                AppendOutcome::Appended => Ok(()),
                AppendOutcome::Full => self.drain_into_sink(&mut buffer).await,
            }
        })
    }

    fn flush(&self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            let mut buffer = self.buffer.lock().await;
            self.drain_into_sink(&mut buffer).await
        })
    }
}
