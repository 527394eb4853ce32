//! Connection registry.
//!
//! Maps canonical database paths to connection pairs (a mandatory write
//! handle and an optional read handle) and caller-chosen aliases to paths.
//! The registry is an explicit value owned by the manager; clones share the
//! same tables.

use crate::config::ManagerConfig;
use crate::db::executor::execute_raw;
use crate::error::{DbError, DbResult};
use crate::models::{AccessMode, ConnectionInfo};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard, RwLock, watch};
use tracing::{debug, info, warn};

/// Path of a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Exclusive access to an open engine connection.
pub type ConnGuard = OwnedMappedMutexGuard<Option<SqliteConnection>, SqliteConnection>;

/// Role of a handle within its connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRole {
    Write,
    Read,
}

/// Shared handle to one engine connection.
///
/// Closing takes the connection out of the slot, so stale clones fail with a
/// connection error instead of reaching a closed engine object.
#[derive(Clone)]
pub struct DbHandle {
    conn: Arc<Mutex<Option<SqliteConnection>>>,
    role: HandleRole,
    /// Set while a dropped transaction's ROLLBACK is outstanding.
    pending_rollback: Arc<StdMutex<Option<watch::Receiver<()>>>>,
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle")
            .field("role", &self.role)
            .field("conn", &Arc::as_ptr(&self.conn))
            .finish()
    }
}

impl DbHandle {
    fn new(conn: SqliteConnection, role: HandleRole) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            role,
            pending_rollback: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn role(&self) -> HandleRole {
        self.role
    }

    /// True when both values refer to the same underlying connection.
    pub fn same_as(&self, other: &DbHandle) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    /// Wait for exclusive use of the connection.
    ///
    /// Waits first for any outstanding rollback of a dropped transaction, so
    /// callers never run inside a transaction that is about to be undone.
    pub async fn acquire(&self) -> DbResult<ConnGuard> {
        loop {
            let pending = self
                .pending_rollback
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match pending {
                // Resolves with an error once the gate's sender is dropped.
                Some(mut rx) => {
                    let _ = rx.changed().await;
                }
                None => break,
            }
        }
        self.acquire_now().await
    }

    async fn acquire_now(&self) -> DbResult<ConnGuard> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        OwnedMutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| {
            DbError::connection(
                "connection closed",
                "Reconnect to the database before using this handle",
            )
        })
    }

    /// Hold back other users of this handle until the returned gate runs
    /// its rollback or is dropped.
    pub(crate) fn rollback_gate(&self) -> RollbackGate {
        let (tx, rx) = watch::channel(());
        *self
            .pending_rollback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(rx);
        RollbackGate {
            handle: self.clone(),
            _tx: tx,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.conn.lock().await.is_none()
    }

    /// Close the connection. Closing an already closed handle is a no-op.
    pub(crate) async fn close(&self) -> DbResult<()> {
        let taken = self.conn.lock().await.take();
        if let Some(conn) = taken {
            conn.close().await?;
        }
        Ok(())
    }
}

/// Pending ROLLBACK of a transaction dropped without exit.
///
/// Taken synchronously in `Drop`, so no statement acquired afterwards can
/// run before the rollback.
pub(crate) struct RollbackGate {
    handle: DbHandle,
    _tx: watch::Sender<()>,
}

impl RollbackGate {
    pub(crate) async fn rollback(self) -> DbResult<()> {
        let mut conn = self.handle.acquire_now().await?;
        execute_raw(&mut conn, "ROLLBACK").await
    }
}

impl Drop for RollbackGate {
    fn drop(&mut self) {
        *self
            .handle
            .pending_rollback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// The write handle and optional read handle of one database path.
#[derive(Debug, Clone)]
pub struct ConnectionPair {
    path: String,
    write: DbHandle,
    read: Option<DbHandle>,
}

impl ConnectionPair {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn write_handle(&self) -> &DbHandle {
        &self.write
    }

    pub fn read_handle(&self) -> Option<&DbHandle> {
        self.read.as_ref()
    }

    /// Handle for `mode`; read falls back to the write handle.
    pub fn handle(&self, mode: AccessMode) -> &DbHandle {
        match mode {
            AccessMode::Read => self.read.as_ref().unwrap_or(&self.write),
            AccessMode::Write => &self.write,
        }
    }

    async fn close(self) -> Vec<DbError> {
        let mut failures = Vec::new();
        if let Err(e) = self.write.close().await {
            failures.push(e);
        }
        if let Some(read) = self.read {
            if let Err(e) = read.close().await {
                failures.push(e);
            }
        }
        failures
    }
}

/// Snapshot of open paths taken at call time. Iterating it is restartable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSnapshot(Vec<String>);

impl PathSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.iter().any(|p| p == path)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<'a> IntoIterator for &'a PathSnapshot {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for PathSnapshot {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Default)]
struct RegistryTables {
    pairs: HashMap<String, ConnectionPair>,
    /// alias -> canonical path
    aliases: HashMap<String, String>,
}

impl RegistryTables {
    /// Resolve an alias or an already canonical path to an open path.
    fn resolve(&self, target: &str) -> Option<String> {
        if let Some(path) = self.aliases.get(target) {
            return Some(path.clone());
        }
        self.pairs.contains_key(target).then(|| target.to_string())
    }

    fn bind_alias(&mut self, alias: &str, path: &str) -> DbResult<()> {
        validate_alias(alias)?;
        if alias != path && self.pairs.contains_key(alias) {
            return Err(DbError::validation(format!(
                "Alias '{}' would shadow an open database path",
                alias
            )));
        }
        if alias == path {
            return Ok(());
        }
        if let Some(previous) = self.aliases.insert(alias.to_string(), path.to_string()) {
            if previous != path {
                info!(alias = %alias, from = %previous, to = %path, "Alias rebound");
            }
        }
        Ok(())
    }

    fn remove_aliases_of(&mut self, path: &str) {
        self.aliases.retain(|_, p| p != path);
    }

    fn aliases_of(&self, path: &str) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, p)| p.as_str() == path)
            .map(|(a, _)| a.clone())
            .collect();
        aliases.sort();
        aliases
    }

    fn info(&self, pair: &ConnectionPair) -> ConnectionInfo {
        ConnectionInfo {
            path: pair.path.clone(),
            aliases: self.aliases_of(&pair.path),
            has_read_handle: pair.read.is_some(),
        }
    }
}

fn validate_alias(alias: &str) -> DbResult<()> {
    if alias.trim().is_empty() {
        return Err(DbError::validation("Alias cannot be empty"));
    }
    Ok(())
}

/// Canonical form of a database path.
///
/// `:memory:` and `file:` URIs are kept verbatim. Existing files are
/// canonicalized; paths that do not exist yet are made absolute against a
/// canonicalized parent directory so they match once the file is created.
pub fn canonical_path(path: &str) -> DbResult<String> {
    if path.trim().is_empty() {
        return Err(DbError::validation("Database path cannot be empty"));
    }
    if path == MEMORY_PATH || path.starts_with("file:") {
        return Ok(path.to_string());
    }

    let resolve_error = |e: std::io::Error| {
        DbError::connection(
            format!("Cannot resolve database path '{}': {}", path, e),
            "Check that the path is valid and its directory is accessible",
        )
    };

    let p = Path::new(path);
    let resolved = if p.exists() {
        std::fs::canonicalize(p).map_err(resolve_error)?
    } else {
        let absolute = std::path::absolute(p).map_err(resolve_error)?;
        match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => std::fs::canonicalize(parent)
                .map_err(resolve_error)?
                .join(name),
            _ => absolute,
        }
    };
    Ok(resolved.to_string_lossy().into_owned())
}

fn is_memory(path: &str) -> bool {
    path == MEMORY_PATH || (path.starts_with("file:") && path.contains("mode=memory"))
}

fn connection_suggestion(path: &str, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("unable to open") || error_str.contains("no such file") {
        return format!(
            "Check that the directory of '{}' exists and is writable",
            path
        );
    }

    if error_str.contains("readonly") || error_str.contains("permission") {
        return "Check file permissions on the database and its directory".to_string();
    }

    if error_str.contains("not a database") || error_str.contains("malformed") {
        return "The file exists but is not a valid SQLite database".to_string();
    }

    "Verify the file path exists and is accessible".to_string()
}

/// Path/alias indexed table of connection pairs.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    tables: Arc<RwLock<RegistryTables>>,
    create_if_missing: bool,
    busy_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            tables: Arc::new(RwLock::new(RegistryTables::default())),
            create_if_missing: config.create_if_missing_or_default(),
            busy_timeout: config.busy_timeout(),
        }
    }

    fn connect_options(&self, path: &str, role: HandleRole) -> DbResult<SqliteConnectOptions> {
        let options = if path == MEMORY_PATH {
            SqliteConnectOptions::from_str("sqlite::memory:")
        } else if let Some(uri) = path.strip_prefix("file:") {
            SqliteConnectOptions::from_str(&format!("sqlite:{}", uri))
        } else {
            Ok(SqliteConnectOptions::new().filename(path))
        }
        .map_err(|e| {
            DbError::connection(
                format!("Invalid SQLite target '{}': {}", path, e),
                "Use a file path, ':memory:' or a 'file:' URI",
            )
        })?;

        let options = options
            .busy_timeout(self.busy_timeout)
            .disable_statement_logging();

        Ok(match role {
            HandleRole::Write => options.create_if_missing(self.create_if_missing),
            HandleRole::Read => options.read_only(true),
        })
    }

    async fn open(&self, path: &str, role: HandleRole) -> DbResult<DbHandle> {
        let options = self.connect_options(path, role)?;
        let conn = options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to open '{}': {}", path, e),
                connection_suggestion(path, &e),
            )
        })?;
        debug!(path = %path, role = ?role, "Opened handle");
        Ok(DbHandle::new(conn, role))
    }

    /// Open (or return the already open) connection pair for `path`.
    ///
    /// With `want_read_handle` a second, read-only handle is opened if the
    /// pair does not have one yet. In-memory databases never get a read
    /// handle since a second connection would see a different database.
    pub async fn connect(
        &self,
        path: &str,
        alias: Option<&str>,
        want_read_handle: bool,
    ) -> DbResult<ConnectionPair> {
        if let Some(alias) = alias {
            validate_alias(alias)?;
        }
        let canonical = canonical_path(path)?;
        let want_read_handle = want_read_handle && !is_memory(&canonical);

        // Early check for an existing pair
        let (need_write, need_read) = {
            let tables = self.tables.read().await;
            match tables.pairs.get(&canonical) {
                Some(pair) => (false, want_read_handle && pair.read.is_none()),
                None => (true, want_read_handle),
            }
        };

        if !need_write && !need_read {
            let mut tables = self.tables.write().await;
            if let Some(pair) = tables.pairs.get(&canonical).cloned() {
                if let Some(alias) = alias {
                    tables.bind_alias(alias, &canonical)?;
                }
                return Ok(pair);
            }
            // closed in between; fall through to a fresh open
        }

        info!(path = %canonical, alias = ?alias, read_handle = want_read_handle, "Connecting to database");

        let mut opened_write = None;
        if need_write || !need_read {
            opened_write = Some(self.open(&canonical, HandleRole::Write).await?);
        }
        let opened_read = if want_read_handle {
            match self.open(&canonical, HandleRole::Read).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if let Some(write) = opened_write {
                        close_quietly(&canonical, write).await;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Re-check after async work to prevent TOCTOU race
        let mut to_close = Vec::new();
        let result = {
            let mut tables = self.tables.write().await;
            let alias_ok = match alias {
                Some(alias) if alias != canonical && tables.pairs.contains_key(alias) => {
                    Err(DbError::validation(format!(
                        "Alias '{}' would shadow an open database path",
                        alias
                    )))
                }
                _ => Ok(()),
            };

            match alias_ok {
                Err(e) => {
                    to_close.extend(opened_write);
                    to_close.extend(opened_read);
                    Err(e)
                }
                Ok(()) => {
                    match tables.pairs.get_mut(&canonical) {
                        Some(existing) => {
                            to_close.extend(opened_write);
                            match opened_read {
                                Some(read) if existing.read.is_none() => existing.read = Some(read),
                                other => to_close.extend(other),
                            }
                        }
                        None => match opened_write {
                            Some(write) => {
                                tables.pairs.insert(
                                    canonical.clone(),
                                    ConnectionPair {
                                        path: canonical.clone(),
                                        write,
                                        read: opened_read,
                                    },
                                );
                            }
                            None => {
                                to_close.extend(opened_read);
                            }
                        },
                    }
                    match tables.pairs.get(&canonical).cloned() {
                        Some(pair) => match alias {
                            Some(alias) => tables.bind_alias(alias, &canonical).map(|()| pair),
                            None => Ok(pair),
                        },
                        None => Err(DbError::connection(
                            format!("Connection to '{}' was closed while opening", canonical),
                            "Retry the connect call",
                        )),
                    }
                }
            }
        }; // Lock released here

        for handle in to_close {
            close_quietly(&canonical, handle).await;
        }

        if let Ok(pair) = &result {
            info!(
                path = %canonical,
                read_handle = pair.read.is_some(),
                "Connected successfully"
            );
        }
        result
    }

    /// Resolve a path or alias to the canonical path of an open pair.
    pub async fn resolve(&self, target: &str) -> Option<String> {
        {
            let tables = self.tables.read().await;
            if let Some(path) = tables.resolve(target) {
                return Some(path);
            }
        }
        let canonical = canonical_path(target).ok()?;
        let tables = self.tables.read().await;
        tables.pairs.contains_key(&canonical).then_some(canonical)
    }

    /// Look up the connection pair for a path or alias.
    pub async fn get_pair(&self, target: &str) -> Option<ConnectionPair> {
        let path = self.resolve(target).await?;
        let tables = self.tables.read().await;
        tables.pairs.get(&path).cloned()
    }

    /// Handle for `mode`, or `None` when nothing is open for `target`.
    pub async fn get(&self, target: &str, mode: AccessMode) -> Option<DbHandle> {
        self.get_pair(target)
            .await
            .map(|pair| pair.handle(mode).clone())
    }

    pub async fn info(&self, target: &str) -> Option<ConnectionInfo> {
        let path = self.resolve(target).await?;
        let tables = self.tables.read().await;
        tables.pairs.get(&path).map(|pair| tables.info(pair))
    }

    pub async fn contains(&self, target: &str) -> bool {
        self.resolve(target).await.is_some()
    }

    /// Bind `alias` to the pair of `target`, or remove every alias of that
    /// pair when `alias` is `None`. Rebinding an alias moves it.
    pub async fn set_alias(&self, target: &str, alias: Option<&str>) -> DbResult<()> {
        let path = self
            .resolve(target)
            .await
            .ok_or_else(|| DbError::connection_not_found(target))?;
        let mut tables = self.tables.write().await;
        if !tables.pairs.contains_key(&path) {
            return Err(DbError::connection_not_found(target));
        }
        match alias {
            Some(alias) => tables.bind_alias(alias, &path),
            None => {
                tables.remove_aliases_of(&path);
                debug!(path = %path, "Aliases removed");
                Ok(())
            }
        }
    }

    /// Move the pair of `target` to `new_path`, carrying its aliases along.
    ///
    /// Only the registry entry moves; the database file itself is untouched.
    pub async fn rename_path(&self, target: &str, new_path: &str) -> DbResult<String> {
        let old = self
            .resolve(target)
            .await
            .ok_or_else(|| DbError::connection_not_found(target))?;
        let new = canonical_path(new_path)?;

        let mut tables = self.tables.write().await;
        if new == old {
            return Ok(new);
        }
        if tables.pairs.contains_key(&new) || tables.aliases.contains_key(&new) {
            return Err(DbError::validation(format!(
                "Path '{}' is already registered",
                new
            )));
        }
        let mut pair = tables
            .pairs
            .remove(&old)
            .ok_or_else(|| DbError::connection_not_found(target))?;
        pair.path = new.clone();
        tables.pairs.insert(new.clone(), pair);
        for path in tables.aliases.values_mut() {
            if *path == old {
                *path = new.clone();
            }
        }
        info!(from = %old, to = %new, "Path renamed");
        Ok(new)
    }

    /// Close both handles of `target` and forget its aliases.
    ///
    /// Returns `false` when nothing was open. Closing twice is a no-op.
    pub async fn close(&self, target: &str) -> DbResult<bool> {
        let Some(path) = self.resolve(target).await else {
            return Ok(false);
        };
        let pair = {
            let mut tables = self.tables.write().await;
            let pair = tables.pairs.remove(&path);
            tables.remove_aliases_of(&path);
            pair
        };
        let Some(pair) = pair else {
            return Ok(false);
        };

        info!(path = %path, "Closing connection");
        let mut failures = pair.close().await;
        if failures.is_empty() {
            Ok(true)
        } else {
            for e in &failures {
                warn!(path = %path, error = %e, "Failed to close handle");
            }
            Err(failures.swap_remove(0))
        }
    }

    /// Close every pair, continuing past failures.
    pub async fn close_all(&self) -> Vec<(String, DbError)> {
        let pairs: Vec<ConnectionPair> = {
            let mut tables = self.tables.write().await;
            tables.aliases.clear();
            tables.pairs.drain().map(|(_, pair)| pair).collect()
        };

        let mut failures = Vec::new();
        for pair in pairs {
            let path = pair.path.clone();
            info!(path = %path, "Closing connection");
            for e in pair.close().await {
                warn!(path = %path, error = %e, "Failed to close handle");
                failures.push((path.clone(), e));
            }
        }
        info!(failures = failures.len(), "All connections closed");
        failures
    }

    /// Snapshot of the currently open canonical paths, sorted.
    pub async fn list_paths(&self) -> PathSnapshot {
        let tables = self.tables.read().await;
        let mut paths: Vec<String> = tables.pairs.keys().cloned().collect();
        paths.sort();
        PathSnapshot(paths)
    }

    pub async fn connection_count(&self) -> usize {
        self.tables.read().await.pairs.len()
    }
}

async fn close_quietly(path: &str, handle: DbHandle) {
    if let Err(e) = handle.close().await {
        warn!(path = %path, error = %e, "Failed to close duplicate handle");
    }
}
