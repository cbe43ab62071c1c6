//! Encrypted storage for captured events.
//!
//! The store owns a single SQLCipher connection. Opening it migrates a
//! plaintext database if necessary, verifies the passphrase, creates the
//! three event tables and warms the statement cache with their inserts.
//! Inserts never fail loudly: an error is logged and the row is dropped, so
//! a storage hiccup cannot take down a capture callback.

pub mod encryption;
pub mod migrations;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, Params};
use tracing::{debug, error, info, trace, warn};

use crate::capture::{
    parse_timestamp, timestamp_text, KeystrokeEvent, MediaEvent, Record, ScreenshotEvent,
};
use crate::error::StoreError;

pub use schema::Table;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Number of entries kept in the prepared statement cache.
const STATEMENT_CACHE_CAPACITY: usize = 16;

struct StoreInner {
    conn: Connection,
    available: [bool; 3],
}

impl StoreInner {
    fn is_available(&self, table: Table) -> bool {
        self.available[table.index()]
    }
}

/// The encrypted event database.
///
/// Shared between the recorder task and the shutdown path behind an `Arc`;
/// every statement runs under one lock, so each insert is a single
/// reset-bind-step unit.
pub struct EncryptedStore {
    path: PathBuf,
    inner: Mutex<Option<StoreInner>>,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl EncryptedStore {
    /// Open or create the encrypted database at `path`.
    ///
    /// A plaintext database found at `path` is encrypted first, keeping the
    /// original as `<path>.unencrypted.bak`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MigrationFailed`] if a plaintext file could not be converted.
    /// - [`StoreError::OpenFailed`] if the file cannot be opened or keyed.
    /// - [`StoreError::WrongKeyOrCorrupt`] if the passphrase does not decrypt it.
    ///
    /// Table and statement failures are not errors; the affected insert
    /// capability is disabled instead.
    pub fn open(path: impl AsRef<Path>, passphrase: &str) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Could not create database directory");
            }
        }

        match encryption::is_plaintext(&path) {
            Ok(true) => {
                encryption::migrate_plaintext(&path, passphrase)?;
            }
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not read database header"),
        }

        debug!(path = %path.display(), "Opening encrypted database");
        let conn = Connection::open(&path).map_err(|source| StoreError::OpenFailed {
            path: path.clone(),
            source,
        })?;

        encryption::apply_key(&conn, passphrase).map_err(|source| StoreError::OpenFailed {
            path: path.clone(),
            source,
        })?;

        if let Err(e) = encryption::verify_key(&conn) {
            error!(path = %path.display(), error = %e, "Database key verification failed");
            drop(conn);
            return Err(StoreError::WrongKeyOrCorrupt { path });
        }

        // WAL for crash safety; a failure here only costs durability tuning.
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;") {
            warn!(error = %e, "Could not enable write-ahead logging");
        }

        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        let mut available = [false; 3];
        for table in Table::ALL {
            match prepare_table(&conn, table) {
                Ok(()) => available[table.index()] = true,
                Err(e) => error!(error = %e, "Insert capability disabled"),
            }
        }

        info!(path = %path.display(), "Database opened");
        Ok(Self {
            path,
            inner: Mutex::new(Some(StoreInner { conn, available })),
        })
    }

    /// Path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `close` has not been called yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether inserts into `table` are possible.
    #[must_use]
    pub fn is_available(&self, table: Table) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|inner| inner.is_available(table))
    }

    /// Insert a keystroke. Returns the row id, or `None` if it was dropped.
    pub fn insert_keystroke(&self, event: &KeystrokeEvent) -> Option<i64> {
        let timestamp = timestamp_text(&event.timestamp);
        self.insert(
            Table::Keystrokes,
            params![event.keystroke, timestamp, event.application],
        )
    }

    /// Insert a media change. Returns the row id, or `None` if it was dropped.
    pub fn insert_media(&self, event: &MediaEvent) -> Option<i64> {
        let timestamp = timestamp_text(&event.timestamp);
        self.insert(
            Table::Media,
            params![
                event.title,
                event.artist,
                event.album,
                event.source_app,
                timestamp
            ],
        )
    }

    /// Insert a screenshot row. Returns the row id, or `None` if it was dropped.
    pub fn insert_screenshot(&self, event: &ScreenshotEvent) -> Option<i64> {
        let timestamp = timestamp_text(&event.timestamp);
        self.insert(
            Table::Screenshots,
            params![
                event.filename,
                event.display_index,
                event.active_app,
                event.active_bundle,
                timestamp
            ],
        )
    }

    /// Insert any record into its table.
    pub fn record(&self, record: &Record) -> Option<i64> {
        match record {
            Record::Keystroke(event) => self.insert_keystroke(event),
            Record::Media(event) => self.insert_media(event),
            Record::Screenshot(event) => self.insert_screenshot(event),
        }
    }

    fn insert<P: Params>(&self, table: Table, params: P) -> Option<i64> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(inner) = guard.as_ref() else {
            trace!(table = table.name(), "Store closed, dropping row");
            return None;
        };
        if !inner.is_available(table) {
            trace!(table = table.name(), "Insert unavailable, dropping row");
            return None;
        }

        let result = inner
            .conn
            .prepare_cached(table.insert_sql())
            .and_then(|mut stmt| stmt.insert(params));
        match result {
            Ok(id) => {
                trace!(table = table.name(), id, "Row inserted");
                Some(id)
            }
            Err(e) => {
                warn!(table = table.name(), error = %e, "Insert failed");
                None
            }
        }
    }

    /// Number of rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the query fails.
    pub fn count(&self, table: Table) -> StoreResult<i64> {
        self.with_conn(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| {
                row.get(0)
            })
        })
    }

    /// The most recent keystrokes, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the query fails.
    pub fn recent_keystrokes(&self, limit: usize) -> StoreResult<Vec<KeystrokeEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, keystroke, timestamp, application FROM keystrokes \
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit_param(limit)], |row| {
                Ok(KeystrokeEvent {
                    id: Some(row.get(0)?),
                    keystroke: row.get(1)?,
                    timestamp: parse_timestamp(&row.get::<_, String>(2)?),
                    application: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// The most recent media changes, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the query fails.
    pub fn recent_media(&self, limit: usize) -> StoreResult<Vec<MediaEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, artist, album, source_app, timestamp FROM media_history \
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit_param(limit)], |row| {
                Ok(MediaEvent {
                    id: Some(row.get(0)?),
                    title: row.get(1)?,
                    artist: row.get(2)?,
                    album: row.get(3)?,
                    source_app: row.get(4)?,
                    timestamp: parse_timestamp(&row.get::<_, String>(5)?),
                })
            })?;
            rows.collect()
        })
    }

    /// The most recent screenshot rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the query fails.
    pub fn recent_screenshots(&self, limit: usize) -> StoreResult<Vec<ScreenshotEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, filename, display_index, active_app, active_bundle, timestamp \
                 FROM screenshots ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit_param(limit)], |row| {
                Ok(ScreenshotEvent {
                    id: Some(row.get(0)?),
                    filename: row.get(1)?,
                    display_index: row.get(2)?,
                    active_app: row.get(3)?,
                    active_bundle: row.get(4)?,
                    timestamp: parse_timestamp(&row.get::<_, String>(5)?),
                })
            })?;
            rows.collect()
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(f(&inner.conn)?)
    }

    /// Release the cached statements, then the connection.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn close(&self) {
        let Some(inner) = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        inner.conn.flush_prepared_statement_cache();
        match inner.conn.close() {
            Ok(()) => info!(path = %self.path.display(), "Database closed"),
            Err((_, e)) => warn!(path = %self.path.display(), error = %e, "Database close reported an error"),
        }
    }
}

impl Drop for EncryptedStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Create `table`, converge its shape and warm its insert statement.
fn prepare_table(conn: &Connection, table: Table) -> StoreResult<()> {
    let failed = |source| StoreError::PrepareFailed {
        table: table.name(),
        source,
    };
    conn.execute_batch(table.create_sql()).map_err(failed)?;
    if table == Table::Media {
        migrations::converge_media_shape(conn).map_err(failed)?;
    }
    conn.prepare_cached(table.insert_sql()).map_err(failed)?;
    Ok(())
}
