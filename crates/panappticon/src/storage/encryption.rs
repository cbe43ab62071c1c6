//! Keying and one-time encryption of plaintext databases.
//!
//! A database created before encryption was introduced is converted in place
//! the first time it is opened with a passphrase. The conversion writes an
//! encrypted sibling, then swaps files so that the original survives as
//! `<path>.unencrypted.bak`. On any failure the original is left untouched.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::{error, info, warn};

use crate::error::StoreError;

/// First 16 bytes of every unencrypted `SQLite` database.
pub const PLAINTEXT_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Suffix of the encrypted copy written during migration.
const ENCRYPTED_SUFFIX: &str = ".encrypted";

/// Suffix of the preserved plaintext original.
const BACKUP_SUFFIX: &str = ".unencrypted.bak";

/// `path` with `suffix` appended to its file name.
#[must_use]
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Where migration preserves the plaintext original.
#[must_use]
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, BACKUP_SUFFIX)
}

/// Numbered backups tried once the plain backup name is taken.
const MAX_NUMBERED_BACKUPS: u32 = 99;

/// A backup location that does not hold an earlier backup yet.
///
/// The first migration uses [`backup_path`]; later ones fall back to
/// `<path>.unencrypted.N.bak`.
fn free_backup_path(path: &Path) -> Option<PathBuf> {
    let plain = backup_path(path);
    if !plain.exists() {
        return Some(plain);
    }
    (1..=MAX_NUMBERED_BACKUPS)
        .map(|n| sibling(path, &format!(".unencrypted.{n}.bak")))
        .find(|candidate| !candidate.exists())
}

/// Whether the file at `path` is an unencrypted database.
///
/// Missing and short files are not plaintext.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn is_plaintext(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(&header == PLAINTEXT_HEADER),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Quote `value` as an SQL string literal.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Apply the passphrase to a freshly opened connection.
///
/// Must run before any other statement touches the file.
///
/// # Errors
///
/// Returns an error if the key pragma is rejected.
pub fn apply_key(conn: &Connection, passphrase: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA key = {};", sql_literal(passphrase)))
}

/// Read the schema catalog; fails when the key does not decrypt the file.
///
/// # Errors
///
/// Returns the engine error, typically "file is not a database".
pub fn verify_key(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
}

/// Convert the plaintext database at `path` into an encrypted one.
///
/// Returns the path of the preserved plaintext backup.
///
/// # Errors
///
/// Returns [`StoreError::MigrationFailed`] if any step fails. The encrypted
/// sibling is removed and the original file stays where it was.
pub fn migrate_plaintext(path: &Path, passphrase: &str) -> Result<PathBuf, StoreError> {
    let encrypted = sibling(path, ENCRYPTED_SUFFIX);
    let Some(backup) = free_backup_path(path) else {
        return Err(StoreError::MigrationFailed {
            message: format!("no free backup name next to {}", path.display()),
        });
    };
    remove_if_present(&encrypted);

    info!(path = %path.display(), "Encrypting plaintext database");

    if let Err(e) = export_encrypted(path, &encrypted, passphrase) {
        remove_if_present(&encrypted);
        return Err(StoreError::MigrationFailed {
            message: format!("export failed: {e}"),
        });
    }

    if let Err(e) = fs::rename(path, &backup) {
        remove_if_present(&encrypted);
        return Err(StoreError::MigrationFailed {
            message: format!("could not move original to {}: {e}", backup.display()),
        });
    }

    if let Err(e) = fs::rename(&encrypted, path) {
        if let Err(restore) = fs::rename(&backup, path) {
            error!(
                backup = %backup.display(),
                error = %restore,
                "Could not restore plaintext database after failed swap"
            );
        }
        remove_if_present(&encrypted);
        return Err(StoreError::MigrationFailed {
            message: format!("could not move encrypted copy into place: {e}"),
        });
    }

    // Side files of the plaintext database must never be replayed into the
    // encrypted one.
    remove_if_present(&sibling(path, "-wal"));
    remove_if_present(&sibling(path, "-shm"));

    info!(backup = %backup.display(), "Database encrypted");
    Ok(backup)
}

fn export_encrypted(plain: &Path, encrypted: &Path, passphrase: &str) -> rusqlite::Result<()> {
    let conn = Connection::open(plain)?;
    conn.execute(
        "ATTACH DATABASE ?1 AS encrypted KEY ?2",
        params![encrypted.to_string_lossy().into_owned(), passphrase],
    )?;
    let exported = conn.query_row("SELECT sqlcipher_export('encrypted')", [], |_| Ok(()));
    let detached = conn.execute_batch("DETACH DATABASE encrypted;");
    exported?;
    detached?;
    conn.close().map_err(|(_, e)| e)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove file"),
    }
}
