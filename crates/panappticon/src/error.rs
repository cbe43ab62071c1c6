//! Error types for panappticon.
//!
//! Each subsystem has its own error enum so that callers can decide how to
//! degrade: a store that cannot be opened stops the whole pipeline, while a
//! volume that cannot be mounted only disables screenshots. All of them fold
//! into the top-level [`Error`].

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for panappticon operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// The encrypted database could not be used.
    #[error(transparent)]
    Store(#[from] StoreError),

    // === Volume Errors ===
    /// The encrypted screenshot volume could not be used.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    // === Configuration Errors ===
    /// The configuration file could not be read or contained bad values.
    #[error(transparent)]
    Config(#[from] ConfigError),

    // === Capture Errors ===
    /// The media helper process misbehaved.
    #[error(transparent)]
    Helper(#[from] HelperError),

    /// A capture source failed to start.
    #[error("failed to start capture source '{name}': {message}")]
    CaptureSourceStart {
        /// Name of the capture source.
        name: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    // === Passphrase Errors ===
    /// The user dismissed the passphrase prompt.
    #[error("passphrase entry was cancelled")]
    PassphraseCancelled,

    /// A freshly chosen passphrase could not be saved.
    #[error("passphrase could not be saved to the key provider")]
    PassphraseNotSaved,

    // === Platform Errors ===
    /// Required platform permission is missing.
    #[error("missing permission: {permission}")]
    PermissionMissing {
        /// Name of the required permission.
        permission: String,
    },

    /// Platform-specific operation failed.
    #[error("platform error: {0}")]
    Platform(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for panappticon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the encrypted database.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database file could not be opened or created.
    #[error("failed to open database at {path}: {source}")]
    OpenFailed {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// The passphrase did not decrypt the file, or the file is not a database.
    #[error("wrong passphrase or corrupt database at {path}")]
    WrongKeyOrCorrupt {
        /// Path to the database file.
        path: PathBuf,
    },

    /// A table or its insert statement could not be prepared.
    #[error("failed to prepare {table}: {source}")]
    PrepareFailed {
        /// Table whose capability is now unavailable.
        table: &'static str,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// The plaintext database could not be converted to an encrypted one.
    #[error("plaintext database migration failed: {message}")]
    MigrationFailed {
        /// Description of what went wrong.
        message: String,
    },

    /// The store was used after `close`.
    #[error("database is closed")]
    Closed,

    /// Any other SQL failure.
    #[error("database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Failures of the encrypted screenshot volume.
#[derive(Error, Debug)]
pub enum VolumeError {
    /// The container image could not be created.
    #[error("failed to create volume image {path}: {message}")]
    CreateFailed {
        /// Path to the container image.
        path: PathBuf,
        /// Output of the failing tool.
        message: String,
    },

    /// The container image could not be attached.
    #[error("failed to mount volume at {mount_point}: {message}")]
    MountFailed {
        /// Where the volume was supposed to appear.
        mount_point: PathBuf,
        /// Output of the failing tool.
        message: String,
    },

    /// The volume could not be detached.
    #[error("failed to detach volume at {mount_point}: {message}")]
    DetachFailed {
        /// The mount point that is still attached.
        mount_point: PathBuf,
        /// Output of the failing tool.
        message: String,
    },

    /// Running the disk image tool failed.
    #[error("disk image tool error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems found while reading the configuration file.
///
/// None of these are fatal: the offending line is skipped and the default
/// value stays in effect.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A non-comment line without a `key = value` shape.
    #[error("line {line_number}: expected `key = value`, found {line:?}")]
    MalformedLine {
        /// 1-based line number.
        line_number: usize,
        /// The offending line.
        line: String,
    },

    /// The toggle shortcut could not be parsed.
    #[error("line {line_number}: invalid shortcut {value:?}")]
    InvalidShortcut {
        /// 1-based line number.
        line_number: usize,
        /// The rejected shortcut text.
        value: String,
    },

    /// The data path did not resolve to a usable directory.
    #[error("line {line_number}: data path {value:?} is not a usable directory")]
    InvalidDataPath {
        /// 1-based line number.
        line_number: usize,
        /// The rejected path text.
        value: String,
    },

    /// The configuration file could not be read or written.
    #[error("configuration file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the out-of-process media helper.
///
/// These are recovered by skipping the line or restarting the helper.
#[derive(Error, Debug)]
pub enum HelperError {
    /// The helper could not be launched.
    #[error("failed to spawn media helper {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The helper was started without a readable stdout.
    #[error("media helper has no stdout pipe")]
    MissingStdout,

    /// Reading from the helper's stdout failed.
    #[error("failed to read media helper output: {0}")]
    Read(#[source] std::io::Error),

    /// An object line that was not valid JSON.
    #[error("malformed media helper line: {0}")]
    MalformedLine(#[source] serde_json::Error),

    /// Waiting for the helper to exit failed.
    #[error("failed to wait for media helper: {0}")]
    Wait(#[source] std::io::Error),
}

impl Error {
    /// Create a new platform error.
    #[must_use]
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform(message.into())
    }

    /// Create a permission missing error.
    #[must_use]
    pub fn permission_missing(permission: impl Into<String>) -> Self {
        Self::PermissionMissing {
            permission: permission.into(),
        }
    }

    /// Create a capture source start error.
    #[must_use]
    pub fn capture_source_start(name: &'static str, message: impl Into<String>) -> Self {
        Self::CaptureSourceStart {
            name,
            message: message.into(),
        }
    }

    /// Check if this error means the passphrase did not unlock the store.
    #[must_use]
    pub fn is_wrong_key(&self) -> bool {
        matches!(self, Self::Store(StoreError::WrongKeyOrCorrupt { .. }))
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionMissing { .. })
    }
}
