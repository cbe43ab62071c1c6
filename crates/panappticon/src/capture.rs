//! Core capture types for panappticon.
//!
//! Capture sources produce [`Record`]s and push them into a [`RecordSink`].
//! A single recorder task drains the sink into the encrypted store, so the
//! OS callbacks that produce records never touch the database themselves.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::Result;
use crate::storage::EncryptedStore;

/// Render a timestamp the way it is stored, e.g. `2024-05-01T09:30:00Z`.
#[must_use]
pub fn timestamp_text(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp, falling back to now for unreadable values.
#[must_use]
pub fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

/// The kind of capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Global key presses.
    Keystrokes,
    /// Now-playing media changes.
    Media,
    /// Periodic screen captures.
    Screenshots,
}

impl CaptureKind {
    /// Lowercase name, as used in logs and on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Keystrokes => "keystrokes",
            Self::Media => "media",
            Self::Screenshots => "screenshots",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single key press.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystrokeEvent {
    /// Row id (assigned by the store).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Label such as `a`, `Cmd+c` or `Ctrl+Shift+[Return]`.
    pub keystroke: String,
    /// When the key was pressed.
    pub timestamp: DateTime<Utc>,
    /// Foreground application at the time of the press.
    pub application: String,
}

impl KeystrokeEvent {
    /// Create a keystroke event stamped with the current time.
    #[must_use]
    pub fn new(keystroke: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            id: None,
            keystroke: keystroke.into(),
            timestamp: Utc::now(),
            application: application.into(),
        }
    }
}

/// A change of the now-playing media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEvent {
    /// Row id (assigned by the store).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Track title, never empty.
    pub title: String,
    /// Artist, empty when unknown.
    pub artist: String,
    /// Album, empty when unknown.
    pub album: String,
    /// Bundle identifier of the playing application, empty when unknown.
    pub source_app: String,
    /// When the change was observed.
    pub timestamp: DateTime<Utc>,
}

/// One screen capture of one display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotEvent {
    /// Row id (assigned by the store).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// File name inside the capture directory.
    pub filename: String,
    /// Position of the display in the enumeration for this tick.
    pub display_index: u32,
    /// Foreground application name.
    pub active_app: String,
    /// Foreground application bundle identifier.
    pub active_bundle: String,
    /// When the capture was taken.
    pub timestamp: DateTime<Utc>,
}

/// Any record produced by a capture source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// From the keystroke source.
    Keystroke(KeystrokeEvent),
    /// From the media source.
    Media(MediaEvent),
    /// From the screenshot source.
    Screenshot(ScreenshotEvent),
}

impl Record {
    /// Which source produced this record.
    #[must_use]
    pub fn kind(&self) -> CaptureKind {
        match self {
            Self::Keystroke(_) => CaptureKind::Keystrokes,
            Self::Media(_) => CaptureKind::Media,
            Self::Screenshot(_) => CaptureKind::Screenshots,
        }
    }
}

/// Sending half of the record queue.
///
/// Sending never blocks, so it is safe to call from OS event callbacks.
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: mpsc::UnboundedSender<Record>,
}

impl RecordSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a record. Records are dropped once the recorder has shut down.
    pub fn emit(&self, record: Record) {
        if let Err(e) = self.tx.send(record) {
            trace!(kind = %e.0.kind(), "Recorder gone, dropping record");
        }
    }
}

/// Drain `rx` into `store` until every sink has been dropped.
///
/// Inserts run on the blocking pool, one at a time, in queue order.
pub fn spawn_recorder(
    store: Arc<EncryptedStore>,
    mut rx: mpsc::UnboundedReceiver<Record>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(record) = rx.blocking_recv() {
            store.record(&record);
        }
        debug!("Recorder stopped");
    })
}

/// An independently start/stop-able producer of one kind of record.
///
/// Both `start` and `stop` are idempotent: starting a running source does
/// not install a second observer, and stopping a stopped source does nothing.
#[async_trait]
pub trait CaptureSource: Send {
    /// The kind of records this source produces.
    fn kind(&self) -> CaptureKind;

    /// Whether the source is currently running.
    fn is_running(&self) -> bool;

    /// Start producing records into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the underlying observer.
    fn start(&mut self, sink: RecordSink) -> Result<()>;

    /// Stop producing records and release OS resources.
    async fn stop(&mut self);
}
