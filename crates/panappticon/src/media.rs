//! Now-playing media capture.
//!
//! The metadata source is a private OS interface, so it is read by a separate
//! helper process that prints one line per poll on stdout:
//!
//! ```text
//! READY
//! {"title":"Song","artist":"Band","album":"Record","bundleId":"com.apple.Music"}
//! {"empty":true}
//! ```
//!
//! Lines that do not start with `{` are ignored. The helper is restarted
//! after a short backoff whenever it exits, for as long as the capture runs.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::capture::{CaptureKind, CaptureSource, MediaEvent, Record, RecordSink};
use crate::error::{HelperError, Result};

/// How the helper process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed to it.
    pub args: Vec<String>,
}

impl HelperCommand {
    /// Create a helper command.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Tuning for [`MediaCapture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaCaptureConfig {
    /// Pause between a helper exit and its restart.
    pub restart_backoff: Duration,
}

impl Default for MediaCaptureConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(2),
        }
    }
}

/// One data line from the helper.
///
/// Missing and `null` fields read as empty, so `{"title":null}` means
/// nothing is playing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HelperMessage {
    /// Track title; empty means nothing is playing.
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    /// Artist.
    #[serde(default, deserialize_with = "null_as_default")]
    pub artist: String,
    /// Album.
    #[serde(default, deserialize_with = "null_as_default")]
    pub album: String,
    /// Bundle identifier of the playing application.
    #[serde(default, rename = "bundleId", deserialize_with = "null_as_default")]
    pub bundle_id: String,
    /// Set when the helper found no now-playing item.
    #[serde(default, deserialize_with = "null_as_default")]
    pub empty: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl HelperMessage {
    /// Whether this message means nothing is playing.
    #[must_use]
    pub fn is_nothing_playing(&self) -> bool {
        self.empty || self.title.trim().is_empty()
    }
}

/// Parse one line of helper output.
///
/// Returns `None` for lines that carry no data (blank lines, readiness
/// markers, diagnostics).
///
/// # Errors
///
/// Returns [`HelperError::MalformedLine`] for an object line that is not
/// valid JSON.
pub fn parse_helper_line(line: &str) -> Option<std::result::Result<HelperMessage, HelperError>> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    Some(serde_json::from_str(line).map_err(HelperError::MalformedLine))
}

/// Collapses repeated polls of the same item into a single event.
#[derive(Debug, Default, Clone)]
pub struct NowPlayingTracker {
    current_title: Option<String>,
}

impl NowPlayingTracker {
    /// The title of the last recorded item, if something is playing.
    #[must_use]
    pub fn current_title(&self) -> Option<&str> {
        self.current_title.as_deref()
    }

    /// Feed one poll result; returns an event when the title changed.
    pub fn observe(&mut self, message: HelperMessage) -> Option<MediaEvent> {
        if message.is_nothing_playing() {
            self.current_title = None;
            return None;
        }
        if self.current_title.as_deref() == Some(message.title.as_str()) {
            return None;
        }

        self.current_title = Some(message.title.clone());
        Some(MediaEvent {
            id: None,
            title: message.title,
            artist: message.artist,
            album: message.album,
            source_app: message.bundle_id,
            timestamp: Utc::now(),
        })
    }
}

/// Records now-playing changes reported by the helper process.
#[derive(Debug)]
pub struct MediaCapture {
    command: HelperCommand,
    config: MediaCaptureConfig,
    task: Option<JoinHandle<()>>,
}

impl MediaCapture {
    /// Create a stopped capture source.
    #[must_use]
    pub fn new(command: HelperCommand, config: MediaCaptureConfig) -> Self {
        Self {
            command,
            config,
            task: None,
        }
    }
}

#[async_trait]
impl CaptureSource for MediaCapture {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Media
    }

    fn is_running(&self) -> bool {
        self.task.is_some()
    }

    fn start(&mut self, sink: RecordSink) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let command = self.command.clone();
        let backoff = self.config.restart_backoff;
        self.task = Some(tokio::spawn(supervise(command, backoff, sink)));
        info!("Media capture started");
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        // Dropping the supervisor future kills the helper.
        task.abort();
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Media supervisor ended abnormally");
            }
        }
        debug!("Media capture stopped");
    }
}

/// Keep the helper running until aborted.
async fn supervise(command: HelperCommand, backoff: Duration, sink: RecordSink) {
    let mut tracker = NowPlayingTracker::default();
    loop {
        match run_helper(&command, &mut tracker, &sink).await {
            Ok(status) => debug!(%status, "Media helper exited"),
            Err(e) => warn!(error = %e, "Media helper failed"),
        }
        tokio::time::sleep(backoff).await;
        debug!("Restarting media helper");
    }
}

/// Run the helper once, feeding its output through `tracker`.
async fn run_helper(
    command: &HelperCommand,
    tracker: &mut NowPlayingTracker,
    sink: &RecordSink,
) -> std::result::Result<ExitStatus, HelperError> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HelperError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;

    let stdout = child.stdout.take().ok_or(HelperError::MissingStdout)?;
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await.map_err(HelperError::Read)? {
        match parse_helper_line(&line) {
            None => trace!(line = %line, "Ignoring helper line"),
            Some(Err(e)) => debug!(error = %e, "Skipping helper line"),
            Some(Ok(message)) => {
                if let Some(event) = tracker.observe(message) {
                    info!(title = %event.title, source_app = %event.source_app, "Now playing");
                    sink.emit(Record::Media(event));
                }
            }
        }
    }

    child.wait().await.map_err(HelperError::Wait)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    use super::*;

    fn message(title: &str) -> HelperMessage {
        HelperMessage {
            title: title.to_string(),
            ..HelperMessage::default()
        }
    }

    fn shell(script: &str) -> HelperCommand {
        HelperCommand::new("sh", ["-c", script])
    }

    fn fast() -> MediaCaptureConfig {
        MediaCaptureConfig {
            restart_backoff: Duration::from_millis(50),
        }
    }

    async fn next_title(rx: &mut UnboundedReceiver<Record>) -> String {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Record::Media(event))) => event.title,
            other => panic!("expected a media record, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_helper_line() {
        assert!(parse_helper_line("READY").is_none());
        assert!(parse_helper_line("").is_none());
        assert!(parse_helper_line("   ").is_none());

        let parsed = parse_helper_line(
            r#"{"title":"Song","artist":"Band","album":"Record","bundleId":"com.apple.Music"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(parsed.title, "Song");
        assert_eq!(parsed.bundle_id, "com.apple.Music");
        assert!(!parsed.is_nothing_playing());

        let empty = parse_helper_line(r#"{"empty":true}"#).unwrap().unwrap();
        assert!(empty.is_nothing_playing());

        assert!(matches!(
            parse_helper_line("{not json"),
            Some(Err(HelperError::MalformedLine(_)))
        ));
    }

    #[test]
    fn test_null_fields_read_as_empty() {
        let parsed = parse_helper_line(r#"{"title":null,"artist":null,"bundleId":null,"empty":null}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, HelperMessage::default());
        assert!(parsed.is_nothing_playing());
    }

    #[test]
    fn test_null_title_resets_tracker() {
        let mut tracker = NowPlayingTracker::default();
        assert!(tracker.observe(message("A")).is_some());

        let nothing = parse_helper_line(r#"{"title":null,"artist":"Band"}"#)
            .unwrap()
            .unwrap();
        assert!(tracker.observe(nothing).is_none());
        assert_eq!(tracker.current_title(), None);
        assert!(tracker.observe(message("A")).is_some());
    }

    #[test]
    fn test_tracker_collapses_repeats() {
        let mut tracker = NowPlayingTracker::default();
        let titles: Vec<String> = ["A", "A", "", "B", "B", "A"]
            .into_iter()
            .filter_map(|title| tracker.observe(message(title)))
            .map(|event| event.title)
            .collect();
        assert_eq!(titles, vec!["A", "B", "A"]);
    }

    #[test]
    fn test_tracker_resets_on_empty() {
        let mut tracker = NowPlayingTracker::default();
        assert!(tracker.observe(message("A")).is_some());
        assert_eq!(tracker.current_title(), Some("A"));

        let nothing = HelperMessage {
            empty: true,
            ..message("A")
        };
        assert!(tracker.observe(nothing).is_none());
        assert_eq!(tracker.current_title(), None);
        assert!(tracker.observe(message("A")).is_some());
    }

    #[test]
    fn test_tracker_copies_metadata() {
        let mut tracker = NowPlayingTracker::default();
        let event = tracker
            .observe(HelperMessage {
                title: "Song".to_string(),
                artist: "Band".to_string(),
                album: "Record".to_string(),
                bundle_id: "com.spotify.client".to_string(),
                empty: false,
            })
            .unwrap();
        assert_eq!(event.artist, "Band");
        assert_eq!(event.album, "Record");
        assert_eq!(event.source_app, "com.spotify.client");
    }

    #[tokio::test]
    async fn test_capture_reads_helper_output() {
        let script = r#"
            echo READY
            echo '{"title":"A"}'
            echo '{"title":"A"}'
            echo 'diagnostic noise'
            echo '{"empty":true}'
            echo '{broken'
            echo '{"title":"B"}'
            echo '{"title":"B"}'
            echo '{"title":"A"}'
            sleep 5
        "#;
        let mut capture = MediaCapture::new(shell(script), fast());
        let (sink, mut rx) = RecordSink::channel();
        capture.start(sink).unwrap();

        assert_eq!(next_title(&mut rx).await, "A");
        assert_eq!(next_title(&mut rx).await, "B");
        assert_eq!(next_title(&mut rx).await, "A");

        capture.stop().await;
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn test_helper_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let script = format!(
            "echo run >> '{}'; echo '{{\"title\":\"Same\"}}'",
            counter.display()
        );
        let mut capture = MediaCapture::new(shell(&script), fast());
        let (sink, mut rx) = RecordSink::channel();
        capture.start(sink).unwrap();

        assert_eq!(next_title(&mut rx).await, "Same");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let runs = fs::read_to_string(&counter).unwrap_or_default();
            if runs.lines().count() >= 3 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "helper was not restarted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        capture.stop().await;

        // The title did not change across restarts, so nothing else was queued.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_program_keeps_retrying() {
        let mut capture = MediaCapture::new(
            HelperCommand::new("/nonexistent/media-helper", Vec::<String>::new()),
            fast(),
        );
        let (sink, _rx) = RecordSink::channel();
        capture.start(sink).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(capture.is_running());
        capture.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let mut capture = MediaCapture::new(shell("sleep 5"), fast());
        capture.stop().await;

        let (sink, _rx) = RecordSink::channel();
        capture.start(sink.clone()).unwrap();
        capture.start(sink).unwrap();
        assert!(capture.is_running());

        capture.stop().await;
        capture.stop().await;
        assert!(!capture.is_running());
    }
}
