//! Periodic screenshot capture.
//!
//! Every tick captures each active display, writes it as a JPEG into the
//! encrypted volume and records one row per file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capture::{
    timestamp_text, CaptureKind, CaptureSource, Record, RecordSink, ScreenshotEvent,
};
use crate::error::Result;
use crate::platform::ForegroundApp;
use crate::volume::EncryptedVolume;

/// Time between captures.
pub const CAPTURE_INTERVAL: Duration = Duration::from_secs(30);

/// JPEG quality, 0-100.
pub const JPEG_QUALITY: u8 = 70;

/// Screen access: permission and raster capture of each display.
pub trait DisplaySource: Send + Sync {
    /// Whether screen recording is permitted.
    fn has_permission(&self) -> bool;

    /// Ask the OS to show its screen-recording permission prompt.
    fn request_permission(&self);

    /// Identifiers of the active displays, in a stable order.
    fn displays(&self) -> Vec<u32>;

    /// Capture one display, `None` if the OS returned no image.
    fn capture(&self, display: u32) -> Option<RgbImage>;
}

/// File name of a capture, e.g. `screenshot_2024-05-01T09-30-00Z_display0.jpg`.
#[must_use]
pub fn screenshot_filename(timestamp: &DateTime<Utc>, display_index: u32) -> String {
    let safe = timestamp_text(timestamp).replace(':', "-");
    format!("screenshot_{safe}_display{display_index}.jpg")
}

/// Most `_N` suffixes tried before an existing capture is overwritten.
const MAX_NAME_SUFFIX: u32 = 999;

/// A capture file name not yet present in `directory`.
///
/// Captures within the same second would share a name, so a taken name gets
/// a `_N` suffix before the extension.
fn unused_filename(directory: &Path, timestamp: &DateTime<Utc>, display_index: u32) -> String {
    let name = screenshot_filename(timestamp, display_index);
    if !directory.join(&name).exists() {
        return name;
    }
    let stem = name.trim_end_matches(".jpg");
    (1..=MAX_NAME_SUFFIX)
        .map(|n| format!("{stem}_{n}.jpg"))
        .find(|candidate| !directory.join(candidate).exists())
        .unwrap_or(name)
}

/// Encode `image` as JPEG at `path`. A partial file is removed on failure.
///
/// # Errors
///
/// Returns the I/O or encoder error.
pub fn write_jpeg(path: &Path, image: &RgbImage) -> image::ImageResult<()> {
    let result = encode_into(path, image);
    if result.is_err() && path.is_file() {
        let _ = fs::remove_file(path);
    }
    result
}

fn encode_into(path: &Path, image: &RgbImage) -> image::ImageResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode_image(image)?;
    writer.flush()?;
    Ok(())
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Screen recording is not permitted yet.
    NoPermission,
    /// The volume is not mounted.
    DirectoryUnavailable,
    /// This many files were written and recorded.
    Captured(usize),
}

/// The per-tick work, kept apart from the timer so it can run on the
/// blocking pool.
struct Ticker {
    displays: Arc<dyn DisplaySource>,
    apps: Arc<dyn ForegroundApp>,
    volume: Arc<EncryptedVolume>,
    sink: RecordSink,
    permission_requested: bool,
}

impl Ticker {
    fn tick(&mut self) -> TickOutcome {
        self.tick_at(Utc::now())
    }

    fn tick_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        // Checked every tick so capture begins once access is granted; the
        // prompt is shown once per run.
        if !self.displays.has_permission() {
            if !self.permission_requested {
                self.permission_requested = true;
                info!("Requesting screen recording permission");
                self.displays.request_permission();
            }
            return TickOutcome::NoPermission;
        }

        let Some(directory) = self.volume.capture_directory() else {
            debug!("Screenshot volume not mounted, skipping capture");
            return TickOutcome::DirectoryUnavailable;
        };

        let app = self.apps.frontmost().unwrap_or_default();
        let mut captured = 0;

        for (index, display_id) in (0u32..).zip(self.displays.displays()) {
            let Some(image) = self.displays.capture(display_id) else {
                debug!(display = display_id, "No image for display");
                continue;
            };

            let filename = unused_filename(&directory, &now, index);
            if let Err(e) = write_jpeg(&directory.join(&filename), &image) {
                warn!(filename = %filename, error = %e, "Failed to write screenshot");
                continue;
            }

            self.sink.emit(Record::Screenshot(ScreenshotEvent {
                id: None,
                filename,
                display_index: index,
                active_app: app.name.clone(),
                active_bundle: app.bundle_id.clone(),
                timestamp: now,
            }));
            captured += 1;
        }

        TickOutcome::Captured(captured)
    }
}

/// Captures every display on a fixed interval.
pub struct ScreenshotCapture {
    displays: Arc<dyn DisplaySource>,
    apps: Arc<dyn ForegroundApp>,
    volume: Arc<EncryptedVolume>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ScreenshotCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenshotCapture")
            .field("volume", &self.volume)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ScreenshotCapture {
    /// Create a stopped capture source writing into `volume`.
    #[must_use]
    pub fn new(
        displays: Arc<dyn DisplaySource>,
        apps: Arc<dyn ForegroundApp>,
        volume: Arc<EncryptedVolume>,
    ) -> Self {
        Self {
            displays,
            apps,
            volume,
            interval: CAPTURE_INTERVAL,
            task: None,
        }
    }

    /// Use a different capture interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl CaptureSource for ScreenshotCapture {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Screenshots
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn start(&mut self, sink: RecordSink) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let mut ticker = Ticker {
            displays: Arc::clone(&self.displays),
            apps: Arc::clone(&self.apps),
            volume: Arc::clone(&self.volume),
            sink,
            permission_requested: false,
        };
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // The first tick completes immediately.
                interval.tick().await;
                let handle = tokio::task::spawn_blocking(move || {
                    let outcome = ticker.tick();
                    (ticker, outcome)
                });
                match handle.await {
                    Ok((returned, outcome)) => {
                        ticker = returned;
                        debug!(?outcome, "Screenshot tick");
                    }
                    Err(e) => {
                        warn!(error = %e, "Screenshot tick panicked, stopping");
                        break;
                    }
                }
            }
        }));
        info!(interval_secs = period.as_secs(), "Screenshot capture started");
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        let _ = task.await;
        debug!("Screenshot capture stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use image::Rgb;
    use tokio::time::timeout;

    use super::*;
    use crate::platform::fakes::FixedApp;
    use crate::volume::fakes::FakeBackend;

    struct FakeDisplays {
        ids: Vec<u32>,
        blank: Vec<u32>,
        panics: bool,
        permitted: AtomicBool,
        requests: AtomicUsize,
    }

    impl FakeDisplays {
        fn new(ids: Vec<u32>) -> Self {
            Self {
                ids,
                blank: Vec::new(),
                panics: false,
                permitted: AtomicBool::new(true),
                requests: AtomicUsize::new(0),
            }
        }
    }

    impl DisplaySource for FakeDisplays {
        fn has_permission(&self) -> bool {
            self.permitted.load(Ordering::SeqCst)
        }

        fn request_permission(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn displays(&self) -> Vec<u32> {
            self.ids.clone()
        }

        fn capture(&self, display: u32) -> Option<RgbImage> {
            assert!(!self.panics, "display {display} capture failed");
            if self.blank.contains(&display) {
                return None;
            }
            Some(RgbImage::from_pixel(8, 4, Rgb([32, 64, 128])))
        }
    }

    fn mounted_volume(dir: &Path) -> Arc<EncryptedVolume> {
        let volume = EncryptedVolume::with_backend(
            dir.join("screenshots.sparsebundle"),
            dir.join("mount"),
            Box::new(Arc::new(FakeBackend::default())),
        );
        volume.open("passphrase").unwrap();
        Arc::new(volume)
    }

    fn ticker(
        displays: Arc<FakeDisplays>,
        volume: Arc<EncryptedVolume>,
    ) -> (Ticker, tokio::sync::mpsc::UnboundedReceiver<Record>) {
        let (sink, rx) = RecordSink::channel();
        let ticker = Ticker {
            displays,
            apps: Arc::new(FixedApp::named("Safari", "com.apple.Safari")),
            volume,
            sink,
            permission_requested: false,
        };
        (ticker, rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Record>) -> Vec<ScreenshotEvent> {
        let mut events = Vec::new();
        while let Ok(Record::Screenshot(event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_screenshot_filename() {
        assert_eq!(
            screenshot_filename(&fixed_time(), 1),
            "screenshot_2024-05-01T09-30-00Z_display1.jpg"
        );
    }

    #[test]
    fn test_write_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.jpg");
        write_jpeg(&path, &RgbImage::new(16, 16)).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_tick_records_one_row_per_display() {
        let dir = tempfile::tempdir().unwrap();
        let volume = mounted_volume(dir.path());
        let (mut ticker, mut rx) = ticker(Arc::new(FakeDisplays::new(vec![5, 9, 2])), volume);

        assert_eq!(ticker.tick_at(fixed_time()), TickOutcome::Captured(3));

        let events = drain(&mut rx);
        let indices: Vec<u32> = events.iter().map(|e| e.display_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        for event in &events {
            assert!(event.filename.contains(&format!("_display{}.", event.display_index)));
            assert!(dir.path().join("mount").join(&event.filename).is_file());
            assert_eq!(event.active_app, "Safari");
            assert_eq!(event.active_bundle, "com.apple.Safari");
        }
    }

    #[test]
    fn test_failed_display_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let volume = mounted_volume(dir.path());
        let mut displays = FakeDisplays::new(vec![1, 2, 3]);
        displays.blank = vec![1];
        let (mut ticker, mut rx) = ticker(Arc::new(displays), volume);

        assert_eq!(ticker.tick_at(fixed_time()), TickOutcome::Captured(2));
        let events = drain(&mut rx);
        let indices: Vec<u32> = events.iter().map(|e| e.display_index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_same_second_capture_keeps_earlier_file() {
        let dir = tempfile::tempdir().unwrap();
        let volume = mounted_volume(dir.path());
        let (mut ticker, mut rx) = ticker(Arc::new(FakeDisplays::new(vec![1])), volume);
        let mount = dir.path().join("mount");
        let now = fixed_time();

        fs::write(mount.join(screenshot_filename(&now, 0)), b"earlier").unwrap();
        assert_eq!(ticker.tick_at(now), TickOutcome::Captured(1));
        assert_eq!(ticker.tick_at(now), TickOutcome::Captured(1));

        let names: Vec<String> = drain(&mut rx).into_iter().map(|e| e.filename).collect();
        assert_eq!(
            names,
            vec![
                "screenshot_2024-05-01T09-30-00Z_display0_1.jpg",
                "screenshot_2024-05-01T09-30-00Z_display0_2.jpg",
            ]
        );
        assert_eq!(fs::read(mount.join(screenshot_filename(&now, 0))).unwrap(), b"earlier");
        for name in &names {
            assert!(mount.join(name).is_file());
        }
    }

    #[test]
    fn test_permission_is_requested_once_and_rechecked() {
        let dir = tempfile::tempdir().unwrap();
        let volume = mounted_volume(dir.path());
        let displays = Arc::new(FakeDisplays::new(vec![1]));
        displays.permitted.store(false, Ordering::SeqCst);
        let (mut ticker, mut rx) = ticker(Arc::clone(&displays), volume);

        assert_eq!(ticker.tick(), TickOutcome::NoPermission);
        assert_eq!(ticker.tick(), TickOutcome::NoPermission);
        assert_eq!(displays.requests.load(Ordering::SeqCst), 1);
        assert!(drain(&mut rx).is_empty());

        displays.permitted.store(true, Ordering::SeqCst);
        assert_eq!(ticker.tick(), TickOutcome::Captured(1));
    }

    #[test]
    fn test_unmounted_volume_skips_tick() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Arc::new(EncryptedVolume::with_backend(
            dir.path().join("img"),
            dir.path().join("mount"),
            Box::new(Arc::new(FakeBackend::default())),
        ));
        let (mut ticker, mut rx) = ticker(Arc::new(FakeDisplays::new(vec![1])), volume);

        assert_eq!(ticker.tick(), TickOutcome::DirectoryUnavailable);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_start_captures_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let volume = mounted_volume(dir.path());
        let mut capture = ScreenshotCapture::new(
            Arc::new(FakeDisplays::new(vec![1, 2])),
            Arc::new(FixedApp(None)),
            volume,
        )
        .with_interval(Duration::from_secs(3600));
        let (sink, mut rx) = RecordSink::channel();

        capture.start(sink.clone()).unwrap();
        capture.start(sink).unwrap();

        for _ in 0..2 {
            let record = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
            assert!(matches!(record, Some(Record::Screenshot(_))));
        }

        capture.stop().await;
        capture.stop().await;
        assert!(!capture.is_running());
        // Only one tick ran, so no further rows.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicked_tick_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let volume = mounted_volume(dir.path());
        let mut displays = FakeDisplays::new(vec![1]);
        displays.panics = true;
        let mut capture =
            ScreenshotCapture::new(Arc::new(displays), Arc::new(FixedApp(None)), volume)
                .with_interval(Duration::from_secs(3600));
        let (sink, _rx) = RecordSink::channel();

        capture.start(sink.clone()).unwrap();
        timeout(Duration::from_secs(5), async {
            while capture.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A dead ticker can be started again.
        capture.start(sink).unwrap();
        assert!(capture.is_running());
        capture.stop().await;
        assert!(!capture.is_running());
    }
}
