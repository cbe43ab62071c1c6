//! Keystroke capture.
//!
//! Raw key events from a [`KeyTap`] are turned into labels such as `a`,
//! `Cmd+c` or `Ctrl+Shift+[Return]` and queued as [`KeystrokeEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capture::{CaptureKind, CaptureSource, KeystrokeEvent, Record, RecordSink};
use crate::error::Result;
use crate::platform::{ForegroundApp, UNKNOWN_APP};
use crate::shortcut::{Key, KeyEvent, Modifiers};

/// Callback invoked for every key press.
pub type KeyHandler = Arc<dyn Fn(KeyEvent) + Send + Sync>;

/// A global, listen-only observer of key presses.
///
/// Implementations deliver events on their own thread and must re-enable
/// themselves if the OS disables the observer after a timeout.
pub trait KeyTap: Send {
    /// Start delivering key presses to `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the observer (usually a missing
    /// accessibility permission).
    fn install(&mut self, handler: KeyHandler) -> Result<()>;

    /// Stop delivering key presses. Does nothing if not installed.
    fn remove(&mut self);
}

const SPECIAL_KEYS: &[(u16, &str)] = &[
    (36, "Return"),
    (48, "Tab"),
    (49, "Space"),
    (51, "Delete"),
    (53, "Escape"),
    (76, "Enter"),
    (115, "Home"),
    (116, "PageUp"),
    (117, "ForwardDelete"),
    (119, "End"),
    (121, "PageDown"),
    (123, "LeftArrow"),
    (124, "RightArrow"),
    (125, "DownArrow"),
    (126, "UpArrow"),
    (122, "F1"),
    (120, "F2"),
    (99, "F3"),
    (118, "F4"),
    (96, "F5"),
    (97, "F6"),
    (98, "F7"),
    (100, "F8"),
    (101, "F9"),
    (109, "F10"),
    (103, "F11"),
    (111, "F12"),
];

/// Name of a non-printing key, if `code` is one.
#[must_use]
pub fn special_key_name(code: u16) -> Option<&'static str> {
    SPECIAL_KEYS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// The key part of a label, and whether it names a special key.
fn key_text(event: &KeyEvent) -> (String, bool) {
    if let Some(name) = special_key_name(event.code) {
        return (format!("[{name}]"), true);
    }

    // Ctrl turns letters into control characters; use the key name instead.
    match event.text.as_deref() {
        Some(text) if !text.is_empty() && !text.chars().any(char::is_control) => {
            (text.to_string(), false)
        }
        _ => match Key(event.code).name() {
            Some(name) => (name.to_string(), false),
            None => (format!("[Key:{}]", event.code), true),
        },
    }
}

/// Render a key press as a label.
///
/// Modifiers come first in the order Ctrl, Alt, Shift, Cmd. Shift is left
/// out when it is the only modifier and the key produced a single printable
/// character, since the character already reflects it (`A`, `?`).
#[must_use]
pub fn key_label(event: &KeyEvent) -> String {
    let (text, special) = key_text(event);
    let modifiers = event.modifiers.relevant();
    let shift_is_glyph =
        modifiers == Modifiers::SHIFT && !special && text.chars().count() == 1;

    let mut parts: Vec<&str> = Vec::with_capacity(5);
    if modifiers.contains(Modifiers::CTRL) {
        parts.push("Ctrl");
    }
    if modifiers.contains(Modifiers::OPT) {
        parts.push("Alt");
    }
    if modifiers.contains(Modifiers::SHIFT) && !shift_is_glyph {
        parts.push("Shift");
    }
    if modifiers.contains(Modifiers::CMD) {
        parts.push("Cmd");
    }
    parts.push(&text);
    parts.join("+")
}

/// Records every key press together with the foreground application.
pub struct KeystrokeCapture {
    tap: Box<dyn KeyTap>,
    apps: Arc<dyn ForegroundApp>,
    running: bool,
}

impl KeystrokeCapture {
    /// Create a stopped capture source.
    #[must_use]
    pub fn new(tap: Box<dyn KeyTap>, apps: Arc<dyn ForegroundApp>) -> Self {
        Self {
            tap,
            apps,
            running: false,
        }
    }
}

impl std::fmt::Debug for KeystrokeCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystrokeCapture")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CaptureSource for KeystrokeCapture {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Keystrokes
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn start(&mut self, sink: RecordSink) -> Result<()> {
        if self.running {
            return Ok(());
        }

        let apps = Arc::clone(&self.apps);
        let handler: KeyHandler = Arc::new(move |event: KeyEvent| {
            let application = apps
                .frontmost()
                .map(|app| app.name)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN_APP.to_string());
            sink.emit(Record::Keystroke(KeystrokeEvent::new(
                key_label(&event),
                application,
            )));
        });

        self.tap.install(handler)?;
        self.running = true;
        info!("Keystroke capture started");
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.tap.remove();
        self.running = false;
        debug!("Keystroke capture stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeTap;
    use super::*;
    use crate::platform::fakes::FixedApp;

    fn press(code: u16, modifiers: Modifiers, text: Option<&str>) -> String {
        key_label(&KeyEvent::new(code, modifiers, text))
    }

    #[test]
    fn test_plain_and_special_keys() {
        assert_eq!(press(0, Modifiers::NONE, Some("a")), "a");
        assert_eq!(press(36, Modifiers::NONE, Some("\r")), "[Return]");
        assert_eq!(press(122, Modifiers::NONE, None), "[F1]");
        assert_eq!(press(126, Modifiers::NONE, None), "[UpArrow]");
    }

    #[test]
    fn test_unknown_key_without_text() {
        assert_eq!(press(105, Modifiers::NONE, None), "[Key:105]");
        assert_eq!(press(105, Modifiers::NONE, Some("")), "[Key:105]");
    }

    #[test]
    fn test_modifier_order() {
        let all = Modifiers::CMD | Modifiers::SHIFT | Modifiers::OPT | Modifiers::CTRL;
        assert_eq!(press(0, all, Some("a")), "Ctrl+Alt+Shift+Cmd+a");
        assert_eq!(press(8, Modifiers::CMD, Some("c")), "Cmd+c");
    }

    #[test]
    fn test_sole_shift_is_dropped_for_glyphs() {
        assert_eq!(press(0, Modifiers::SHIFT, Some("A")), "A");
        assert_eq!(press(44, Modifiers::SHIFT, Some("?")), "?");
    }

    #[test]
    fn test_shift_is_kept_otherwise() {
        assert_eq!(press(36, Modifiers::SHIFT, Some("\r")), "Shift+[Return]");
        assert_eq!(press(105, Modifiers::SHIFT, None), "Shift+[Key:105]");
        assert_eq!(
            press(0, Modifiers::CMD | Modifiers::SHIFT, Some("A")),
            "Shift+Cmd+A"
        );
    }

    #[test]
    fn test_control_characters_use_key_name() {
        assert_eq!(press(0, Modifiers::CTRL, Some("\u{1}")), "Ctrl+a");
    }

    #[test]
    fn test_irrelevant_modifiers_are_ignored() {
        assert_eq!(press(0, Modifiers::CAPS_LOCK, Some("A")), "A");
        assert_eq!(
            press(0, Modifiers::SHIFT | Modifiers::CAPS_LOCK, Some("A")),
            "A"
        );
    }

    #[tokio::test]
    async fn test_capture_emits_events() {
        let tap = FakeTap::default();
        let mut capture = KeystrokeCapture::new(
            Box::new(tap.clone()),
            Arc::new(FixedApp::named("Terminal", "com.apple.Terminal")),
        );
        let (sink, mut rx) = RecordSink::channel();

        capture.start(sink).unwrap();
        tap.press(KeyEvent::new(8, Modifiers::CMD, Some("c")));

        let Some(Record::Keystroke(event)) = rx.recv().await else {
            panic!("expected a keystroke record");
        };
        assert_eq!(event.keystroke, "Cmd+c");
        assert_eq!(event.application, "Terminal");
    }

    #[tokio::test]
    async fn test_unknown_application() {
        let tap = FakeTap::default();
        let mut capture = KeystrokeCapture::new(Box::new(tap.clone()), Arc::new(FixedApp(None)));
        let (sink, mut rx) = RecordSink::channel();

        capture.start(sink).unwrap();
        tap.press(KeyEvent::new(0, Modifiers::NONE, Some("a")));

        let Some(Record::Keystroke(event)) = rx.recv().await else {
            panic!("expected a keystroke record");
        };
        assert_eq!(event.application, "Unknown");
    }

    #[tokio::test]
    async fn test_start_twice_installs_once() {
        let tap = FakeTap::default();
        let mut capture = KeystrokeCapture::new(Box::new(tap.clone()), Arc::new(FixedApp(None)));
        let (sink, mut rx) = RecordSink::channel();

        capture.start(sink.clone()).unwrap();
        capture.start(sink).unwrap();
        assert_eq!(*tap.installs.lock().unwrap(), 1);

        tap.press(KeyEvent::new(0, Modifiers::NONE, Some("a")));
        capture.stop().await;
        drop(capture);
        drop(tap);

        let mut count = 0;
        while let Ok(record) = rx.try_recv() {
            assert_eq!(record.kind(), CaptureKind::Keystrokes);
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_and_after_stop() {
        let tap = FakeTap::default();
        let mut capture = KeystrokeCapture::new(Box::new(tap.clone()), Arc::new(FixedApp(None)));

        capture.stop().await;
        assert!(!capture.is_running());

        let (sink, _rx) = RecordSink::channel();
        capture.start(sink).unwrap();
        assert!(tap.is_installed());
        capture.stop().await;
        assert!(!tap.is_installed());
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn test_refused_tap_stays_stopped() {
        let tap = FakeTap {
            refuse: true,
            ..FakeTap::default()
        };
        let mut capture = KeystrokeCapture::new(Box::new(tap), Arc::new(FixedApp(None)));
        let (sink, _rx) = RecordSink::channel();

        assert!(capture.start(sink).unwrap_err().is_permission_error());
        assert!(!capture.is_running());
    }
}
