//! The collecting on/off hotkey.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app::ControlCommand;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::keystroke::{KeyHandler, KeyTap};
use crate::shortcut::KeyEvent;

/// Whether `event` is the configured toggle shortcut.
///
/// Also reloads the configuration if the file changed, so an edited shortcut
/// applies from the next key press.
pub fn is_toggle(config: &ConfigStore, event: &KeyEvent) -> bool {
    if config.check_for_changes() {
        debug!("Configuration reloaded");
    }
    config.current().toggle_shortcut.matches(event)
}

/// Watches all key presses for the toggle shortcut.
pub struct HotkeyWatcher {
    tap: Box<dyn KeyTap>,
    config: Arc<ConfigStore>,
    installed: bool,
}

impl std::fmt::Debug for HotkeyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotkeyWatcher")
            .field("config", &self.config.path())
            .field("installed", &self.installed)
            .finish_non_exhaustive()
    }
}

impl HotkeyWatcher {
    /// Create an inactive watcher.
    #[must_use]
    pub fn new(tap: Box<dyn KeyTap>, config: Arc<ConfigStore>) -> Self {
        Self {
            tap,
            config,
            installed: false,
        }
    }

    /// Whether the watcher is active.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Send [`ControlCommand::Toggle`] on `commands` for every press of the
    /// shortcut. Reinstalling replaces the previous observer.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the key observer.
    pub fn install(&mut self, commands: mpsc::UnboundedSender<ControlCommand>) -> Result<()> {
        self.remove();

        let config = Arc::clone(&self.config);
        let handler: KeyHandler = Arc::new(move |event: KeyEvent| {
            if is_toggle(&config, &event) {
                // The control loop may already be gone during shutdown.
                let _ = commands.send(ControlCommand::Toggle);
            }
        });
        self.tap.install(handler)?;
        self.installed = true;
        info!(shortcut = %self.config.current().toggle_shortcut, "Toggle hotkey installed");
        Ok(())
    }

    /// Stop watching. Does nothing if not installed.
    pub fn remove(&mut self) {
        if self.installed {
            self.tap.remove();
            self.installed = false;
        }
    }
}

impl Drop for HotkeyWatcher {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::keystroke::fakes::FakeTap;
    use crate::shortcut::Modifiers;

    fn store(dir: &std::path::Path, contents: &str) -> Arc<ConfigStore> {
        let path = dir.join("config");
        fs::write(&path, contents).unwrap();
        Arc::new(ConfigStore::open(&path, dir).unwrap())
    }

    fn ctrl_opt(code: u16) -> KeyEvent {
        KeyEvent::new(code, Modifiers::CTRL | Modifiers::OPT, None)
    }

    #[test]
    fn test_is_toggle_uses_configured_shortcut() {
        let dir = tempfile::tempdir().unwrap();
        let config = store(dir.path(), "toggle_collecting = ctrl+opt+p\n");

        assert!(is_toggle(&config, &ctrl_opt(35)));
        assert!(!is_toggle(&config, &ctrl_opt(0)));
        assert!(!is_toggle(
            &config,
            &KeyEvent::new(35, Modifiers::CTRL | Modifiers::OPT | Modifiers::SHIFT, None)
        ));
    }

    #[test]
    fn test_is_toggle_picks_up_edits() {
        let dir = tempfile::tempdir().unwrap();
        let config = store(dir.path(), "toggle_collecting = ctrl+opt+p\n");
        let path = dir.path().join("config");

        fs::write(&path, "toggle_collecting = cmd+shift+k\n").unwrap();
        let later = SystemTime::now() + Duration::from_secs(10);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(!is_toggle(&config, &ctrl_opt(35)));
        assert!(is_toggle(
            &config,
            &KeyEvent::new(40, Modifiers::CMD | Modifiers::SHIFT, Some("K"))
        ));
    }

    #[tokio::test]
    async fn test_watcher_sends_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let config = store(dir.path(), "toggle_collecting = ctrl+opt+p\n");
        let tap = FakeTap::default();
        let mut watcher = HotkeyWatcher::new(Box::new(tap.clone()), config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        watcher.install(tx).unwrap();
        tap.press(ctrl_opt(0));
        tap.press(ctrl_opt(35));

        assert_eq!(rx.recv().await, Some(ControlCommand::Toggle));
        assert!(rx.try_recv().is_err());

        watcher.remove();
        assert!(!tap.is_installed());
        assert!(!watcher.is_installed());
    }
}
