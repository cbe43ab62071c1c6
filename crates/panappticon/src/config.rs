//! Configuration management for panappticon.
//!
//! The configuration is a small, human-edited `key = value` file that lives
//! in the application directory. It is re-read when its modification time
//! changes, which the hotkey path checks on every key press.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};
use crate::shortcut::KeyboardShortcut;

/// Name of the per-user application directory.
pub const APP_DIR_NAME: &str = "Panappticon";

/// Name of the configuration file inside the application directory.
pub const CONFIG_FILE_NAME: &str = "config";

/// Database file name inside the data directory.
pub const DATABASE_FILE_NAME: &str = "panappticon.db";

/// Encrypted screenshot container inside the data directory.
pub const VOLUME_IMAGE_NAME: &str = "screenshots.sparsebundle";

/// Mount point of the screenshot container inside the data directory.
pub const MOUNT_POINT_NAME: &str = ".screenshots_mount";

/// Contents written when no configuration file exists yet.
pub const DEFAULT_TEMPLATE: &str = "\
# Panappticon Configuration
#
# Keyboard shortcut syntax:
#   Modifiers: ctrl, opt (or alt), shift, cmd (or super)
#   Combine with +, e.g.: ctrl+opt+p, cmd+shift+s
#
# The shortcut must include at least one modifier.

toggle_collecting = ctrl+opt+p

# Data collection settings (opt-in, set to true to enable)
collect_keystrokes = false
collect_screenshots = false
collect_media = false

# Storage location for database and screenshots (optional)
# If not set, defaults to the application directory
# data_path = /path/to/data/folder
";

/// The effective configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    /// Shortcut that toggles collection on and off.
    pub toggle_shortcut: KeyboardShortcut,
    /// Record keystrokes while collecting.
    pub collect_keystrokes: bool,
    /// Record periodic screenshots while collecting.
    pub collect_screenshots: bool,
    /// Record now-playing media changes while collecting.
    pub collect_media: bool,
    /// Directory holding the database and the screenshot container.
    pub data_path: PathBuf,
}

impl Config {
    /// Defaults, with data stored in `data_path`.
    #[must_use]
    pub fn with_data_path(data_path: impl Into<PathBuf>) -> Self {
        Self {
            toggle_shortcut: KeyboardShortcut::DEFAULT_TOGGLE,
            collect_keystrokes: false,
            collect_screenshots: false,
            collect_media: false,
            data_path: data_path.into(),
        }
    }

    /// Get the default application directory.
    #[must_use]
    pub fn default_app_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        Self::default_app_dir().join(CONFIG_FILE_NAME)
    }

    /// Path of the encrypted database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_path.join(DATABASE_FILE_NAME)
    }

    /// Path of the encrypted screenshot container.
    #[must_use]
    pub fn volume_image_path(&self) -> PathBuf {
        self.data_path.join(VOLUME_IMAGE_NAME)
    }

    /// Where the screenshot container is mounted.
    #[must_use]
    pub fn mount_point(&self) -> PathBuf {
        self.data_path.join(MOUNT_POINT_NAME)
    }

    /// Whether any capture source is enabled.
    #[must_use]
    pub fn any_collection_enabled(&self) -> bool {
        self.collect_keystrokes || self.collect_screenshots || self.collect_media
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_path(Self::default_app_dir())
    }
}

/// Parse configuration text on top of `defaults`.
///
/// Every field not mentioned in `contents` keeps its value from `defaults`.
/// Problems are collected rather than returned early; the offending line
/// is skipped.
#[must_use]
pub fn parse_config(contents: &str, defaults: Config) -> (Config, Vec<ConfigError>) {
    let mut config = defaults;
    let mut problems = Vec::new();

    for (index, raw) in contents.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            problems.push(ConfigError::MalformedLine {
                line_number,
                line: line.to_string(),
            });
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "toggle_collecting" | "toggle_shortcut" => match KeyboardShortcut::parse(value) {
                Some(shortcut) => config.toggle_shortcut = shortcut,
                None => problems.push(ConfigError::InvalidShortcut {
                    line_number,
                    value: value.to_string(),
                }),
            },
            "collect_keystrokes" => config.collect_keystrokes = parse_bool(value),
            "collect_screenshots" => config.collect_screenshots = parse_bool(value),
            "collect_media" => config.collect_media = parse_bool(value),
            "data_path" => match resolve_data_path(value) {
                Some(path) => config.data_path = path,
                None => problems.push(ConfigError::InvalidDataPath {
                    line_number,
                    value: value.to_string(),
                }),
            },
            other => debug!(key = other, "Ignoring unknown configuration key"),
        }
    }

    (config, problems)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1")
}

fn expand_tilde(value: &str) -> PathBuf {
    if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

/// Expand `~`, create the directory if needed, and accept it only if it is
/// a directory afterwards.
fn resolve_data_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        return None;
    }
    let path = expand_tilde(value);
    if let Err(e) = fs::create_dir_all(&path) {
        warn!(path = %path.display(), error = %e, "Could not create data directory");
    }
    path.is_dir().then_some(path)
}

/// Live-reloadable configuration backed by a file.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    defaults: Config,
    current: RwLock<Config>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Open the configuration at `path`, writing the default template first
    /// if the file does not exist.
    ///
    /// `default_data_path` is used whenever the file does not set `data_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be written.
    pub fn open(path: impl AsRef<Path>, default_data_path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            write_template(&path)?;
            info!(path = %path.display(), "Created default configuration");
        }

        let defaults = Config::with_data_path(default_data_path);
        let store = Self {
            path,
            current: RwLock::new(defaults.clone()),
            defaults,
            last_modified: Mutex::new(None),
        };
        store.reload();
        Ok(store)
    }

    /// Open a configuration file without creating it, for inspection only.
    ///
    /// A missing file yields the defaults.
    #[must_use]
    pub fn read_only(path: impl AsRef<Path>, default_data_path: impl Into<PathBuf>) -> Self {
        let defaults = Config::with_data_path(default_data_path);
        let store = Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(defaults.clone()),
            defaults,
            last_modified: Mutex::new(None),
        };
        store.reload();
        store
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A snapshot of the effective configuration.
    #[must_use]
    pub fn current(&self) -> Config {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the file and replace the configuration.
    ///
    /// Parsing starts from the defaults, so a line removed from the file
    /// reverts to its default. A missing or unreadable file yields the
    /// defaults. Returns the problems found while parsing.
    pub fn reload(&self) -> Vec<ConfigError> {
        let modified = modification_time(&self.path);
        let (config, problems) = match fs::read_to_string(&self.path) {
            Ok(contents) => parse_config(&contents, self.defaults.clone()),
            Err(source) => {
                debug!(path = %self.path.display(), error = %source, "Configuration unreadable, using defaults");
                (
                    self.defaults.clone(),
                    vec![ConfigError::Io {
                        path: self.path.clone(),
                        source,
                    }],
                )
            }
        };

        for problem in &problems {
            warn!(path = %self.path.display(), "{problem}");
        }

        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        *self
            .last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = modified;
        debug!(path = %self.path.display(), "Configuration reloaded");
        problems
    }

    /// Reload if the file's modification time differs from the last one seen.
    ///
    /// Returns whether a reload happened.
    pub fn check_for_changes(&self) -> bool {
        let modified = modification_time(&self.path);
        let seen = *self
            .last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if modified == seen {
            return false;
        }
        self.reload();
        true
    }
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn write_template(path: &Path) -> std::result::Result<(), ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(path, DEFAULT_TEMPLATE).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::Duration;

    use super::*;
    use crate::shortcut::Modifiers;

    fn defaults(dir: &Path) -> Config {
        Config::with_data_path(dir.join("default-data"))
    }

    fn bump_mtime(path: &Path, seconds: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(seconds))
            .unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = Config::with_data_path("/data");
        assert_eq!(config.toggle_shortcut, KeyboardShortcut::DEFAULT_TOGGLE);
        assert!(!config.collect_keystrokes);
        assert!(!config.collect_screenshots);
        assert!(!config.collect_media);
        assert!(!config.any_collection_enabled());
    }

    #[test]
    fn test_derived_paths() {
        let config = Config::with_data_path("/data");
        assert_eq!(config.database_path(), PathBuf::from("/data/panappticon.db"));
        assert_eq!(
            config.volume_image_path(),
            PathBuf::from("/data/screenshots.sparsebundle")
        );
        assert_eq!(
            config.mount_point(),
            PathBuf::from("/data/.screenshots_mount")
        );
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.ends_with("Panappticon/config"));
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, problems) = parse_config(DEFAULT_TEMPLATE, defaults(dir.path()));
        assert!(problems.is_empty());
        assert_eq!(config, defaults(dir.path()));
    }

    #[test]
    fn test_parse_booleans() {
        let dir = tempfile::tempdir().unwrap();
        let text = "collect_keystrokes = YES\ncollect_screenshots = 1\ncollect_media = on\n";
        let (config, problems) = parse_config(text, defaults(dir.path()));
        assert!(problems.is_empty());
        assert!(config.collect_keystrokes);
        assert!(config.collect_screenshots);
        assert!(!config.collect_media);
    }

    #[test]
    fn test_parse_splits_on_first_equals() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a=b");
        let text = format!("data_path = {}\n", target.display());
        let (config, problems) = parse_config(&text, defaults(dir.path()));
        assert!(problems.is_empty());
        assert_eq!(config.data_path, target);
        assert!(target.is_dir());
    }

    #[test]
    fn test_parse_skips_comments_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let text = "# collect_media = true\n\n   \ncollect_media\ncollect_keystrokes = true\n";
        let (config, problems) = parse_config(text, defaults(dir.path()));
        assert!(!config.collect_media);
        assert!(config.collect_keystrokes);
        assert_eq!(problems.len(), 1);
        assert!(matches!(
            problems[0],
            ConfigError::MalformedLine { line_number: 4, .. }
        ));
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (config, problems) = parse_config("future_option = 7\n", defaults(dir.path()));
        assert!(problems.is_empty());
        assert_eq!(config, defaults(dir.path()));
    }

    #[test]
    fn test_parse_shortcut_and_alias_key() {
        let dir = tempfile::tempdir().unwrap();
        let (config, _) = parse_config("toggle_shortcut = cmd+shift+k\n", defaults(dir.path()));
        assert_eq!(
            config.toggle_shortcut.modifiers,
            Modifiers::CMD | Modifiers::SHIFT
        );

        let (config, problems) = parse_config("toggle_collecting = k\n", defaults(dir.path()));
        assert_eq!(config.toggle_shortcut, KeyboardShortcut::DEFAULT_TOGGLE);
        assert!(matches!(problems[0], ConfigError::InvalidShortcut { .. }));
    }

    #[test]
    fn test_data_path_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();
        let text = format!("data_path = {}\n", file.display());
        let (config, problems) = parse_config(&text, defaults(dir.path()));
        assert_eq!(config.data_path, dir.path().join("default-data"));
        assert!(matches!(problems[0], ConfigError::InvalidDataPath { .. }));
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/captures"), home.join("captures"));
        assert_eq!(expand_tilde("/abs/~/x"), PathBuf::from("/abs/~/x"));
    }

    #[test]
    fn test_open_creates_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app").join("config");
        let store = ConfigStore::open(&path, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_TEMPLATE);
        assert_eq!(store.current(), Config::with_data_path(dir.path()));
    }

    #[test]
    fn test_reload_resets_unspecified_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(
            &path,
            "collect_keystrokes = true\ncollect_screenshots = true\ncollect_media = true\n",
        )
        .unwrap();
        let store = ConfigStore::open(&path, dir.path()).unwrap();
        assert!(store.current().collect_media);

        fs::write(&path, "collect_keystrokes = true\n").unwrap();
        store.reload();
        let config = store.current();
        assert!(config.collect_keystrokes);
        assert!(!config.collect_screenshots);
        assert!(!config.collect_media);
    }

    #[test]
    fn test_reload_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "collect_media = true\n").unwrap();
        let store = ConfigStore::open(&path, dir.path()).unwrap();

        fs::remove_file(&path).unwrap();
        let problems = store.reload();
        assert!(matches!(problems[0], ConfigError::Io { .. }));
        assert!(!store.current().collect_media);
    }

    #[test]
    fn test_check_for_changes_detects_new_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let store = ConfigStore::open(&path, dir.path()).unwrap();
        assert!(!store.check_for_changes());

        fs::write(&path, "collect_screenshots = true\n").unwrap();
        bump_mtime(&path, 5);
        assert!(store.check_for_changes());
        assert!(store.current().collect_screenshots);
        assert!(!store.check_for_changes());
    }

    #[test]
    fn test_check_for_changes_ignores_same_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let store = ConfigStore::open(&path, dir.path()).unwrap();
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        fs::write(&path, "collect_screenshots = true\n").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(before)
            .unwrap();
        assert!(!store.check_for_changes());
        assert!(!store.current().collect_screenshots);
    }

    #[test]
    fn test_read_only_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let store = ConfigStore::read_only(&path, dir.path());
        assert!(!path.exists());
        assert_eq!(store.current(), Config::with_data_path(dir.path()));
    }
}
