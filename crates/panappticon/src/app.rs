//! Application wiring: startup, the collector and the control loop.
//!
//! [`AppContext`] owns the long-lived resources (configuration, store,
//! volume). [`Collector`] turns the capture sources on and off as a unit.
//! [`run_control_loop`] serializes toggle and shutdown requests coming from
//! the hotkey and the console.

use std::fs;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureKind, CaptureSource, RecordSink};
use crate::config::{Config, ConfigStore};
use crate::error::{Error, Result};
use crate::platform::PermissionGate;
use crate::shutdown;
use crate::storage::EncryptedStore;
use crate::volume::{EncryptedVolume, VolumeBackend, VolumeState};

/// Requests handled by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start collecting if stopped, stop if collecting.
    Toggle,
    /// Stop collecting and leave the loop.
    Shutdown,
}

/// Interpret a line typed on the console.
#[must_use]
pub fn parse_console_command(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "t" | "toggle" => Some(ControlCommand::Toggle),
        "q" | "quit" | "exit" => Some(ControlCommand::Shutdown),
        _ => None,
    }
}

/// Forward console commands from stdin to `commands` until stdin closes.
pub fn spawn_console(commands: mpsc::UnboundedSender<ControlCommand>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_console_command(&line) {
                Some(command) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(input = %line.trim(), "Unknown command, use `toggle` or `quit`"),
            }
        }
        debug!("Console closed");
    })
}

/// The resources opened at startup and released at shutdown.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Live configuration.
    pub config: Arc<ConfigStore>,
    /// Encrypted database.
    pub store: Arc<EncryptedStore>,
    /// Encrypted screenshot volume.
    pub volume: Arc<EncryptedVolume>,
}

impl AppContext {
    /// Open the store and the volume and install the shutdown hook.
    ///
    /// Paths come from the configuration as it is now; a later change of
    /// `data_path` takes effect at the next start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryCreate`] if the data directory cannot be
    /// created, or a store error if the database cannot be opened. A volume
    /// that cannot be mounted is logged and leaves screenshots without a directory.
    pub fn initialize(
        config: Arc<ConfigStore>,
        passphrase: &str,
        volume_backend: Box<dyn VolumeBackend>,
    ) -> Result<Self> {
        let current = config.current();
        fs::create_dir_all(&current.data_path).map_err(|source| {
            error!(path = %current.data_path.display(), error = %source, "Cannot create data directory");
            Error::DirectoryCreate {
                path: current.data_path.clone(),
                source,
            }
        })?;

        let store = match EncryptedStore::open(current.database_path(), passphrase) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open encrypted database");
                return Err(e.into());
            }
        };

        let volume = Arc::new(EncryptedVolume::with_backend(
            current.volume_image_path(),
            current.mount_point(),
            volume_backend,
        ));
        match volume.open(passphrase) {
            Ok(VolumeState::Mounted) => {}
            Ok(VolumeState::Unmounted) => warn!("Screenshot volume not mounted"),
            Err(e) => error!(error = %e, "Screenshot volume unavailable, screenshots disabled"),
        }

        let context = Self {
            config,
            store,
            volume,
        };

        let hook = context.clone();
        if shutdown::install_once(move || hook.shutdown()) {
            debug!("Shutdown hook installed");
        }

        Ok(context)
    }

    /// Close the store and unmount the volume. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if let Err(e) = self.volume.unmount() {
            error!(error = %e, "Failed to unmount screenshot volume");
        }
        self.store.close();
    }
}

/// Whether `config` enables capture sources of `kind`.
#[must_use]
pub fn is_enabled(config: &Config, kind: CaptureKind) -> bool {
    match kind {
        CaptureKind::Keystrokes => config.collect_keystrokes,
        CaptureKind::Media => config.collect_media,
        CaptureKind::Screenshots => config.collect_screenshots,
    }
}

/// Starts and stops all capture sources together.
pub struct Collector {
    sources: Vec<Box<dyn CaptureSource>>,
    config: Arc<ConfigStore>,
    permissions: Arc<dyn PermissionGate>,
    sink: RecordSink,
    collecting: bool,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("sources", &self.sources.len())
            .field("collecting", &self.collecting)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Create a collector with no sources.
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        permissions: Arc<dyn PermissionGate>,
        sink: RecordSink,
    ) -> Self {
        Self {
            sources: Vec::new(),
            config,
            permissions,
            sink,
            collecting: false,
        }
    }

    /// Register a capture source.
    pub fn add_source(&mut self, source: Box<dyn CaptureSource>) {
        self.sources.push(source);
    }

    /// Whether collection is on.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Kinds of the sources currently running.
    #[must_use]
    pub fn running(&self) -> Vec<CaptureKind> {
        self.sources
            .iter()
            .filter(|source| source.is_running())
            .map(|source| source.kind())
            .collect()
    }

    /// Start every source enabled in the current configuration.
    ///
    /// A source that fails to start is logged and skipped. Its failure is
    /// returned as an [`Error::CaptureSourceStart`] among the others.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionMissing`] if the process is not trusted
    /// for accessibility; nothing is started then.
    pub fn start(&mut self) -> Result<Vec<Error>> {
        if self.collecting {
            return Ok(Vec::new());
        }
        if !self.permissions.accessibility_trusted(true) {
            return Err(Error::permission_missing("Accessibility"));
        }

        let config = self.config.current();
        let mut failures = Vec::new();
        for source in &mut self.sources {
            let kind = source.kind();
            if !is_enabled(&config, kind) {
                debug!(%kind, "Capture source disabled in configuration");
                continue;
            }
            if let Err(e) = source.start(self.sink.clone()) {
                let failure = Error::capture_source_start(kind.name(), e.to_string());
                warn!(%kind, error = %failure, "Capture source failed to start");
                failures.push(failure);
            }
        }

        if !config.any_collection_enabled() {
            warn!(path = %self.config.path().display(), "No capture source is enabled");
        }
        self.collecting = true;
        info!("Collecting started");
        Ok(failures)
    }

    /// Stop every running source.
    pub async fn stop(&mut self) {
        if !self.collecting {
            return;
        }
        for source in &mut self.sources {
            source.stop().await;
        }
        self.collecting = false;
        info!("Collecting stopped");
    }

    /// Flip between collecting and stopped. Returns the new state.
    ///
    /// # Errors
    ///
    /// See [`Collector::start`].
    pub async fn toggle(&mut self) -> Result<bool> {
        if self.collecting {
            self.stop().await;
        } else {
            self.start()?;
        }
        Ok(self.collecting)
    }
}

/// Handle commands until [`ControlCommand::Shutdown`] or until every sender
/// is gone, then stop collecting. Returns the collector.
pub async fn run_control_loop(
    mut collector: Collector,
    mut commands: mpsc::UnboundedReceiver<ControlCommand>,
) -> Collector {
    while let Some(command) = commands.recv().await {
        match command {
            ControlCommand::Toggle => {
                if let Err(e) = collector.toggle().await {
                    warn!(error = %e, "Cannot start collecting");
                }
            }
            ControlCommand::Shutdown => break,
        }
    }
    collector.stop().await;
    collector
}
