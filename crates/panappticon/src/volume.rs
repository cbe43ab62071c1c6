//! Encrypted screenshot volume.
//!
//! Screenshots live inside an encrypted sparse disk image that is attached at
//! a private mount point for the lifetime of the process. The disk image tool
//! is reached through [`VolumeBackend`] so the lifecycle can be tested without
//! attaching anything.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::error::VolumeError;

/// Capacity of a new image. Sparse, so only used space is allocated.
pub const IMAGE_SIZE: &str = "50g";

/// Label of the volume inside the image.
pub const VOLUME_NAME: &str = "PanappticonScreenshots";

const HDIUTIL: &str = "/usr/bin/hdiutil";
const MOUNT: &str = "/sbin/mount";

/// Mount state reported by [`EncryptedVolume::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// Not attached; the capture directory is unavailable.
    Unmounted,
    /// Attached at the mount point.
    Mounted,
}

/// Operations on the disk image tool.
pub trait VolumeBackend: Send + Sync {
    /// Whether something is mounted at `mount_point`.
    fn is_mounted(&self, mount_point: &Path) -> bool;

    /// Create a new encrypted image at `image`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::CreateFailed`] if the tool fails.
    fn create(&self, image: &Path, passphrase: &str) -> Result<(), VolumeError>;

    /// Attach `image` at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::MountFailed`] if the tool fails.
    fn attach(&self, image: &Path, mount_point: &Path, passphrase: &str)
        -> Result<(), VolumeError>;

    /// Detach whatever is mounted at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::DetachFailed`] if the tool fails.
    fn detach(&self, mount_point: &Path) -> Result<(), VolumeError>;
}

/// Whether `mount` output lists a filesystem mounted at `mount_point`.
#[must_use]
pub fn mount_table_contains(output: &str, mount_point: &Path) -> bool {
    let needle = format!(" on {} (", mount_point.display());
    output.lines().any(|line| line.contains(&needle))
}

/// [`VolumeBackend`] driving `hdiutil`.
///
/// The passphrase is written to the tool's stdin (`-stdinpass`), never passed
/// as an argument or environment variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdiutil;

impl Hdiutil {
    /// Run the tool; the outer error is a launch failure, the inner one its
    /// stderr.
    fn run(args: &[&OsStr], passphrase: Option<&str>) -> std::io::Result<Result<(), String>> {
        let mut child = Command::new(HDIUTIL)
            .args(args)
            .stdin(if passphrase.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(passphrase), Some(mut stdin)) = (passphrase, child.stdin.take()) {
            stdin.write_all(passphrase.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if output.status.success() {
            return Ok(Ok(()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(Err(if stderr.is_empty() {
            format!("hdiutil exited with {}", output.status)
        } else {
            stderr
        }))
    }
}

impl VolumeBackend for Hdiutil {
    fn is_mounted(&self, mount_point: &Path) -> bool {
        match Command::new(MOUNT).stderr(Stdio::null()).output() {
            Ok(output) => {
                mount_table_contains(&String::from_utf8_lossy(&output.stdout), mount_point)
            }
            Err(e) => {
                debug!(error = %e, "Could not read mount table");
                false
            }
        }
    }

    fn create(&self, image: &Path, passphrase: &str) -> Result<(), VolumeError> {
        let args: [&OsStr; 13] = [
            "create".as_ref(),
            "-size".as_ref(),
            IMAGE_SIZE.as_ref(),
            "-type".as_ref(),
            "SPARSEBUNDLE".as_ref(),
            "-encryption".as_ref(),
            "AES-256".as_ref(),
            "-fs".as_ref(),
            "APFS".as_ref(),
            "-volname".as_ref(),
            VOLUME_NAME.as_ref(),
            "-stdinpass".as_ref(),
            image.as_os_str(),
        ];
        Self::run(&args, Some(passphrase))?.map_err(|message| VolumeError::CreateFailed {
            path: image.to_path_buf(),
            message,
        })
    }

    fn attach(
        &self,
        image: &Path,
        mount_point: &Path,
        passphrase: &str,
    ) -> Result<(), VolumeError> {
        let args: [&OsStr; 7] = [
            "attach".as_ref(),
            image.as_os_str(),
            "-mountpoint".as_ref(),
            mount_point.as_os_str(),
            "-stdinpass".as_ref(),
            "-nobrowse".as_ref(),
            "-noautoopen".as_ref(),
        ];
        Self::run(&args, Some(passphrase))?.map_err(|message| VolumeError::MountFailed {
            mount_point: mount_point.to_path_buf(),
            message,
        })
    }

    fn detach(&self, mount_point: &Path) -> Result<(), VolumeError> {
        let args: [&OsStr; 2] = ["detach".as_ref(), mount_point.as_os_str()];
        Self::run(&args, None)?.map_err(|message| VolumeError::DetachFailed {
            mount_point: mount_point.to_path_buf(),
            message,
        })
    }
}

/// The encrypted container holding screenshot files.
pub struct EncryptedVolume {
    image_path: PathBuf,
    mount_point: PathBuf,
    backend: Box<dyn VolumeBackend>,
    mounted: AtomicBool,
}

impl fmt::Debug for EncryptedVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedVolume")
            .field("image_path", &self.image_path)
            .field("mount_point", &self.mount_point)
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

impl EncryptedVolume {
    /// A volume backed by `hdiutil`.
    #[must_use]
    pub fn new(image_path: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self::with_backend(image_path, mount_point, Box::new(Hdiutil))
    }

    /// A volume backed by `backend`.
    #[must_use]
    pub fn with_backend(
        image_path: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        backend: Box<dyn VolumeBackend>,
    ) -> Self {
        Self {
            image_path: image_path.into(),
            mount_point: mount_point.into(),
            backend,
            mounted: AtomicBool::new(false),
        }
    }

    /// Path of the disk image.
    #[must_use]
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Where the volume is attached.
    #[must_use]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Whether this process considers the volume attached.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Current mount state.
    #[must_use]
    pub fn state(&self) -> VolumeState {
        if self.is_mounted() {
            VolumeState::Mounted
        } else {
            VolumeState::Unmounted
        }
    }

    /// Directory for screenshot files, `None` while unmounted.
    #[must_use]
    pub fn capture_directory(&self) -> Option<PathBuf> {
        self.is_mounted().then(|| self.mount_point.clone())
    }

    /// Attach the volume, creating the image first if it does not exist.
    ///
    /// A volume that is already mounted at the mount point (for example by a
    /// previous run that was killed) is adopted as is.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::CreateFailed`] or [`VolumeError::MountFailed`].
    /// The volume stays [`VolumeState::Unmounted`] in both cases.
    pub fn open(&self, passphrase: &str) -> Result<VolumeState, VolumeError> {
        if let Some(parent) = self.image_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Could not create data directory");
            }
        }

        if self.backend.is_mounted(&self.mount_point) {
            info!(mount_point = %self.mount_point.display(), "Volume already mounted");
            self.mounted.store(true, Ordering::SeqCst);
            return Ok(VolumeState::Mounted);
        }

        fs::create_dir_all(&self.mount_point)?;

        if !self.image_path.exists() {
            info!(image = %self.image_path.display(), "Creating encrypted volume");
            self.backend.create(&self.image_path, passphrase)?;
        }

        self.backend
            .attach(&self.image_path, &self.mount_point, passphrase)?;
        self.mounted.store(true, Ordering::SeqCst);
        info!(mount_point = %self.mount_point.display(), "Volume mounted");
        Ok(VolumeState::Mounted)
    }

    /// Detach the volume. Does nothing if it is not mounted.
    ///
    /// Safe to call from both the shutdown hook and a graceful quit; only the
    /// first call detaches.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::DetachFailed`]; the volume then still counts as
    /// mounted so a later call can retry.
    pub fn unmount(&self) -> Result<(), VolumeError> {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.backend.detach(&self.mount_point) {
            Ok(()) => {
                info!(mount_point = %self.mount_point.display(), "Volume unmounted");
                Ok(())
            }
            Err(e) => {
                self.mounted.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}
