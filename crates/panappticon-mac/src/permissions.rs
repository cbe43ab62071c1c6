//! Permission handling for macOS privacy-protected features.
//!
//! The keystroke tap and the hotkey need the Accessibility permission.
//! Display capture needs the Screen Recording permission.

use core_graphics::access::ScreenCaptureAccess;
use macos_accessibility_client::accessibility;

/// A privacy permission the agent depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Needed for the keyboard event taps.
    Accessibility,
    /// Needed for display capture.
    ScreenRecording,
}

impl Permission {
    /// The name shown in System Settings.
    #[must_use]
    pub fn settings_name(self) -> &'static str {
        match self {
            Self::Accessibility => "Accessibility",
            Self::ScreenRecording => "Screen Recording",
        }
    }

    /// Whether the permission is currently granted.
    #[must_use]
    pub fn is_granted(self) -> bool {
        match self {
            Self::Accessibility => is_accessibility_trusted(false),
            Self::ScreenRecording => has_screen_capture_access(),
        }
    }
}

/// Information about the current status of one permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatus {
    /// Which permission this describes.
    pub permission: Permission,

    /// Whether the permission is currently granted.
    pub is_granted: bool,

    /// Human-readable description of the status.
    pub description: String,
}

impl PermissionStatus {
    /// Build the status for `permission` from a known grant state.
    #[must_use]
    pub fn new(permission: Permission, is_granted: bool) -> Self {
        let state = if is_granted { "is granted" } else { "is not granted" };
        Self {
            permission,
            is_granted,
            description: format!("{} permission {state}", permission.settings_name()),
        }
    }
}

/// Check the status of every permission the agent uses.
#[must_use]
pub fn check_permissions() -> Vec<PermissionStatus> {
    [Permission::Accessibility, Permission::ScreenRecording]
        .into_iter()
        .map(|p| PermissionStatus::new(p, p.is_granted()))
        .collect()
}

/// Whether the process is trusted for accessibility.
///
/// With `prompt` set, macOS shows its grant dialog when the process is not
/// yet trusted. The dialog does not block; the return value reflects the
/// state at the time of the call.
#[must_use]
pub fn is_accessibility_trusted(prompt: bool) -> bool {
    if prompt {
        accessibility::application_is_trusted_with_prompt()
    } else {
        accessibility::application_is_trusted()
    }
}

/// Whether screen capture is currently allowed.
#[must_use]
pub fn has_screen_capture_access() -> bool {
    ScreenCaptureAccess.preflight()
}

/// Ask macOS to prompt for screen capture access.
///
/// Returns the grant state after the request. A fresh grant usually only
/// takes effect once the process restarts.
#[must_use]
pub fn request_screen_capture_access() -> bool {
    ScreenCaptureAccess.request()
}

/// Get instructions for how to grant a permission.
#[must_use]
pub fn permission_instructions(permission: Permission) -> String {
    let name = permission.settings_name();
    format!(
        "To enable {name}:

1. Open System Settings
2. Go to Privacy & Security > {name}
3. Find 'panappticon' (or the terminal running it) in the list and enable it
4. If it is not listed, click the '+' button and add it

After granting permission, restart panappticon."
    )
}
