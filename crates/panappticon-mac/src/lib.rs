//! macOS-specific implementation for panappticon.
//!
//! This crate wraps the system services the capture agent needs: keyboard
//! event taps, the frontmost application, display capture, privacy
//! permissions, the login keychain and the now-playing helper script.

#![cfg(target_os = "macos")]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod display;
pub mod event_tap;
pub mod keychain;
pub mod media_helper;
pub mod permissions;
pub mod workspace;

pub use display::{active_displays, capture_display, RgbFrame};
pub use event_tap::{EventTap, RawKeyEvent, TapError};
pub use keychain::KeychainError;
pub use permissions::{
    has_screen_capture_access, is_accessibility_trusted, permission_instructions,
    request_screen_capture_access, Permission, PermissionStatus,
};
pub use workspace::{frontmost_application, run_main_loop_until};

/// Get the platform name.
#[must_use]
pub fn platform_name() -> &'static str {
    "macOS"
}
