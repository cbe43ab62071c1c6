//! macOS implementations of the capture agent's platform traits.

use std::sync::Arc;

use image::RgbImage;
use panappticon::error::{Error, Result};
use panappticon::keystroke::{KeyHandler, KeyTap};
use panappticon::platform::{AppInfo, ForegroundApp, KeyProvider, PermissionGate};
use panappticon::screenshot::DisplaySource;
use panappticon::{KeyEvent, Modifiers};
use panappticon_mac::event_tap::flags;
use panappticon_mac::{keychain, EventTap, RawKeyEvent};
use tracing::{info, warn};

/// Translate tap flags into [`Modifiers`].
fn modifiers_from_flags(raw: &RawKeyEvent) -> Modifiers {
    const MAPPING: [(u64, Modifiers); 7] = [
        (flags::CONTROL, Modifiers::CTRL),
        (flags::ALTERNATE, Modifiers::OPT),
        (flags::SHIFT, Modifiers::SHIFT),
        (flags::COMMAND, Modifiers::CMD),
        (flags::ALPHA_SHIFT, Modifiers::CAPS_LOCK),
        (flags::SECONDARY_FN, Modifiers::FUNCTION),
        (flags::NUMERIC_PAD, Modifiers::NUMERIC_PAD),
    ];

    let mut modifiers = Modifiers::NONE;
    for (flag, modifier) in MAPPING {
        if raw.has(flag) {
            modifiers |= modifier;
        }
    }
    modifiers
}

/// A [`KeyTap`] backed by a Quartz event tap.
#[derive(Debug, Default)]
pub struct MacKeyTap {
    tap: Option<EventTap>,
}

impl KeyTap for MacKeyTap {
    fn install(&mut self, handler: KeyHandler) -> Result<()> {
        if self.tap.is_some() {
            return Ok(());
        }
        let tap = EventTap::install(move |raw: RawKeyEvent| {
            let event = KeyEvent {
                code: raw.key_code,
                modifiers: modifiers_from_flags(&raw),
                text: raw.text,
            };
            handler(event);
        })
        .map_err(|e| Error::platform(e.to_string()))?;
        self.tap = Some(tap);
        Ok(())
    }

    fn remove(&mut self) {
        if let Some(mut tap) = self.tap.take() {
            tap.remove();
        }
    }
}

/// Frontmost application via `NSWorkspace`.
#[derive(Debug, Default)]
pub struct MacForegroundApp;

impl ForegroundApp for MacForegroundApp {
    fn frontmost(&self) -> Option<AppInfo> {
        panappticon_mac::frontmost_application().map(|(name, bundle_id)| AppInfo { name, bundle_id })
    }
}

/// Displays via Quartz Display Services.
#[derive(Debug, Default)]
pub struct MacDisplays;

impl DisplaySource for MacDisplays {
    fn has_permission(&self) -> bool {
        panappticon_mac::has_screen_capture_access()
    }

    fn request_permission(&self) {
        if !panappticon_mac::request_screen_capture_access() {
            warn!("Screen Recording permission not granted");
        }
    }

    fn displays(&self) -> Vec<u32> {
        panappticon_mac::active_displays()
    }

    fn capture(&self, display: u32) -> Option<RgbImage> {
        let frame = panappticon_mac::capture_display(display)?;
        RgbImage::from_raw(frame.width, frame.height, frame.pixels)
    }
}

/// The login keychain.
#[derive(Debug, Default)]
pub struct KeychainKeys;

impl KeyProvider for KeychainKeys {
    fn get_passphrase(&self) -> Option<String> {
        match keychain::get_passphrase() {
            Ok(passphrase) => passphrase,
            Err(e) => {
                warn!(error = %e, "Could not read passphrase from keychain");
                None
            }
        }
    }

    fn set_passphrase(&self, passphrase: &str) -> bool {
        match keychain::set_passphrase(passphrase) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Could not store passphrase in keychain");
                false
            }
        }
    }
}

/// Accessibility trust via the accessibility client.
#[derive(Debug, Default)]
pub struct AccessibilityGate;

impl PermissionGate for AccessibilityGate {
    fn accessibility_trusted(&self, prompt: bool) -> bool {
        let trusted = panappticon_mac::is_accessibility_trusted(prompt);
        if !trusted {
            info!(
                "{}",
                panappticon_mac::permission_instructions(panappticon_mac::Permission::Accessibility)
            );
        }
        trusted
    }
}

/// A boxed key tap for the capture source or the hotkey.
pub fn key_tap() -> Box<dyn KeyTap> {
    Box::new(MacKeyTap::default())
}

/// The shared foreground-app lookup.
pub fn foreground_app() -> Arc<dyn ForegroundApp> {
    Arc::new(MacForegroundApp)
}
