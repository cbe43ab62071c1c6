//! Seams to the operating system and the user.
//!
//! The core never calls platform APIs directly. The macOS binary plugs real
//! implementations into these traits; tests plug in fakes.

use std::fmt;
use std::io::{self, Write};

use thiserror::Error;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Minimum passphrase length, in characters.
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// Name used when the foreground application cannot be determined.
pub const UNKNOWN_APP: &str = "Unknown";

/// The application in front at a given moment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppInfo {
    /// Localized application name.
    pub name: String,
    /// Bundle identifier, empty if the application has none.
    pub bundle_id: String,
}

/// Query for the frontmost application.
pub trait ForegroundApp: Send + Sync {
    /// The frontmost application, if any.
    fn frontmost(&self) -> Option<AppInfo>;
}

/// Secure storage for the passphrase (the Keychain on macOS).
pub trait KeyProvider: Send + Sync {
    /// The stored passphrase, if one has been saved.
    fn get_passphrase(&self) -> Option<String>;

    /// Save `passphrase`. Returns whether it was stored.
    fn set_passphrase(&self, passphrase: &str) -> bool;
}

/// The result of asking the user for a new passphrase.
#[derive(Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// A passphrase that passed [`validate_new_passphrase`].
    Passphrase(String),
    /// The user dismissed the prompt.
    Cancelled,
}

impl fmt::Debug for PromptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            Self::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Interactive entry of a new passphrase.
pub trait PassphrasePrompt {
    /// Ask for a new passphrase, entered twice.
    fn prompt_new_passphrase(&self) -> PromptOutcome;
}

/// Accessibility permission, needed for global key observation.
pub trait PermissionGate: Send + Sync {
    /// Whether the process is trusted. With `prompt`, the OS may show its
    /// permission dialog.
    fn accessibility_trusted(&self, prompt: bool) -> bool;
}

/// Why a newly entered passphrase was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PassphraseProblem {
    /// Nothing was entered.
    #[error("Password cannot be empty.")]
    Empty,
    /// Fewer than [`MIN_PASSPHRASE_LEN`] characters.
    #[error("Password must be at least 8 characters.")]
    TooShort,
    /// The confirmation differs from the first entry.
    #[error("Passwords do not match.")]
    Mismatch,
}

/// Check a passphrase entered twice.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate_new_passphrase(
    first: &str,
    confirm: &str,
) -> std::result::Result<(), PassphraseProblem> {
    if first.is_empty() {
        return Err(PassphraseProblem::Empty);
    }
    if first.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(PassphraseProblem::TooShort);
    }
    if first != confirm {
        return Err(PassphraseProblem::Mismatch);
    }
    Ok(())
}

/// Get the stored passphrase, or prompt for a new one and store it.
///
/// # Errors
///
/// - [`Error::PassphraseCancelled`] if the user dismissed the prompt.
/// - [`Error::PassphraseNotSaved`] if the new passphrase could not be stored.
pub fn obtain_passphrase(
    provider: &dyn KeyProvider,
    prompt: &dyn PassphrasePrompt,
) -> Result<String> {
    if let Some(stored) = provider.get_passphrase() {
        return Ok(stored);
    }

    info!("No stored passphrase, prompting for a new one");
    match prompt.prompt_new_passphrase() {
        PromptOutcome::Passphrase(passphrase) => {
            if provider.set_passphrase(&passphrase) {
                Ok(passphrase)
            } else {
                warn!("Failed to save passphrase");
                Err(Error::PassphraseNotSaved)
            }
        }
        PromptOutcome::Cancelled => Err(Error::PassphraseCancelled),
    }
}

/// Asks for a new passphrase on the terminal. Entries are not echoed.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn prompt_new_passphrase(&self) -> PromptOutcome {
        prompt_hidden(&mut io::stdout(), rpassword::read_password)
    }
}

/// The passphrase dialogue, writing prompts to `out` and reading each entry
/// with `read_secret`.
///
/// Re-asks until both entries pass validation. An empty entry or a read
/// failure (end of input) cancels. Entries are never written to `out`.
pub fn prompt_hidden<W, R>(out: &mut W, mut read_secret: R) -> PromptOutcome
where
    W: Write,
    R: FnMut() -> io::Result<String>,
{
    let _ = writeln!(out, "Set Database Password");
    let _ = writeln!(
        out,
        "Choose a password to encrypt your Panappticon data. It is stored in your Keychain."
    );
    let _ = writeln!(out, "Leave it empty to cancel.");
    loop {
        let Some(first) = ask_hidden(out, &mut read_secret, "Password") else {
            return PromptOutcome::Cancelled;
        };
        let Some(confirm) = ask_hidden(out, &mut read_secret, "Confirm password") else {
            return PromptOutcome::Cancelled;
        };
        match validate_new_passphrase(&first, &confirm) {
            Ok(()) => return PromptOutcome::Passphrase(first),
            Err(problem) => {
                let _ = writeln!(out, "{problem}");
            }
        }
    }
}

fn ask_hidden<W, R>(out: &mut W, read_secret: &mut R, label: &str) -> Option<String>
where
    W: Write,
    R: FnMut() -> io::Result<String>,
{
    write!(out, "{label}: ").ok()?;
    out.flush().ok()?;
    match read_secret() {
        Ok(entry) if !entry.is_empty() => Some(entry),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Could not read passphrase");
            None
        }
    }
}

/// In-memory fakes shared by the tests of several modules.
#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FixedApp(pub Option<AppInfo>);

    impl FixedApp {
        pub fn named(name: &str, bundle_id: &str) -> Self {
            Self(Some(AppInfo {
                name: name.to_string(),
                bundle_id: bundle_id.to_string(),
            }))
        }
    }

    impl ForegroundApp for FixedApp {
        fn frontmost(&self) -> Option<AppInfo> {
            self.0.clone()
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryKeys {
        pub stored: Mutex<Option<String>>,
        pub refuse: bool,
    }

    impl KeyProvider for MemoryKeys {
        fn get_passphrase(&self) -> Option<String> {
            self.stored.lock().unwrap().clone()
        }

        fn set_passphrase(&self, passphrase: &str) -> bool {
            if self.refuse {
                return false;
            }
            *self.stored.lock().unwrap() = Some(passphrase.to_string());
            true
        }
    }

    #[derive(Debug)]
    pub struct ScriptedPrompt {
        pub outcome: PromptOutcome,
        pub calls: AtomicUsize,
    }

    impl ScriptedPrompt {
        pub fn new(outcome: PromptOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PassphrasePrompt for ScriptedPrompt {
        fn prompt_new_passphrase(&self) -> PromptOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[derive(Debug)]
    pub struct StaticGate(pub AtomicBool);

    impl StaticGate {
        pub fn new(trusted: bool) -> Self {
            Self(AtomicBool::new(trusted))
        }
    }

    impl PermissionGate for StaticGate {
        fn accessibility_trusted(&self, _prompt: bool) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::fakes::{MemoryKeys, ScriptedPrompt};
    use super::*;

    #[test]
    fn test_validate_new_passphrase() {
        assert_eq!(
            validate_new_passphrase("", ""),
            Err(PassphraseProblem::Empty)
        );
        assert_eq!(
            validate_new_passphrase("short", "short"),
            Err(PassphraseProblem::TooShort)
        );
        assert_eq!(
            validate_new_passphrase("long enough", "long enougH"),
            Err(PassphraseProblem::Mismatch)
        );
        assert!(validate_new_passphrase("long enough", "long enough").is_ok());
    }

    #[test]
    fn test_validate_counts_characters() {
        // Eight characters, more than eight bytes.
        assert!(validate_new_passphrase("éééééééé", "éééééééé").is_ok());
        assert_eq!(
            validate_new_passphrase("éééé", "éééé"),
            Err(PassphraseProblem::TooShort)
        );
    }

    #[test]
    fn test_obtain_uses_stored_passphrase() {
        let keys = MemoryKeys {
            stored: std::sync::Mutex::new(Some("stored secret".to_string())),
            refuse: false,
        };
        let prompt = ScriptedPrompt::new(PromptOutcome::Cancelled);
        assert_eq!(obtain_passphrase(&keys, &prompt).unwrap(), "stored secret");
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_obtain_prompts_and_stores() {
        let keys = MemoryKeys::default();
        let prompt = ScriptedPrompt::new(PromptOutcome::Passphrase("new secret".to_string()));
        assert_eq!(obtain_passphrase(&keys, &prompt).unwrap(), "new secret");
        assert_eq!(keys.get_passphrase().as_deref(), Some("new secret"));
    }

    #[test]
    fn test_obtain_cancelled() {
        let keys = MemoryKeys::default();
        let prompt = ScriptedPrompt::new(PromptOutcome::Cancelled);
        assert!(matches!(
            obtain_passphrase(&keys, &prompt),
            Err(Error::PassphraseCancelled)
        ));
    }

    #[test]
    fn test_obtain_fails_when_not_saved() {
        let keys = MemoryKeys {
            refuse: true,
            ..MemoryKeys::default()
        };
        let prompt = ScriptedPrompt::new(PromptOutcome::Passphrase("new secret".to_string()));
        assert!(matches!(
            obtain_passphrase(&keys, &prompt),
            Err(Error::PassphraseNotSaved)
        ));
    }

    fn scripted(entries: &[&str]) -> impl FnMut() -> io::Result<String> {
        let mut entries: Vec<String> = entries.iter().rev().map(|e| (*e).to_string()).collect();
        move || {
            entries
                .pop()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "end of input"))
        }
    }

    #[test]
    fn test_prompt_hidden_never_writes_entries() {
        let mut out = Vec::new();
        let outcome = prompt_hidden(
            &mut out,
            scripted(&["qwe", "qwe", "hunter22x", "hunter22y", "hunter22x", "hunter22x"]),
        );
        assert_eq!(outcome, PromptOutcome::Passphrase("hunter22x".to_string()));

        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("qwe"));
        assert!(!text.contains("hunter22"));
        assert_eq!(text.matches("Confirm password: ").count(), 3);
        assert!(text.contains(&PassphraseProblem::TooShort.to_string()));
        assert!(text.contains(&PassphraseProblem::Mismatch.to_string()));
    }

    #[test]
    fn test_prompt_hidden_cancels() {
        let mut out = Vec::new();
        assert_eq!(prompt_hidden(&mut out, scripted(&[""])), PromptOutcome::Cancelled);
        assert_eq!(
            prompt_hidden(&mut out, scripted(&["hunter22x"])),
            PromptOutcome::Cancelled
        );
    }

    #[test]
    fn test_prompt_outcome_debug_redacts() {
        let outcome = PromptOutcome::Passphrase("hunter22".to_string());
        assert_eq!(format!("{outcome:?}"), "Passphrase(<redacted>)");
    }
}
