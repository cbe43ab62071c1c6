//! Database passphrase storage in the login keychain.

use keyring::Entry;
use thiserror::Error;
use tracing::debug;

/// Keychain service the passphrase is stored under.
pub const SERVICE: &str = "com.panappticon.app";

/// Keychain account the passphrase is stored under.
pub const ACCOUNT: &str = "database-passphrase";

/// Errors from keychain access.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// The keychain refused the operation.
    #[error("keychain access failed: {0}")]
    Access(#[from] keyring::Error),
}

/// Read the stored passphrase.
///
/// A missing item is `Ok(None)`.
///
/// # Errors
///
/// Returns an error if the keychain cannot be read.
pub fn get_passphrase() -> Result<Option<String>, KeychainError> {
    let entry = Entry::new(SERVICE, ACCOUNT)?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => {
            debug!("No passphrase in keychain");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Store `passphrase`, replacing any previous value.
///
/// # Errors
///
/// Returns an error if the keychain rejects the write.
pub fn set_passphrase(passphrase: &str) -> Result<(), KeychainError> {
    let entry = Entry::new(SERVICE, ACCOUNT)?;
    entry.set_password(passphrase)?;
    debug!("Passphrase stored in keychain");
    Ok(())
}
