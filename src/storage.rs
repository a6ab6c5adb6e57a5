//! Authentication state in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the session token and the
//! backend/maps configuration captured at login.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{SyncError, SyncResult};

const SERVICE_NAME: &str = "pos-offline-sync";

// Credential keys
pub const KEY_API_URL: &str = "api_base_url";
pub const KEY_AUTH_TOKEN: &str = "auth_token";
pub const KEY_MAPS_TOKEN: &str = "maps_access_token";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_API_URL, KEY_AUTH_TOKEN, KEY_MAPS_TOKEN];

fn storage_error(key: &str, err: keyring::Error) -> SyncError {
    SyncError::Storage(format!("{key}: {err}"))
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> SyncResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| storage_error(key, e))?;
    entry.set_password(value).map_err(|e| storage_error(key, e))
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> SyncResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| storage_error(key, e))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(storage_error(key, e)),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Bearer token of the logged-in staff session, if any.
pub fn load_auth_token() -> Option<Zeroizing<String>> {
    get_credential(KEY_AUTH_TOKEN)
        .filter(|t| !t.trim().is_empty())
        .map(Zeroizing::new)
}

pub fn save_auth_token(token: &str) -> SyncResult<()> {
    set_credential(KEY_AUTH_TOKEN, token.trim())?;
    info!("auth token stored");
    Ok(())
}

pub fn clear_auth_token() -> SyncResult<()> {
    delete_credential(KEY_AUTH_TOKEN)
}

/// Remove every credential this crate manages (logout / device reset).
pub fn clear_all() -> SyncResult<()> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("credential store cleared");
    Ok(())
}
