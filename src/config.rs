//! Client configuration.
//!
//! Only two values come from outside the device: the backend base URL and
//! the maps access token. Both are read from the environment first and fall
//! back to the credential store, where login persists them.

use std::path::PathBuf;
use std::time::Duration;

use crate::api::{normalize_base_url, DEFAULT_TIMEOUT};
use crate::queue::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
use crate::storage;

pub const ENV_API_URL: &str = "POS_API_URL";
pub const ENV_MAPS_TOKEN: &str = "POS_MAPS_TOKEN";
pub const ENV_DATA_DIR: &str = "POS_DATA_DIR";
pub const ENV_SYNC_INTERVAL_SECS: &str = "POS_SYNC_INTERVAL_SECS";
pub const ENV_MAX_RETRIES: &str = "POS_MAX_RETRIES";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STALE_TIME: Duration = Duration::from_secs(60);
/// How long a resolved local id stays resolvable after nothing queued
/// references it anymore.
const DEFAULT_MAPPING_GRACE_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub maps_access_token: Option<String>,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub sync_interval: Duration,
    pub max_retries: u32,
    pub base_retry_delay_ms: i64,
    pub stale_time: Duration,
    pub mapping_grace_secs: i64,
    /// Probe `/health` on every sync tick and drive the connectivity flag
    /// from the result. Off when the host app feeds the flag itself.
    pub probe_connectivity: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            maps_access_token: None,
            data_dir: default_data_dir(),
            request_timeout: DEFAULT_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            stale_time: DEFAULT_STALE_TIME,
            mapping_grace_secs: DEFAULT_MAPPING_GRACE_SECS,
            probe_connectivity: true,
        }
    }
}

impl ClientConfig {
    pub fn new(api_base_url: &str) -> Self {
        Self {
            api_base_url: normalize_base_url(api_base_url),
            ..Default::default()
        }
    }

    /// Environment first, then the credential store.
    pub fn load() -> Self {
        Self::from_lookup(|key| {
            std::env::var(key).ok().or_else(|| match key {
                ENV_API_URL => storage::get_credential(storage::KEY_API_URL),
                ENV_MAPS_TOKEN => storage::get_credential(storage::KEY_MAPS_TOKEN),
                _ => None,
            })
        })
    }

    /// Build from an arbitrary key lookup. Blank values count as unset;
    /// unparsable numbers fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Self {
            api_base_url: get(ENV_API_URL)
                .map(|u| normalize_base_url(&u))
                .unwrap_or_default(),
            maps_access_token: get(ENV_MAPS_TOKEN),
            data_dir: get(ENV_DATA_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            sync_interval: get(ENV_SYNC_INTERVAL_SECS)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_interval),
            max_retries: get(ENV_MAX_RETRIES)
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_retries),
            ..defaults
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_base_url.is_empty()
    }
}

/// Platform data directory for the database and logs.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos-sync")
}
