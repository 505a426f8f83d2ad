//! # Settings and Credential Store
//!
//! String key/value settings shared by a context, plus the one
//! authoritative copy of its current credential.
//!
//! ## Invariants
//! - **Whole Credentials**: the credential is only ever replaced as a whole.
//!   `replace_secret` builds a new credential from the old one rather than
//!   editing it in place, so readers never see a half-updated value.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use dashmap::DashMap;
use offrpc::Codec;
use offrpc::Credential;
use serde::de::DeserializeOwned;
use tracing::debug;

pub const REFRESH_TIMEOUT_KEY: &str = "credential-refresh-timeout-ms";
pub const REFRESH_POLL_KEY: &str = "credential-refresh-poll-ms";

#[derive(Debug)]
pub enum Error {
    NotFound(String),
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "Setting not found: {}", key),
            Self::Json(e) => write!(f, "Settings are not a JSON object: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::NotFound(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
pub struct Settings {
    values: DashMap<String, String>,
    credential: Mutex<Option<Credential>>,
    codec: Codec,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let settings = Self::new();
        for (key, value) in pairs {
            settings.set(key, value);
        }
        settings
    }

    /// Reads a flat JSON object. String values are kept as they are; any
    /// other value is kept as its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let object: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(text).map_err(Error::Json)?;
        Ok(Self::from_pairs(object.into_iter().map(|(key, value)| match value {
            serde_json::Value::String(s) => (key, s),
            other => (key, other.to_string()),
        })))
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Replaces every setting with `values`.
    pub fn replace_all(&self, values: BTreeMap<String, String>) {
        self.values.clear();
        for (key, value) in values {
            self.values.insert(key, value);
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Reads a typed setting.
    ///
    /// Fails with `NotFound` when the key is absent. A present but
    /// unreadable value is logged and read as `T::default()`.
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let raw = self.get_str(key).ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(self.codec.deserialize(&raw))
    }

    /// A snapshot of every setting.
    pub fn all(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credential.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = credential;
    }

    /// Swaps in a new secret, keeping the rest of the credential. Starts a
    /// bare credential when none is held.
    pub fn replace_secret(&self, secret: impl Into<String>) {
        let mut slot = self.credential.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match slot.as_ref() {
            Some(current) => current.with_secret(secret),
            None => Credential::new(secret),
        };
        *slot = Some(next);
    }
}

/// How the credential refresh coordinator waits for a fresh secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    poll_interval: Duration,
    timeout: Duration,
}

impl RefreshPolicy {
    pub const DEFAULT_POLL: Duration = Duration::from_millis(50);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// The timeout is never shorter than one poll interval.
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        Self {
            poll_interval,
            timeout: timeout.max(poll_interval),
        }
    }

    /// Reads `credential-refresh-poll-ms` and `credential-refresh-timeout-ms`,
    /// defaulting whichever is absent.
    pub fn from_settings(settings: &Settings) -> Self {
        let poll = match settings.get::<u64>(REFRESH_POLL_KEY) {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            _ => Self::DEFAULT_POLL,
        };
        let timeout = match settings.get::<u64>(REFRESH_TIMEOUT_KEY) {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                debug!("no refresh timeout configured, using default");
                Self::DEFAULT_TIMEOUT
            }
        };
        Self::new(poll, timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_POLL, Self::DEFAULT_TIMEOUT)
    }
}
