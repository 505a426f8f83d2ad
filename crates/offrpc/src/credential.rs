//! The authorization secret each context holds, plus the metadata issued with it.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credential {
    pub secret: String,
    pub token_type: String,
    pub realm: String,
    pub client_id: String,
    pub target: String,
    pub environment: String,
    pub home_account_id: String,
    pub credential_type: String,
    /// Unix seconds.
    pub cached_at: Option<u64>,
    /// Unix seconds.
    pub expires_on: Option<u64>,
    /// Unix seconds.
    pub extended_expires_on: Option<u64>,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// A copy of this credential carrying `secret`; every other field is kept.
    pub fn with_secret(&self, secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..self.clone()
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("environment", &self.environment)
            .field("expires_on", &self.expires_on)
            .finish_non_exhaustive()
    }
}
