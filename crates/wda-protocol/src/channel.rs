//! Proxy channel configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-request timeout of a proxy channel (4 minutes).
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(240);

/// Role a proxy channel plays for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Carries the caller's session id; used for in-session commands.
    SessionBound,
    /// Never carries a session id; used for status polling and build-only work.
    SessionLess,
}

impl ChannelRole {
    /// Whether a session id may be attached to this channel.
    pub fn accepts_session(&self) -> bool {
        matches!(self, ChannelRole::SessionBound)
    }
}

/// Target of a proxy channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Host name the agent is reachable at.
    pub server: String,
    /// Port the agent is reachable at.
    pub port: u16,
    /// Path prefix prepended to every route (usually empty).
    #[serde(default)]
    pub base: String,
    /// Per-request timeout.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl ProxyConfig {
    /// Create a config with an empty base path and the default timeout.
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            base: String::new(),
            timeout: DEFAULT_PROXY_TIMEOUT,
        }
    }

    /// Override the per-request timeout; `None` keeps the default.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            self.timeout = timeout;
        }
        self
    }

    /// Root URL of the agent, including the base path.
    pub fn root_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.server,
            self.port,
            self.base.trim_end_matches('/')
        )
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
