//! Payload of the agent's `/status` route.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status payload reported by a running agent.
///
/// Only the fields the runner reads are typed; everything else is kept in
/// `extra` so the caller still sees the full payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Overall state ("success" once the agent is serving).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Operating system details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    /// iOS specific details, including the device network address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ios: Option<IosInfo>,
    /// Agent build details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Operating system block of the status payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// iOS block of the status payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IosInfo {
    /// Device network address the agent is listening on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "simulatorVersion", default, skip_serializing_if = "Option::is_none")]
    pub simulator_version: Option<String>,
}

/// Build block of the status payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl AgentStatus {
    /// Parse a status from the unwrapped `value` of a response.
    ///
    /// Non-object payloads yield an empty status rather than an error.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// Device network address, when the agent reported one.
    pub fn ip(&self) -> Option<&str> {
        self.ios
            .as_ref()
            .and_then(|ios| ios.ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_status() {
        let status = AgentStatus::from_value(json!({
            "state": "success",
            "os": {"name": "iOS", "version": "11.2"},
            "ios": {"simulatorVersion": "11.2", "ip": "192.168.1.20"},
            "build": {"time": "Feb 1 2018 10:00:00"},
            "ready": true
        }));
        assert_eq!(status.state.as_deref(), Some("success"));
        assert_eq!(status.ip(), Some("192.168.1.20"));
        assert_eq!(status.os.unwrap().version.as_deref(), Some("11.2"));
        assert_eq!(status.extra["ready"], true);
    }

    #[test]
    fn test_missing_ip() {
        let status = AgentStatus::from_value(json!({"state": "success", "ios": {}}));
        assert_eq!(status.ip(), None);

        let status = AgentStatus::from_value(json!({"ios": {"ip": ""}}));
        assert_eq!(status.ip(), None);
    }

    #[test]
    fn test_non_object_payload() {
        assert_eq!(AgentStatus::from_value(json!("ok")), AgentStatus::default());
        assert_eq!(AgentStatus::from_value(Value::Null), AgentStatus::default());
    }
}
