//! Response envelope returned by every agent route.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, UNKNOWN_ERROR_STATUS};

/// Response envelope.
///
/// The payload of interest lives in `value`; `status` is only present on
/// agents speaking the legacy wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Route-specific payload.
    #[serde(default)]
    pub value: Value,
    /// Session the response belongs to, if any.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Legacy numeric status (0 = success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

impl AgentResponse {
    /// Unwrap the payload, turning an error envelope into an [`AgentError`].
    pub fn into_value(self) -> Result<Value, AgentError> {
        if let Some(status) = self.status.filter(|s| *s != 0) {
            return Err(AgentError::new(status, describe(&self.value)));
        }
        if let Some(error) = self.value.get("error").and_then(Value::as_str) {
            let message = self
                .value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(error);
            return Err(AgentError::new(UNKNOWN_ERROR_STATUS, message));
        }
        Ok(self.value)
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        Value::Null => "no details".to_string(),
        other => other.to_string(),
    }
}
