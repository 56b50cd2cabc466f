//! Errors reported by the agent inside a response body.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error carried in an agent response.
///
/// Legacy responses report a non-zero numeric `status`; W3C-style responses
/// put an `error` string inside `value`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("agent returned status {status}: {message}")]
pub struct AgentError {
    /// Numeric JSON wire protocol status (13 when only a W3C error was given).
    pub status: i64,
    /// Human-readable message.
    pub message: String,
}

/// Status code used when the agent only reports a W3C error string.
pub const UNKNOWN_ERROR_STATUS: i64 = 13;

impl AgentError {
    /// Create a new agent error.
    pub fn new(status: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}
