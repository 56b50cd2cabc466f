//! Runner-level errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::{ExitInfo, ProcessError};
use crate::proxy::ProxyError;

/// Errors raised while preparing, launching or stopping an agent.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Preconditions for launching are not met.
    #[error("{0}")]
    Preflight(String),

    /// Zero or several candidate agent bundles were found.
    #[error("expected exactly one WebDriverAgentRunner.xctest bundle, found {}: {candidates:?}", .candidates.len())]
    AmbiguousArtifact { candidates: Vec<PathBuf> },

    /// The native build/launch tool failed or reported an error.
    #[error("{tool} failed with {exit}{}", format_tail(.log_tail))]
    BuildOrLaunch {
        tool: String,
        exit: ExitInfo,
        /// Last lines of the diagnostic log, when one was announced.
        log_tail: Vec<String>,
    },

    /// A native process could not be started.
    #[error("unable to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: ProcessError,
    },

    /// The agent project could not be prepared or restored.
    #[error("project file error at {path}: {reason}")]
    Project { path: PathBuf, reason: String },

    /// Carthage dependencies could not be fetched.
    #[error("dependency bootstrap failed: {0}")]
    Dependencies(#[source] ProcessError),

    /// Keychain or xcconfig preparation failed.
    #[error("signing setup failed: {0}")]
    Signing(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// The port forwarder could not be started.
    #[error("port forwarding failed: {0}")]
    PortForward(#[source] ProcessError),
}

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Number of diagnostic log lines carried by a launch failure.
pub const LOG_TAIL_LINES: usize = 20;

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    format!("\nlast {} lines of the diagnostic log:\n{}", tail.len(), tail.join("\n"))
}

/// The last [`LOG_TAIL_LINES`] lines of `contents`.
pub fn log_tail(contents: &str) -> Vec<String> {
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
