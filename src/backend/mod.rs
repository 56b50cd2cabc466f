//! Runner backends
//!
//! A backend knows how to build and launch the agent with one native tool.
//! The orchestrator only talks to the [`TestRunner`] trait; capabilities a
//! backend lacks (`preflight`, `build`, `prebuild`) return `None` and are
//! skipped at the call site.

mod fbsimctl;
pub mod project;
pub mod signing;
mod xcodebuild;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use wda_protocol::AgentStatus;

use crate::config::{LaunchSystem, RunnerConfig};
use crate::error::RunnerResult;
use crate::poller::{wait_for_start, PollOutcome, PollSettings};
use crate::proxy::{ProxyError, SharedChannel};

pub use fbsimctl::{find_xctest_bundle, Fbsimctl, XCTEST_BUNDLE_NAME};
pub use xcodebuild::{XcodeBuild, BUILD_TEST_DELAY, WDA_SCHEME};

/// One native build/launch strategy for the agent.
pub trait TestRunner: Send {
    /// Short name used in logs ("xcodebuild", "fbsimctl").
    fn name(&self) -> &'static str;

    /// Check that a launch can work at all. `None` if not supported.
    fn preflight(&mut self) -> Option<RunnerResult<()>> {
        None
    }

    /// Prepare the backend; `channel` is the session-less proxy channel used
    /// for readiness polling.
    fn init(&mut self, channel: SharedChannel) -> RunnerResult<()>;

    /// Produce the artifacts `init` needs. `None` if not supported.
    fn build(&mut self) -> Option<RunnerResult<()>> {
        None
    }

    /// Build ahead of launching so `start` only runs tests. `None` if not
    /// supported.
    fn prebuild(&mut self) -> Option<RunnerResult<()>> {
        None
    }

    /// Launch the agent and wait for it to answer on `/status`.
    ///
    /// Returns the last status seen, which may be `None` if the agent did
    /// not answer within the launch timeout.
    fn start(&mut self) -> RunnerResult<Option<AgentStatus>>;

    /// Stop the native process. Must succeed on an already-exited process.
    fn quit(&mut self) -> RunnerResult<()>;

    /// Undo whatever `init` changed on disk.
    fn reset(&mut self) -> RunnerResult<()>;

    /// Build system's derived data directory, when known.
    fn derived_data_path(&mut self) -> Option<PathBuf> {
        None
    }

    /// Device address reported by the agent.
    fn agent_url(&self) -> Option<&str> {
        None
    }
}

/// Creates the backend for a session.
pub type RunnerFactory = Box<dyn Fn(Arc<RunnerConfig>) -> Box<dyn TestRunner> + Send + Sync>;

/// Backend selected by `config.launch_system`.
pub fn default_runner(config: Arc<RunnerConfig>) -> Box<dyn TestRunner> {
    match config.launch_system {
        LaunchSystem::Xcodebuild => Box::new(XcodeBuild::new(config)),
        LaunchSystem::Fbsimctl => Box::new(Fbsimctl::new(config)),
    }
}

/// Poll `/status` through `channel` until the agent answers.
pub(crate) fn poll_agent(
    channel: &SharedChannel,
    start: Instant,
    settings: PollSettings,
    is_exited: impl FnMut() -> bool,
) -> PollOutcome {
    wait_for_start(start, settings, is_exited, |timeout| -> Result<AgentStatus, ProxyError> {
        let mut channel = match channel.lock() {
            Ok(channel) => channel,
            Err(poisoned) => poisoned.into_inner(),
        };
        channel.status(timeout)
    })
}
