//! wda-runner - WebDriverAgent launcher
//!
//! Launches WebDriverAgent on an iOS device or simulator through one of two
//! native backends (xcodebuild or fbsimctl), waits until it answers, and
//! exposes it behind a stable local endpoint. Tear-down stops every native
//! process that was started and undoes project changes.

pub mod backend;
pub mod config;
pub mod error;
pub mod iproxy;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod process;
pub mod proxy;
pub mod toolchain;

pub use backend::{Fbsimctl, TestRunner, XcodeBuild};
pub use config::{LaunchSystem, RunnerConfig, RunnerOptions};
pub use error::{RunnerError, RunnerResult};
pub use orchestrator::{LaunchResult, WebDriverAgent};
pub use poller::{wait_for_start, PollOutcome, PollSettings};
pub use proxy::{ProxyChannel, ProxyError, SharedChannel};
pub use toolchain::XcodeVersion;
