//! fbsimctl backend
//!
//! Launches an already built `WebDriverAgentRunner.xctest` bundle on a
//! booted simulator, hosted by a system application.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use wda_protocol::AgentStatus;

use super::{poll_agent, TestRunner, XcodeBuild};
use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::poller::PollSettings;
use crate::process::{
    exec, ExitInfo, OutputLine, OutputSink, ProcessSpec, ProcessState, SubProcess, DEFAULT_STOP_GRACE,
};
use crate::proxy::SharedChannel;

/// Directory name of the agent test bundle.
pub const XCTEST_BUNDLE_NAME: &str = "WebDriverAgentRunner.xctest";

const LOG_TARGET: &str = "fbsimctl";
const SAFARI_BUNDLE_ID: &str = "com.apple.mobilesafari";
const PREFERENCES_BUNDLE_ID: &str = "com.apple.Preferences";
const SIMULATOR_PATH_MARKER: &str = "iphonesimulator";
const DUPLICATE_CLASS_NOISE: &str = "is implemented in both";

/// Find the single simulator build of the agent bundle under `root`.
///
/// Bundles are not descended into. Anything other than exactly one
/// candidate is an error listing the candidates.
pub fn find_xctest_bundle(root: &Path) -> RunnerResult<PathBuf> {
    let mut candidates = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable path while searching for {}: {}", XCTEST_BUNDLE_NAME, e);
                continue;
            }
        };
        if entry.file_type().is_dir() && entry.file_name() == XCTEST_BUNDLE_NAME {
            if entry.path().to_string_lossy().contains(SIMULATOR_PATH_MARKER) {
                candidates.push(entry.path().to_path_buf());
            }
            walker.skip_current_dir();
        }
    }

    candidates.sort();
    if candidates.len() != 1 {
        return Err(RunnerError::AmbiguousArtifact { candidates });
    }
    Ok(candidates.remove(0))
}

/// Device-control backend.
#[derive(Debug)]
pub struct Fbsimctl {
    config: Arc<RunnerConfig>,
    channel: Option<SharedChannel>,
    xctest_path: Option<PathBuf>,
    process: Option<SubProcess>,
    agent_url: Option<String>,
}

impl Fbsimctl {
    pub fn new(config: Arc<RunnerConfig>) -> Self {
        Self {
            config,
            channel: None,
            xctest_path: None,
            process: None,
            agent_url: None,
        }
    }

    /// Bundle chosen by `init`.
    pub fn xctest_path(&self) -> Option<&Path> {
        self.xctest_path.as_deref()
    }

    /// System application that hosts the test bundle.
    ///
    /// Safari unless Safari itself is under test.
    pub fn host_bundle_id(&self) -> &'static str {
        if self.config.is_safari() {
            PREFERENCES_BUNDLE_ID
        } else {
            SAFARI_BUNDLE_ID
        }
    }

    /// The `launch_xctest` invocation for `bundle`.
    pub fn command(&self, bundle: &Path) -> ProcessSpec {
        ProcessSpec::new(&self.config.tools.fbsimctl)
            .args(["--debug-logging", self.config.udid.as_str(), "launch_xctest"])
            .arg(bundle.to_string_lossy())
            .arg(self.host_bundle_id())
            .arg("--port")
            .arg(self.config.wda_remote_port.to_string())
            .args(["--", "listen"])
    }

    fn terminate_host(&self) {
        let host = self.host_bundle_id();
        let spec = ProcessSpec::new(&self.config.tools.fbsimctl).args(["--state=booted", "terminate", host]);
        if let Err(e) = exec(&spec) {
            warn!("Unable to terminate '{}' process: {}", host, e);
        }
    }
}

impl TestRunner for Fbsimctl {
    fn name(&self) -> &'static str {
        "fbsimctl"
    }

    fn init(&mut self, channel: SharedChannel) -> RunnerResult<()> {
        let bundle = match self.config.xctest_path {
            Some(ref path) if path.file_name().map_or(false, |n| n == XCTEST_BUNDLE_NAME) => path.clone(),
            Some(ref root) => find_xctest_bundle(root)?,
            None => find_xctest_bundle(&self.config.derived_data_root)?,
        };
        debug!("Using agent bundle '{}'", bundle.display());

        self.xctest_path = Some(bundle);
        self.channel = Some(channel);
        Ok(())
    }

    fn build(&mut self) -> Option<RunnerResult<()>> {
        info!("Building WebDriverAgent with xcodebuild for fbsimctl");
        let mut xcodebuild = XcodeBuild::new(Arc::clone(&self.config));
        let result = xcodebuild
            .prepare()
            .and_then(|_| xcodebuild.start_run(true).map(|_| ()));
        if let Err(e) = xcodebuild.reset() {
            warn!("Unable to reset WebDriverAgent project after build: {}", e);
        }
        Some(result)
    }

    fn start(&mut self) -> RunnerResult<Option<AgentStatus>> {
        let (Some(bundle), Some(channel)) = (self.xctest_path.clone(), self.channel.clone()) else {
            return Err(RunnerError::Preflight("fbsimctl backend started before init".to_string()));
        };

        self.terminate_host();

        let spec = self.command(&bundle);
        debug!("Launching test with command: '{}'", spec.command_line());

        let start = Instant::now();
        let process = SubProcess::spawn("fbsimctl", &spec, FbsimctlOutput).map_err(|source| RunnerError::Spawn {
            tool: "fbsimctl".to_string(),
            source,
        })?;
        let state = Arc::clone(process.state());
        self.process = Some(process);

        let settings = PollSettings::new(self.config.launch_timeout);
        let outcome = poll_agent(&channel, start, settings, || state.has_exited());
        if outcome.agent_url.is_some() {
            self.agent_url = outcome.agent_url;
        }
        Ok(outcome.status)
    }

    fn quit(&mut self) -> RunnerResult<()> {
        if let Some(process) = self.process.take() {
            if let Err(e) = process.stop(DEFAULT_STOP_GRACE) {
                warn!("Unable to stop fbsimctl process: {}", e);
            }
            self.terminate_host();
        }
        Ok(())
    }

    fn reset(&mut self) -> RunnerResult<()> {
        Ok(())
    }

    fn agent_url(&self) -> Option<&str> {
        self.agent_url.as_deref()
    }
}

struct FbsimctlOutput;

impl OutputSink for FbsimctlOutput {
    fn on_line(&mut self, line: &OutputLine, _state: &ProcessState) {
        if line.text.contains(DUPLICATE_CLASS_NOISE) || line.text.trim().is_empty() {
            return;
        }
        debug!(target: LOG_TARGET, "{}", line.text);
    }

    fn on_exit(&mut self, exit: &ExitInfo, _state: &ProcessState) {
        info!("fbsimctl exited with {}", exit);
    }
}
