//! xcodebuild backend
//!
//! Builds the WebDriverAgentRunner scheme and runs it as a test, which is
//! what keeps the agent alive on the device. xcodebuild is known to exit 0
//! while reporting `Error Domain=` failures, so the output is scanned as
//! well as the exit status.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use regex_lite::Regex;
use tracing::{debug, error, info, warn};
use wda_protocol::AgentStatus;

use super::project;
use super::signing::{self, ConfiguredXcconfig, SigningConfigProvider};
use super::{poll_agent, TestRunner};
use crate::config::RunnerConfig;
use crate::error::{log_tail, RunnerError, RunnerResult};
use crate::poller::PollSettings;
use crate::process::{ExitInfo, OutputLine, OutputSink, ProcessSpec, ProcessState, SubProcess, DEFAULT_STOP_GRACE};
use crate::proxy::SharedChannel;

/// Scheme that runs the agent.
pub const WDA_SCHEME: &str = "WebDriverAgentRunner";

/// Pause after a prebuild before the test run starts.
pub const BUILD_TEST_DELAY: Duration = Duration::from_millis(1000);

const LOG_TARGET: &str = "xcodebuild";
const DIAGNOSTIC_LOG_MARKER: &str = "Writing diagnostic log for test session to";
const ERROR_MARKER: &str = "Error Domain=";
const ATTACHMENT_ERROR_MARKER: &str = "Error writing attachment data to file";
const DERIVED_DATA_PATTERN: &str = r"(.+/WebDriverAgent-[^/]+)";

/// Build-system backend.
#[derive(Debug)]
pub struct XcodeBuild {
    config: Arc<RunnerConfig>,
    signing: Box<dyn SigningConfigProvider>,
    channel: Option<SharedChannel>,
    process: Option<SubProcess>,
    use_prebuilt: bool,
    xcconfig: Option<PathBuf>,
    bundle_id_updated: bool,
    derived_data_path: Option<PathBuf>,
    agent_url: Option<String>,
}

impl XcodeBuild {
    pub fn new(config: Arc<RunnerConfig>) -> Self {
        info!("Using WDA path: '{}'", config.bootstrap_path.display());
        info!("Using WDA agent: '{}'", config.agent_path.display());
        Self {
            use_prebuilt: config.use_prebuilt_wda,
            xcconfig: config.signing.xcode_config_file.clone(),
            config,
            signing: Box::new(ConfiguredXcconfig),
            channel: None,
            process: None,
            bundle_id_updated: false,
            derived_data_path: None,
            agent_url: None,
        }
    }

    /// Replace the xcconfig provider used for real devices.
    pub fn with_signing_provider(mut self, provider: impl SigningConfigProvider + 'static) -> Self {
        self.signing = Box::new(provider);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Whether `start` only runs the test phase.
    pub fn uses_prebuilt(&self) -> bool {
        self.use_prebuilt
    }

    /// The xcodebuild invocation for a build-only or full run.
    pub fn command(&self, build_only: bool) -> ProcessSpec {
        let config = &self.config;
        let mut spec = ProcessSpec::new(&config.tools.xcodebuild);

        if !config.xcode_version.supports_split_build() {
            spec = spec.args(["build", "test"]);
        } else {
            let (build, test) = if config.use_simple_build_test {
                ("build", "test")
            } else {
                ("build-for-testing", "test-without-building")
            };
            spec = if build_only {
                spec.arg(build)
            } else if self.use_prebuilt {
                spec.arg(test)
            } else {
                spec.args([build, test])
            };
        }

        spec = spec
            .arg("-project")
            .arg(config.agent_path.to_string_lossy())
            .args(["-scheme", WDA_SCHEME])
            .arg("-destination")
            .arg(format!("id={}", config.udid))
            .args(["-configuration", "Debug"]);

        match config.platform_version.as_deref().and_then(deployment_target) {
            Some(target) => spec = spec.arg(format!("IPHONEOS_DEPLOYMENT_TARGET={}", target)),
            None => warn!(
                "Cannot parse major and minor version numbers from platform version {:?}. \
                 Will build for the default platform instead",
                config.platform_version.as_deref().unwrap_or_default()
            ),
        }

        if config.real_device {
            if let Some(ref xcconfig) = self.xcconfig {
                debug!("Using Xcode configuration file: '{}'", xcconfig.display());
                spec = spec.arg("-xcconfig").arg(xcconfig.to_string_lossy());
            }
        }

        spec
    }

    /// Spawn xcodebuild. Build-only runs wait for the exit; full runs poll
    /// the agent until it answers.
    pub fn start_run(&mut self, build_only: bool) -> RunnerResult<Option<AgentStatus>> {
        if self.config.real_device {
            signing::unlock_keychain(&self.config.signing)?;
            if self.xcconfig.is_none() {
                self.xcconfig = self.signing.xcconfig(&self.config.signing)?;
            }
        }

        let spec = self
            .command(build_only)
            .current_dir(&self.config.bootstrap_path)
            .env("USE_PORT", self.config.wda_remote_port.to_string());
        debug!(
            "Beginning {} with command '{}' in directory '{}'",
            if build_only { "build" } else { "test" },
            spec.command_line(),
            self.config.bootstrap_path.display()
        );

        let sink = XcodebuildOutput::new(self.config.show_xcode_log);
        let start = Instant::now();
        let process = SubProcess::spawn("xcodebuild", &spec, sink).map_err(|source| {
            let err = RunnerError::Spawn {
                tool: "xcodebuild".to_string(),
                source,
            };
            error!("Unable to start WebDriverAgent: {}", err);
            err
        })?;

        if build_only {
            let exit = process.wait();
            let result = check_exit(&process, exit);
            self.process = Some(process);
            return result.map(|_| None);
        }

        let channel = self
            .channel
            .clone()
            .ok_or_else(|| RunnerError::Preflight("xcodebuild backend started before init".to_string()))?;
        let state = Arc::clone(process.state());
        self.process = Some(process);

        let settings = PollSettings::new(self.config.launch_timeout);
        let outcome = poll_agent(&channel, start, settings, || state.has_exited());

        if let Some(exit) = state.exit() {
            if let Some(ref process) = self.process {
                check_exit(process, exit)?;
            }
        }

        if outcome.agent_url.is_some() {
            self.agent_url = outcome.agent_url;
        }
        Ok(outcome.status)
    }

    /// Prepare the checkout: legacy project fix, bundle id rewrite and
    /// Carthage dependencies.
    pub fn prepare(&mut self) -> RunnerResult<()> {
        let config = Arc::clone(&self.config);
        if config.xcode_version.needs_legacy_project() {
            debug!("Using Xcode {}, so fixing WDA codebase", config.xcode_version);
            project::fix_for_legacy_xcode(&config.bootstrap_path, &config.agent_path)?;
        }

        if config.real_device {
            if let Some(ref bundle_id) = config.updated_wda_bundle_id {
                project::update_bundle_id(&config.agent_path, bundle_id)?;
                self.bundle_id_updated = true;
            }
        }

        project::check_for_dependencies(&config.bootstrap_path, config.use_carthage_ssl)?;
        Ok(())
    }

    fn stop_process(&mut self) -> RunnerResult<()> {
        // keep the derived data path resolvable once the handle is gone
        self.derived_data_path();
        if let Some(process) = self.process.take() {
            if let Err(e) = process.stop(DEFAULT_STOP_GRACE) {
                warn!("Unable to stop xcodebuild process: {}", e);
            }
        }
        Ok(())
    }
}

impl TestRunner for XcodeBuild {
    fn name(&self) -> &'static str {
        "xcodebuild"
    }

    fn preflight(&mut self) -> Option<RunnerResult<()>> {
        if self.config.agent_path.exists() {
            return Some(Ok(()));
        }
        Some(Err(RunnerError::Preflight(format!(
            "Trying to use WebDriverAgent project at '{}' but the file does not exist",
            self.config.agent_path.display()
        ))))
    }

    fn init(&mut self, channel: SharedChannel) -> RunnerResult<()> {
        self.channel = Some(channel);
        self.prepare()
    }

    fn prebuild(&mut self) -> Option<RunnerResult<()>> {
        if self.config.xcode_version.major == 7 {
            debug!(
                "Prebuild requested, but on Xcode {} so skipping",
                self.config.xcode_version
            );
            return Some(Ok(()));
        }

        debug!("Pre-building WDA before launching test");
        self.use_prebuilt = true;
        let result = self.start_run(true);
        self.process = None;
        if result.is_ok() {
            thread::sleep(BUILD_TEST_DELAY);
        }
        Some(result.map(|_| ()))
    }

    fn start(&mut self) -> RunnerResult<Option<AgentStatus>> {
        self.start_run(false)
    }

    fn quit(&mut self) -> RunnerResult<()> {
        self.stop_process()
    }

    fn reset(&mut self) -> RunnerResult<()> {
        if self.bundle_id_updated {
            project::reset_bundle_id(&self.config.agent_path)?;
            self.bundle_id_updated = false;
        }
        Ok(())
    }

    fn derived_data_path(&mut self) -> Option<PathBuf> {
        if self.derived_data_path.is_none() {
            let location = self.process.as_ref()?.state().log_location()?;
            self.derived_data_path = derived_data_from_log(location);
        }
        self.derived_data_path.clone()
    }

    fn agent_url(&self) -> Option<&str> {
        self.agent_url.as_deref()
    }
}

/// `major.minor` from a platform version such as "11.2.1".
fn deployment_target(platform_version: &str) -> Option<String> {
    let re = Regex::new(r"^(\d+)\.(\d+)").ok()?;
    let caps = re.captures(platform_version)?;
    Some(format!("{}.{}", &caps[1], &caps[2]))
}

/// Derived data directory containing an xcodebuild log file.
///
/// `/a/b/WebDriverAgent-abc123/Logs/Test/x.log` -> `/a/b/WebDriverAgent-abc123`
pub fn derived_data_from_log(log_location: &Path) -> Option<PathBuf> {
    let re = Regex::new(DERIVED_DATA_PATTERN).ok()?;
    let location = log_location.to_string_lossy();
    let caps = re.captures(&location)?;
    Some(PathBuf::from(&caps[1]))
}

fn check_exit(process: &SubProcess, exit: ExitInfo) -> RunnerResult<()> {
    let state = process.state();
    if !state.error_occurred() && !exit.is_failure() {
        return Ok(());
    }

    let log_tail = state
        .log_location()
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|contents| log_tail(&contents))
        .unwrap_or_default();
    let err = RunnerError::BuildOrLaunch {
        tool: "xcodebuild".to_string(),
        exit,
        log_tail,
    };
    error!("{}", err);
    Err(err)
}

/// Scans xcodebuild output for the diagnostic log path and silent failures.
struct XcodebuildOutput {
    show_log: bool,
    log_output: bool,
    expect_log_location: bool,
}

impl XcodebuildOutput {
    fn new(show_log: bool) -> Self {
        debug!(
            "Output from xcodebuild {} be logged",
            if show_log { "will" } else { "will not" }
        );
        Self {
            show_log,
            log_output: show_log,
            expect_log_location: false,
        }
    }
}

impl OutputSink for XcodebuildOutput {
    fn on_line(&mut self, line: &OutputLine, state: &ProcessState) {
        let text = line.text.as_str();

        if let Some(pos) = text.find(DIAGNOSTIC_LOG_MARKER) {
            let rest = text[pos + DIAGNOSTIC_LOG_MARKER.len()..].trim_start_matches(':').trim();
            if rest.starts_with('/') {
                if state.record_log_location(rest) {
                    debug!("Log file for xcodebuild test: {}", rest);
                }
            } else {
                self.expect_log_location = true;
            }
        } else if self.expect_log_location && !text.trim().is_empty() {
            // only the line right after the marker may carry the path
            self.expect_log_location = false;
            let path = text.trim();
            if path.starts_with('/') && state.record_log_location(path) {
                debug!("Log file for xcodebuild test: {}", path);
            }
        }

        if text.contains(ATTACHMENT_ERROR_MARKER) {
            return;
        }
        if text.contains(ERROR_MARKER) {
            // xcodebuild may still exit 0 after this
            self.log_output = true;
            state.mark_error();
        }

        if self.log_output {
            info!(target: LOG_TARGET, "{}", text);
        }
    }

    fn on_exit(&mut self, exit: &ExitInfo, state: &ProcessState) {
        info!("xcodebuild exited with {}", exit);

        if !self.show_log {
            return;
        }
        let Some(location) = state.log_location() else {
            return;
        };
        info!(target: LOG_TARGET, "Contents of xcodebuild log file '{}':", location.display());
        match fs::read_to_string(location) {
            Ok(data) => {
                for line in data.lines() {
                    info!(target: LOG_TARGET, "{}", line);
                }
            }
            Err(e) => debug!("Unable to access xcodebuild log file: '{}'", e),
        }
    }
}
