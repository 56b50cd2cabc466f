//! WebDriverAgent orchestration
//!
//! [`WebDriverAgent`] owns one session's worth of native state: the
//! backend, the optional iproxy forwarder and the two proxy channels.
//! `launch` brings the agent up (or adopts an already running one) and
//! `quit` tears everything down again.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Url;
use tracing::{debug, info, warn};
use wda_protocol::{AgentStatus, ProxyConfig, WDA_AGENT_PORT, WDA_BASE_HOST};

use crate::backend::{default_runner, RunnerFactory, TestRunner};
use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::iproxy::IProxy;
use crate::process::kill_app_using_app_name;
use crate::proxy::{ProxyChannel, SharedChannel};

/// Outcome of [`WebDriverAgent::launch`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchResult {
    /// Endpoint the agent is reachable at.
    pub url: String,
    /// Last `/status` seen while waiting, if the agent answered.
    pub status: Option<AgentStatus>,
}

/// Launches and supervises one agent.
pub struct WebDriverAgent {
    config: Arc<RunnerConfig>,
    factory: RunnerFactory,
    url: String,
    runner: Option<Box<dyn TestRunner>>,
    iproxy: Option<IProxy>,
    session_channel: Option<SharedChannel>,
    no_session_channel: Option<SharedChannel>,
    started: bool,
}

impl fmt::Debug for WebDriverAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebDriverAgent")
            .field("url", &self.url)
            .field("runner", &self.runner.as_ref().map(|r| r.name()))
            .field("iproxy", &self.iproxy)
            .field("started", &self.started)
            .finish()
    }
}

impl WebDriverAgent {
    pub fn new(config: RunnerConfig) -> Self {
        let port = config.wda_local_port.unwrap_or(WDA_AGENT_PORT);
        Self {
            url: format!("http://{}:{}", WDA_BASE_HOST, port),
            config: Arc::new(config),
            factory: Box::new(default_runner),
            runner: None,
            iproxy: None,
            session_channel: None,
            no_session_channel: None,
            started: false,
        }
    }

    /// Use `factory` instead of selecting a backend from the config.
    pub fn with_runner_factory(
        mut self,
        factory: impl Fn(Arc<RunnerConfig>) -> Box<dyn TestRunner> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Endpoint callers talk to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Device address reported by the agent, once known.
    pub fn agent_url(&self) -> Option<&str> {
        self.runner.as_ref().and_then(|r| r.agent_url())
    }

    /// Channel carrying the caller's session id.
    pub fn session_channel(&self) -> Option<&SharedChannel> {
        self.session_channel.as_ref()
    }

    /// Channel used for status polling.
    pub fn no_session_channel(&self) -> Option<&SharedChannel> {
        self.no_session_channel.as_ref()
    }

    pub fn fully_started(&self) -> bool {
        self.started
    }

    /// Mark the agent as (not) fully started.
    ///
    /// Until it is, iproxy errors are expected and suppressed.
    pub fn set_fully_started(&mut self, started: bool) {
        self.started = started;
        if let Some(ref iproxy) = self.iproxy {
            iproxy.set_expect_errors(!started);
        }
    }

    pub fn derived_data_path(&mut self) -> Option<PathBuf> {
        self.runner.as_mut().and_then(|r| r.derived_data_path())
    }

    /// Bring the agent up and return its endpoint.
    pub fn launch(&mut self, session_id: Option<&str>) -> RunnerResult<LaunchResult> {
        if self.runner.is_some() || self.iproxy.is_some() {
            debug!("Stopping the previous launch before relaunching");
            self.quit();
        }

        if let Some(url) = self.config.web_driver_agent_url.clone() {
            info!("Using provided WebdriverAgent at '{}'", url);
            self.url = url.clone();
            self.setup_channels(session_id)?;
            return Ok(LaunchResult { url, status: None });
        }

        info!("Launching WebDriverAgent on the device");
        self.setup_channels(session_id)?;

        let runner = self.create_test_runner()?;
        let runner = self.runner.insert(runner);

        Self::kill_hanging_processes(&self.config);

        if self.config.real_device {
            let port = self.config.wda_local_port.unwrap_or(WDA_AGENT_PORT);
            let mut iproxy = IProxy::new(&self.config.tools.iproxy, &self.config.udid, port, WDA_AGENT_PORT);
            iproxy.start()?;
            self.iproxy = Some(iproxy);
        }

        if self.config.prebuild_wda {
            if let Some(result) = runner.prebuild() {
                result?;
            }
        }

        let status = runner.start()?;
        Ok(LaunchResult {
            url: self.url.clone(),
            status,
        })
    }

    /// Stop everything `launch` started. Failures are logged, not returned.
    pub fn quit(&mut self) {
        info!("Shutting down sub-processes");

        if let Some(mut iproxy) = self.iproxy.take() {
            if let Err(e) = iproxy.quit() {
                warn!("Unable to stop iproxy: {}", e);
            }
        }

        if let Some(mut runner) = self.runner.take() {
            if let Err(e) = runner.quit() {
                warn!("Unable to stop {}: {}", runner.name(), e);
            }
            if let Err(e) = runner.reset() {
                warn!("Unable to reset {}: {}", runner.name(), e);
            }
        }

        if let Some(ref channel) = self.session_channel {
            let mut channel = match channel.lock() {
                Ok(channel) => channel,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = channel.set_session_id(None) {
                warn!("Unable to clear session id: {}", e);
            }
        }

        self.started = false;
    }

    fn setup_channels(&mut self, session_id: Option<&str>) -> RunnerResult<()> {
        let target = proxy_target(&self.url)?.with_timeout(Some(self.config.connection_timeout));

        let session = ProxyChannel::session_bound(target.clone(), session_id.map(str::to_string))?;
        let no_session = ProxyChannel::session_less(target)?;
        self.session_channel = Some(session.shared());
        self.no_session_channel = Some(no_session.shared());
        Ok(())
    }

    fn create_test_runner(&self) -> RunnerResult<Box<dyn TestRunner>> {
        let channel = self
            .no_session_channel
            .clone()
            .ok_or_else(|| RunnerError::Preflight("proxy channels are not set up".to_string()))?;

        let mut runner = (self.factory)(Arc::clone(&self.config));
        debug!("Using {} to launch WebDriverAgent", runner.name());

        if let Some(result) = runner.preflight() {
            result?;
        }

        if let Err(err) = Self::init_runner(runner.as_mut(), channel) {
            // init may have touched the checkout before failing
            if let Err(e) = runner.reset() {
                warn!("Unable to reset {}: {}", runner.name(), e);
            }
            return Err(err);
        }

        Ok(runner)
    }

    fn init_runner(runner: &mut dyn TestRunner, channel: SharedChannel) -> RunnerResult<()> {
        if let Err(err) = runner.init(Arc::clone(&channel)) {
            let Some(build) = runner.build() else {
                return Err(err);
            };
            warn!("Unable to initialise {}: {}. Building and retrying", runner.name(), err);
            build?;
            runner.init(channel)?;
        }
        Ok(())
    }

    /// Kill leftovers of earlier sessions on this device. Best effort.
    pub fn kill_hanging_processes(config: &RunnerConfig) {
        debug!("Killing hanging processes");
        let companion = if config.real_device { "iproxy" } else { "XCTRunner" };
        for name in ["xcodebuild", companion] {
            if let Err(e) = kill_app_using_app_name(&config.udid, name) {
                warn!("Unable to kill hanging '{}' processes: {}", name, e);
            }
        }
    }
}

/// Proxy target for an agent endpoint such as `http://localhost:8100`.
fn proxy_target(url: &str) -> RunnerResult<ProxyConfig> {
    let invalid = |reason: &str| RunnerError::Preflight(format!("invalid WebDriverAgent url '{}': {}", url, reason));

    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| invalid("no host"))?;
    let port = parsed.port_or_known_default().ok_or_else(|| invalid("no port"))?;

    let mut target = ProxyConfig::new(host, port);
    target.base = parsed.path().trim_end_matches('/').to_string();
    Ok(target)
}
