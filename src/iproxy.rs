//! `iproxy` port forwarding for real devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::process::{ExitInfo, OutputLine, OutputSink, ProcessSpec, ProcessState, SubProcess, DEFAULT_STOP_GRACE};

const LOG_TARGET: &str = "iproxy";
const TIMEOUT_MARKER: &str = "Resource temporarily unavailable";

/// Forwards a local port to a port on a USB-connected device.
///
/// Until the agent is up, iproxy reports every refused connection; those
/// errors are expected and suppressed while `expect_errors` is set.
#[derive(Debug)]
pub struct IProxy {
    tool: String,
    udid: String,
    local_port: u16,
    device_port: u16,
    expect_errors: Arc<AtomicBool>,
    process: Option<SubProcess>,
}

impl IProxy {
    pub fn new(tool: impl Into<String>, udid: impl Into<String>, local_port: u16, device_port: u16) -> Self {
        Self {
            tool: tool.into(),
            udid: udid.into(),
            local_port,
            device_port,
            expect_errors: Arc::new(AtomicBool::new(true)),
            process: None,
        }
    }

    pub fn command(&self) -> ProcessSpec {
        ProcessSpec::new(&self.tool)
            .arg(self.local_port.to_string())
            .arg(self.device_port.to_string())
            .arg(self.udid.as_str())
    }

    pub fn start(&mut self) -> RunnerResult<()> {
        self.set_expect_errors(true);
        let spec = self.command();
        info!("Starting iproxy to forward traffic from local port {} to device port {}", self.local_port, self.device_port);
        debug!("Running '{}'", spec.command_line());

        let sink = IProxyOutput {
            expect_errors: Arc::clone(&self.expect_errors),
        };
        let process = SubProcess::spawn("iproxy", &spec, sink).map_err(RunnerError::PortForward)?;
        self.process = Some(process);
        Ok(())
    }

    pub fn quit(&mut self) -> RunnerResult<()> {
        if let Some(process) = self.process.take() {
            if let Err(e) = process.stop(DEFAULT_STOP_GRACE) {
                warn!("Unable to stop iproxy process: {}", e);
            }
        }
        self.set_expect_errors(true);
        Ok(())
    }

    pub fn expect_errors(&self) -> bool {
        self.expect_errors.load(Ordering::SeqCst)
    }

    pub fn set_expect_errors(&self, expect: bool) {
        self.expect_errors.store(expect, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().map_or(false, |p| !p.has_exited())
    }
}

struct IProxyOutput {
    expect_errors: Arc<AtomicBool>,
}

impl OutputSink for IProxyOutput {
    fn on_line(&mut self, line: &OutputLine, _state: &ProcessState) {
        if self.expect_errors.load(Ordering::SeqCst) || line.text.trim().is_empty() {
            return;
        }
        if line.text.contains(TIMEOUT_MARKER) {
            error!(target: LOG_TARGET, "Connection to WebDriverAgent timed out");
        } else {
            debug!(target: LOG_TARGET, "{}", line.text);
        }
    }

    fn on_exit(&mut self, exit: &ExitInfo, _state: &ProcessState) {
        if exit.is_failure() {
            error!("iproxy exited with {}", exit);
        } else {
            debug!("iproxy exited with {}", exit);
        }
    }
}
