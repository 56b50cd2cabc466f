//! Native process supervision
//!
//! A [`SubProcess`] owns one spawned tool (xcodebuild, fbsimctl, iproxy).
//! Its stdout and stderr are read on two threads and handed, one line at a
//! time, to an [`OutputSink`] running on a supervisor thread. Once the
//! process has exited and both pipes are drained, the supervisor records the
//! exit exactly once and signals a one-shot exit channel, so the exit is
//! always observed after every line produced before it.

mod exec;

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

pub use exec::{exec, kill_app_using_app_name, matching_pids, CommandOutput};

/// How often the supervisor checks whether the child has exited.
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL when stopping a process.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Errors from process operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with code {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Description of a command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Indices into `args` never shown in logs or errors
    masked: Vec<usize>,
}

impl ProcessSpec {
    /// Start describing a command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            masked: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Argument that is passed through but masked in [`command_line`](Self::command_line).
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.masked.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line as it would be typed in a shell (for logging).
    pub fn command_line(&self) -> String {
        let args = self.args.iter().enumerate().map(|(i, arg)| {
            if self.masked.contains(&i) {
                "****"
            } else {
                arg.as_str()
            }
        });
        std::iter::once(self.program.as_str())
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(self.env.iter().cloned());
        if let Some(ref cwd) = self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

/// Pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of process output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit of a process whose status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// A non-zero exit that was not caused by a signal.
    ///
    /// Signalled exits are how the runner itself stops processes, so they
    /// never count as failures.
    pub fn is_failure(&self) -> bool {
        self.signal.is_none() && self.code != Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "null".to_string());
        let signal = self
            .signal
            .map(|s| format!("SIG{}", s))
            .unwrap_or_else(|| "null".to_string());
        write!(f, "code '{}' and signal '{}'", code, signal)
    }
}

/// State shared between a [`SubProcess`] and its supervisor thread.
///
/// Every field is written at most once (first observation wins) and read
/// from any thread.
#[derive(Debug, Default)]
pub struct ProcessState {
    exit: OnceLock<ExitInfo>,
    log_location: OnceLock<PathBuf>,
    error_occurred: AtomicBool,
}

impl ProcessState {
    /// Whether the exit of the process has been recorded.
    pub fn has_exited(&self) -> bool {
        self.exit.get().is_some()
    }

    pub fn exit(&self) -> Option<ExitInfo> {
        self.exit.get().copied()
    }

    /// Diagnostic log file announced by the tool, if any.
    pub fn log_location(&self) -> Option<&Path> {
        self.log_location.get().map(PathBuf::as_path)
    }

    /// Remember the diagnostic log location. Returns false if one was
    /// already recorded.
    pub fn record_log_location(&self, path: impl Into<PathBuf>) -> bool {
        self.log_location.set(path.into()).is_ok()
    }

    /// Flag an error reported in the output even though the tool may still
    /// exit with code 0.
    pub fn mark_error(&self) {
        self.error_occurred.store(true, Ordering::SeqCst);
    }

    pub fn error_occurred(&self) -> bool {
        self.error_occurred.load(Ordering::SeqCst)
    }
}

/// Consumer of process output.
///
/// Called on the supervisor thread: `on_line` for each line in order, then
/// `on_exit` once, before the exit is published to waiters.
pub trait OutputSink: Send + 'static {
    fn on_line(&mut self, line: &OutputLine, state: &ProcessState);

    fn on_exit(&mut self, _exit: &ExitInfo, _state: &ProcessState) {}
}

impl<F> OutputSink for F
where
    F: FnMut(&OutputLine, &ProcessState) + Send + 'static,
{
    fn on_line(&mut self, line: &OutputLine, state: &ProcessState) {
        self(line, state)
    }
}

/// A supervised native process.
pub struct SubProcess {
    name: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    state: Arc<ProcessState>,
    exit_rx: Receiver<ExitInfo>,
    _supervisor: JoinHandle<()>,
}

impl fmt::Debug for SubProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish()
    }
}

impl SubProcess {
    /// Spawn `spec`, delivering its output to `sink`.
    pub fn spawn(
        name: impl Into<String>,
        spec: &ProcessSpec,
        sink: impl OutputSink,
    ) -> ProcessResult<Self> {
        let name = name.into();
        let mut child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(pid, "spawned {}: {}", name, spec.command_line());

        let (line_tx, line_rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let child = Arc::new(Mutex::new(child));
        let state = Arc::new(ProcessState::default());
        let (exit_tx, exit_rx) = mpsc::sync_channel(1);

        let supervisor = {
            let child = Arc::clone(&child);
            let state = Arc::clone(&state);
            let name = name.clone();
            thread::Builder::new()
                .name(format!("{}-supervisor", name))
                .spawn(move || {
                    supervise(&name, child, state, line_rx, readers, sink, exit_tx)
                })?
        };

        Ok(Self {
            name,
            pid,
            child,
            state,
            exit_rx,
            _supervisor: supervisor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    pub fn has_exited(&self) -> bool {
        self.state.has_exited()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.state.exit()
    }

    /// Block until the process has exited and its output is drained.
    pub fn wait(&self) -> ExitInfo {
        if let Some(exit) = self.state.exit() {
            return exit;
        }
        match self.exit_rx.recv() {
            Ok(exit) => exit,
            Err(_) => self.state.exit().unwrap_or_else(ExitInfo::unknown),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        if let Some(exit) = self.state.exit() {
            return Some(exit);
        }
        match self.exit_rx.recv_timeout(timeout) {
            Ok(exit) => Some(exit),
            Err(_) => self.state.exit(),
        }
    }

    /// Terminate the process: SIGTERM, then SIGKILL after `grace`.
    ///
    /// A process that has already exited is left alone.
    pub fn stop(&self, grace: Duration) -> ProcessResult<()> {
        if self.has_exited() {
            debug!("{} process (pid {}) already exited", self.name, self.pid);
            return Ok(());
        }

        info!("Shutting down {} process (pid {})", self.name, self.pid);
        self.terminate()?;

        if self.wait_timeout(grace).is_some() {
            return Ok(());
        }

        debug!(
            "{} process did not end after {}ms, sending SIGKILL",
            self.name,
            grace.as_millis()
        );
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                // InvalidInput means the child was already reaped
                if e.kind() != io::ErrorKind::InvalidInput {
                    return Err(ProcessError::Signal {
                        pid: self.pid,
                        reason: e.to_string(),
                    });
                }
            }
        }
        let _ = self.wait_timeout(grace);
        Ok(())
    }

    #[cfg(unix)]
    fn terminate(&self) -> ProcessResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal {
                pid: self.pid,
                reason: e.to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> ProcessResult<()> {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
        Ok(())
    }
}

fn spawn_reader<R>(pipe: R, stream: Stream, tx: Sender<OutputLine>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            let Ok(text) = line else { break };
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    })
}

fn supervise(
    name: &str,
    child: Arc<Mutex<Child>>,
    state: Arc<ProcessState>,
    line_rx: Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    mut sink: impl OutputSink,
    exit_tx: mpsc::SyncSender<ExitInfo>,
) {
    let mut pipes_closed = false;
    let exit = loop {
        if pipes_closed {
            thread::sleep(SUPERVISOR_POLL_INTERVAL);
        } else {
            match line_rx.recv_timeout(SUPERVISOR_POLL_INTERVAL) {
                Ok(line) => {
                    sink.on_line(&line, &state);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => pipes_closed = true,
            }
        }

        let polled = match child.lock() {
            Ok(mut child) => child.try_wait(),
            Err(poisoned) => poisoned.into_inner().try_wait(),
        };
        match polled {
            Ok(Some(status)) => break ExitInfo::from_status(status),
            Ok(None) => {}
            Err(e) => {
                warn!("unable to collect exit status of {}: {}", name, e);
                break ExitInfo::unknown();
            }
        }
    };

    for reader in readers {
        let _ = reader.join();
    }
    for line in line_rx.try_iter() {
        sink.on_line(&line, &state);
    }

    sink.on_exit(&exit, &state);
    let _ = state.exit.set(exit);
    let _ = exit_tx.send(exit);
}
