//! Short-lived tool invocations and leftover process cleanup.

use std::process::Stdio;

use tracing::{debug, info};

use super::{ProcessError, ProcessResult, ProcessSpec};

/// Captured output of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

/// Run `spec` to completion, failing on a non-zero exit.
pub fn exec(spec: &ProcessSpec) -> ProcessResult<CommandOutput> {
    debug!("executing '{}'", spec.command_line());
    let output = spec
        .to_command()
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code(),
    };

    if !output.status.success() {
        return Err(ProcessError::NonZeroExit {
            command: spec.command_line(),
            code: result.code,
            stderr: result.stderr.trim().to_string(),
        });
    }
    Ok(result)
}

/// Pids from `ps ax -o pid=,command=` output whose command line contains
/// every pattern. `exclude` (normally our own pid) is never returned.
pub fn matching_pids(ps_output: &str, patterns: &[&str], exclude: u32) -> Vec<u32> {
    ps_output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            (pid != exclude && patterns.iter().all(|p| command.contains(p))).then_some(pid)
        })
        .collect()
}

/// Kill every process whose command line mentions both the device `udid`
/// and `app_name`. Returns how many processes were signalled.
pub fn kill_app_using_app_name(udid: &str, app_name: &str) -> ProcessResult<usize> {
    let ps = exec(&ProcessSpec::new("ps").args(["ax", "-o", "pid=,command="]))?;
    let pids = matching_pids(&ps.stdout, &[udid, app_name], std::process::id());
    if pids.is_empty() {
        debug!("no hanging '{}' processes for device {}", app_name, udid);
        return Ok(0);
    }

    info!("Killing hanging '{}' processes: {:?}", app_name, pids);
    for pid in &pids {
        kill_pid(*pid)?;
    }
    Ok(pids.len())
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> ProcessResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> ProcessResult<()> {
    exec(&ProcessSpec::new("taskkill").args(["/F", "/PID"]).arg(pid.to_string())).map(|_| ())
}
