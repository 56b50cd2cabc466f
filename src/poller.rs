//! Readiness polling
//!
//! After a backend has spawned its native process, the agent is polled on
//! `/status` until it answers, the process dies, or the launch budget runs
//! out. None of these outcomes is an error: native tooling has highly
//! variable cold-start latency, so the caller decides what to do with
//! whatever status was last observed.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wda_protocol::AgentStatus;

/// Fixed interval between status attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-attempt request timeout.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Total launch budget.
    pub launch_timeout: Duration,
    /// Delay between attempts; also the unit the attempt count is derived from.
    pub interval: Duration,
    /// Timeout applied to each status request.
    pub attempt_timeout: Duration,
}

impl PollSettings {
    pub fn new(launch_timeout: Duration) -> Self {
        Self {
            launch_timeout,
            interval: POLL_INTERVAL,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    /// floor(launch_timeout / interval).
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 0;
        }
        (self.launch_timeout.as_millis() / self.interval.as_millis()) as u32
    }
}

/// Result of a polling run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    /// Last status received, if any.
    pub status: Option<AgentStatus>,
    /// Device network address reported by the agent.
    pub agent_url: Option<String>,
    /// Status requests actually issued.
    pub attempts: u32,
    /// Polling stopped because the process had exited.
    pub process_exited: bool,
    /// The budget ran out without an answer.
    pub timed_out: bool,
}

/// Poll until the agent answers on `/status`.
///
/// * `is_exited` is checked before every attempt; once it returns true the
///   last observed status is returned immediately.
/// * `fetch_status` performs one request with the given per-attempt timeout.
///   Any error means "not ready yet".
///
/// At most [`PollSettings::max_attempts`] requests are issued and no attempt
/// starts after `start + launch_timeout`.
pub fn wait_for_start<E, F, Err>(
    start: Instant,
    settings: PollSettings,
    mut is_exited: E,
    mut fetch_status: F,
) -> PollOutcome
where
    E: FnMut() -> bool,
    F: FnMut(Duration) -> Result<AgentStatus, Err>,
    Err: std::fmt::Display,
{
    debug!(
        "Waiting up to {}ms for WebDriverAgent to start",
        settings.launch_timeout.as_millis()
    );

    let deadline = start + settings.launch_timeout;
    let max_attempts = settings.max_attempts();
    let mut outcome = PollOutcome::default();
    let mut last_error: Option<String> = None;

    while outcome.attempts < max_attempts {
        if is_exited() {
            // there has been an error elsewhere and we need to short-circuit
            outcome.process_exited = true;
            return outcome;
        }
        if outcome.attempts > 0 && Instant::now() >= deadline {
            break;
        }

        outcome.attempts += 1;
        match fetch_status(settings.attempt_timeout) {
            Ok(status) => {
                if let Some(ip) = status.ip() {
                    debug!("WebDriverAgent running on ip '{}'", ip);
                    outcome.agent_url = Some(ip.to_string());
                }
                outcome.status = Some(status);
                info!(
                    "WebDriverAgent successfully started after {}ms",
                    start.elapsed().as_millis()
                );
                return outcome;
            }
            Err(e) => {
                last_error = Some(format!("Unable to connect to running WebDriverAgent: {}", e));
            }
        }

        if outcome.attempts < max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(settings.interval.min(remaining));
        }
    }

    if is_exited() {
        outcome.process_exited = true;
        return outcome;
    }

    if let Some(err) = last_error {
        debug!("{}", err);
    }
    warn!("Getting status of WebDriverAgent on device timed out. Continuing");
    outcome.timed_out = true;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn fast(launch_timeout_ms: u64) -> PollSettings {
        PollSettings {
            launch_timeout: Duration::from_millis(launch_timeout_ms),
            interval: Duration::from_millis(10),
            attempt_timeout: Duration::from_millis(5),
        }
    }

    fn status_with_ip(ip: &str) -> AgentStatus {
        AgentStatus::from_value(json!({"state": "success", "ios": {"ip": ip}}))
    }

    #[test]
    fn test_max_attempts_is_floor() {
        assert_eq!(PollSettings::new(Duration::from_millis(60_000)).max_attempts(), 120);
        assert_eq!(PollSettings::new(Duration::from_millis(1_499)).max_attempts(), 2);
        assert_eq!(PollSettings::new(Duration::from_millis(499)).max_attempts(), 0);
    }

    #[test]
    fn test_returns_on_first_status() {
        let calls = Cell::new(0);
        let outcome = wait_for_start(Instant::now(), fast(1_000), || false, |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("connection refused")
            } else {
                Ok(status_with_ip("192.168.0.5"))
            }
        });

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.agent_url.as_deref(), Some("192.168.0.5"));
        assert!(outcome.status.is_some());
        assert!(!outcome.timed_out);
        assert!(!outcome.process_exited);
    }

    #[test]
    fn test_status_without_ip_still_ends_polling() {
        let outcome = wait_for_start(Instant::now(), fast(1_000), || false, |_| {
            Ok::<_, String>(AgentStatus::default())
        });
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.status.is_some());
        assert!(outcome.agent_url.is_none());
    }

    #[test]
    fn test_never_exceeds_attempt_budget() {
        let calls = Cell::new(0u32);
        let outcome = wait_for_start(Instant::now(), fast(100), || false, |_| {
            calls.set(calls.get() + 1);
            Err::<AgentStatus, _>("not yet")
        });

        assert!(calls.get() <= 10);
        assert_eq!(outcome.attempts, calls.get());
        assert!(outcome.timed_out);
        assert!(outcome.status.is_none());
    }

    #[test]
    fn test_exited_process_short_circuits_without_error() {
        let calls = Cell::new(0);
        let outcome = wait_for_start(Instant::now(), fast(1_000), || calls.get() >= 2, |_| {
            calls.set(calls.get() + 1);
            Err::<AgentStatus, _>("refused")
        });

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.process_exited);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_exited_before_first_attempt() {
        let outcome = wait_for_start(
            Instant::now(),
            fast(1_000),
            || true,
            |_| -> Result<AgentStatus, String> { panic!("must not poll an exited process") },
        );
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.process_exited);
    }

    #[test]
    fn test_zero_budget_times_out_immediately() {
        let outcome = wait_for_start(Instant::now(), fast(5), || false, |_| {
            Ok::<_, String>(AgentStatus::default())
        });
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.timed_out);
    }

    #[test]
    fn test_attempt_timeout_passed_through() {
        let settings = fast(100);
        let outcome = wait_for_start(Instant::now(), settings, || false, |timeout| {
            assert_eq!(timeout, settings.attempt_timeout);
            Ok::<_, String>(AgentStatus::default())
        });
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_wall_clock_bound() {
        let settings = fast(200);
        let started = Instant::now();
        wait_for_start(started, settings, || false, |timeout| {
            thread::sleep(timeout);
            Err::<AgentStatus, _>("slow")
        });
        assert!(started.elapsed() < settings.launch_timeout + settings.attempt_timeout + Duration::from_millis(200));
    }
}
