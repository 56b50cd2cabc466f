//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for the filter:
//! 1. `--verbose` (debug for everything)
//! 2. `WDA_RUNNER_LOG` environment variable, in `EnvFilter` syntax
//!    (e.g. "info,xcodebuild=debug")
//! 3. default to `info`
//!
//! Native tool output is logged to the `xcodebuild`, `fbsimctl` and
//! `iproxy` targets so it can be filtered separately.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "WDA_RUNNER_LOG";

const DEFAULT_FILTER: &str = "info";

/// Filter for the given verbosity and environment value.
pub fn build_filter(verbose: bool, env_value: Option<&str>) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    env_value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialise the global subscriber, writing to stderr.
///
/// Calling it again is harmless; only the first call installs a subscriber.
pub fn init_logging(verbose: bool) {
    let env_value = std::env::var(LOG_ENV).ok();
    let filter = build_filter(verbose, env_value.as_deref());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_filter_defaults_to_info() {
        assert_eq!(build_filter(false, None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(build_filter(false, Some("  ")).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_filter_from_env() {
        assert_eq!(build_filter(false, Some("error")).max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(
            build_filter(false, Some("warn,xcodebuild=debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }

    #[test]
    fn test_verbose_wins() {
        assert_eq!(build_filter(true, Some("error")).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_init_twice() {
        init_logging(false);
        init_logging(true);
    }
}
