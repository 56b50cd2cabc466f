//! Runner configuration
//!
//! Options are layered the same way for every entry point:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. CLI flags / programmatic overrides
//!
//! The merged [`RunnerOptions`] are then resolved, together with the
//! detected Xcode version, into an immutable [`RunnerConfig`].

mod defaults;
mod layer;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use wda_protocol::WDA_AGENT_PORT;

use crate::toolchain::XcodeVersion;

pub use defaults::BuiltinDefaults;
pub use layer::{fold_layers, overlay, toml_to_json};

/// Keys whose values are never printed.
const SECRET_KEYS: &[&str] = &["password", "token", "secret"];

/// Errors from loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid options: {0}")]
    Invalid(String),

    #[error("missing required option '{0}'")]
    Missing(&'static str),
}

/// Native tooling used to build and launch the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchSystem {
    #[default]
    Xcodebuild,
    Fbsimctl,
}

impl FromStr for LaunchSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xcodebuild" => Ok(Self::Xcodebuild),
            "fbsimctl" => Ok(Self::Fbsimctl),
            other => Err(format!(
                "unknown launch system '{}' (expected 'xcodebuild' or 'fbsimctl')",
                other
            )),
        }
    }
}

impl fmt::Display for LaunchSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xcodebuild => f.write_str("xcodebuild"),
            Self::Fbsimctl => f.write_str("fbsimctl"),
        }
    }
}

/// Caller-supplied options. Every field is optional; unset fields fall
/// back to [`BuiltinDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerOptions {
    pub udid: Option<String>,
    pub platform_version: Option<String>,
    pub real_device: Option<bool>,
    /// Bundle id of the application under test
    pub bundle_id: Option<String>,
    pub wda_local_port: Option<u16>,
    pub launch_system: Option<LaunchSystem>,
    /// Xcode version to assume instead of running `xcodebuild -version`
    pub xcode_version: Option<String>,

    pub bootstrap_path: Option<PathBuf>,
    pub agent_path: Option<PathBuf>,

    pub xcode_config_file: Option<PathBuf>,
    pub xcode_org_id: Option<String>,
    pub xcode_signing_id: Option<String>,
    pub keychain_path: Option<PathBuf>,
    pub keychain_password: Option<String>,
    pub updated_wda_bundle_id: Option<String>,

    pub use_simple_build_test: Option<bool>,
    pub use_prebuilt_wda: Option<bool>,
    pub prebuild_wda: Option<bool>,
    pub show_xcode_log: Option<bool>,
    pub use_carthage_ssl: Option<bool>,

    pub launch_timeout_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,

    pub xctest_path: Option<PathBuf>,
    pub derived_data_root: Option<PathBuf>,
    pub web_driver_agent_url: Option<String>,

    pub xcodebuild_path: Option<String>,
    pub fbsimctl_path: Option<String>,
    pub iproxy_path: Option<String>,
}

impl RunnerOptions {
    /// Layer `overrides` and the optional TOML file over the built-in
    /// defaults.
    pub fn load(config_path: Option<&Path>, overrides: &RunnerOptions) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];

        if let Some(path) = config_path {
            layers.push(load_toml_file(path)?);
        }

        layers.push(serde_json::to_value(overrides).map_err(|e| ConfigError::Invalid(e.to_string()))?);

        let merged = fold_layers(layers);
        serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
            path: config_path.map(Path::to_path_buf).unwrap_or_default(),
            message: e.to_string(),
        })
    }

    /// Options as JSON with secret values replaced, for logging.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.retain(|_, v| !v.is_null());
            for (key, v) in map.iter_mut() {
                if SECRET_KEYS.iter().any(|s| key.contains(s)) {
                    *v = Value::String("[REDACTED]".to_string());
                }
            }
        }
        value
    }
}

fn load_toml_file(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: toml::Value = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(toml_to_json(parsed))
}

/// Code signing inputs for real devices.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SigningOptions {
    pub xcode_config_file: Option<PathBuf>,
    pub xcode_org_id: Option<String>,
    pub xcode_signing_id: String,
    pub keychain_path: Option<PathBuf>,
    pub keychain_password: Option<String>,
}

impl fmt::Debug for SigningOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningOptions")
            .field("xcode_config_file", &self.xcode_config_file)
            .field("xcode_org_id", &self.xcode_org_id)
            .field("xcode_signing_id", &self.xcode_signing_id)
            .field("keychain_path", &self.keychain_path)
            .field("keychain_password", &self.keychain_password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Paths to the native tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub xcodebuild: String,
    pub fbsimctl: String,
    pub iproxy: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            xcodebuild: defaults.xcodebuild_path,
            fbsimctl: defaults.fbsimctl_path,
            iproxy: defaults.iproxy_path,
        }
    }
}

/// Immutable launch parameters for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub udid: String,
    pub platform_version: Option<String>,
    pub real_device: bool,
    pub bundle_id: Option<String>,
    pub wda_local_port: Option<u16>,
    /// Port the agent listens on, on the device or simulator
    pub wda_remote_port: u16,
    pub xcode_version: XcodeVersion,
    pub launch_system: LaunchSystem,

    pub bootstrap_path: PathBuf,
    pub agent_path: PathBuf,
    pub signing: SigningOptions,
    pub updated_wda_bundle_id: Option<String>,

    pub use_simple_build_test: bool,
    pub use_prebuilt_wda: bool,
    pub prebuild_wda: bool,
    pub show_xcode_log: bool,
    pub use_carthage_ssl: bool,

    pub launch_timeout: Duration,
    pub connection_timeout: Duration,

    pub xctest_path: Option<PathBuf>,
    pub derived_data_root: PathBuf,
    pub web_driver_agent_url: Option<String>,

    pub tools: ToolPaths,
}

impl RunnerConfig {
    /// Resolve options into a config.
    ///
    /// `xcode_version` is used when the options do not name one.
    pub fn from_options(options: &RunnerOptions, xcode_version: Option<XcodeVersion>) -> Result<Self, ConfigError> {
        let defaults = BuiltinDefaults::default();

        let udid = match (&options.udid, &options.web_driver_agent_url) {
            (Some(udid), _) if !udid.trim().is_empty() => udid.trim().to_string(),
            // an already running agent needs no device
            (_, Some(_)) => String::new(),
            _ => return Err(ConfigError::Missing("udid")),
        };

        let xcode_version = match options.xcode_version.as_deref() {
            Some(v) => v
                .parse::<XcodeVersion>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => match (xcode_version, &options.web_driver_agent_url) {
                (Some(version), _) => version,
                // never consulted when adopting a running agent
                (None, Some(_)) => XcodeVersion::new(0, 0),
                (None, None) => return Err(ConfigError::Missing("xcode_version")),
            },
        };

        let real_device = options.real_device.unwrap_or(defaults.real_device);
        let launch_system = options.launch_system.unwrap_or_default();
        if real_device && launch_system == LaunchSystem::Fbsimctl {
            return Err(ConfigError::Invalid(
                "fbsimctl can only launch the agent on simulators".to_string(),
            ));
        }

        if let Some(0) = options.wda_local_port {
            return Err(ConfigError::Invalid("wda_local_port must not be 0".to_string()));
        }
        let wda_remote_port = if real_device {
            WDA_AGENT_PORT
        } else {
            options.wda_local_port.unwrap_or(WDA_AGENT_PORT)
        };

        let bootstrap_path = options
            .bootstrap_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&defaults.bootstrap_path));
        let agent_path = options
            .agent_path
            .clone()
            .unwrap_or_else(|| bootstrap_path.join("WebDriverAgent.xcodeproj"));

        let launch_timeout_ms = options.launch_timeout_ms.unwrap_or(defaults.launch_timeout_ms);
        let connection_timeout_ms = options
            .connection_timeout_ms
            .unwrap_or(defaults.connection_timeout_ms);

        Ok(Self {
            udid,
            platform_version: options.platform_version.clone(),
            real_device,
            bundle_id: options.bundle_id.clone(),
            wda_local_port: options.wda_local_port,
            wda_remote_port,
            xcode_version,
            launch_system,
            bootstrap_path,
            agent_path,
            signing: SigningOptions {
                xcode_config_file: options.xcode_config_file.clone(),
                xcode_org_id: options.xcode_org_id.clone(),
                xcode_signing_id: options
                    .xcode_signing_id
                    .clone()
                    .unwrap_or(defaults.xcode_signing_id),
                keychain_path: options.keychain_path.clone(),
                keychain_password: options.keychain_password.clone(),
            },
            updated_wda_bundle_id: options.updated_wda_bundle_id.clone(),
            use_simple_build_test: options.use_simple_build_test.unwrap_or(defaults.use_simple_build_test),
            use_prebuilt_wda: options.use_prebuilt_wda.unwrap_or(defaults.use_prebuilt_wda),
            prebuild_wda: options.prebuild_wda.unwrap_or(defaults.prebuild_wda),
            show_xcode_log: options.show_xcode_log.unwrap_or(defaults.show_xcode_log),
            use_carthage_ssl: options.use_carthage_ssl.unwrap_or(defaults.use_carthage_ssl),
            launch_timeout: Duration::from_millis(launch_timeout_ms),
            connection_timeout: Duration::from_millis(connection_timeout_ms),
            xctest_path: options.xctest_path.clone(),
            derived_data_root: options
                .derived_data_root
                .clone()
                .unwrap_or_else(default_derived_data_root),
            web_driver_agent_url: options.web_driver_agent_url.clone(),
            tools: ToolPaths {
                xcodebuild: options.xcodebuild_path.clone().unwrap_or(defaults.xcodebuild_path),
                fbsimctl: options.fbsimctl_path.clone().unwrap_or(defaults.fbsimctl_path),
                iproxy: options.iproxy_path.clone().unwrap_or(defaults.iproxy_path),
            },
        })
    }

    /// Whether the application under test is Safari.
    pub fn is_safari(&self) -> bool {
        self.bundle_id
            .as_deref()
            .map(|id| id.eq_ignore_ascii_case("com.apple.mobilesafari"))
            .unwrap_or(false)
    }
}

/// `~/Library/Developer/Xcode/DerivedData`
pub fn default_derived_data_root() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join("Library/Developer/Xcode/DerivedData")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options(udid: &str) -> RunnerOptions {
        RunnerOptions {
            udid: Some(udid.to_string()),
            xcode_version: Some("9.2".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = RunnerConfig::from_options(&options("ABC"), None).unwrap();
        assert_eq!(config.udid, "ABC");
        assert_eq!(config.wda_remote_port, 8100);
        assert_eq!(config.launch_timeout, Duration::from_secs(60));
        assert_eq!(config.connection_timeout, Duration::from_secs(240));
        assert_eq!(config.signing.xcode_signing_id, "iPhone Developer");
        assert_eq!(config.launch_system, LaunchSystem::Xcodebuild);
        assert_eq!(config.agent_path, PathBuf::from("WebDriverAgent/WebDriverAgent.xcodeproj"));
        assert_eq!(config.tools, ToolPaths::default());
        assert_eq!(config.xcode_version.major, 9);
        assert!(config.derived_data_root.ends_with("Library/Developer/Xcode/DerivedData"));
    }

    #[test]
    fn test_remote_port_follows_local_port_on_simulator() {
        let mut opts = options("ABC");
        opts.wda_local_port = Some(8200);
        let config = RunnerConfig::from_options(&opts, None).unwrap();
        assert_eq!(config.wda_remote_port, 8200);

        opts.real_device = Some(true);
        let config = RunnerConfig::from_options(&opts, None).unwrap();
        assert_eq!(config.wda_remote_port, 8100);
        assert_eq!(config.wda_local_port, Some(8200));
    }

    #[test]
    fn test_missing_udid() {
        let mut opts = options("");
        assert!(matches!(
            RunnerConfig::from_options(&opts, None),
            Err(ConfigError::Missing("udid"))
        ));

        opts.web_driver_agent_url = Some("http://mockUrl:8100".into());
        assert!(RunnerConfig::from_options(&opts, None).is_ok());
    }

    #[test]
    fn test_xcode_version_required() {
        let mut opts = options("ABC");
        opts.xcode_version = None;
        assert!(matches!(
            RunnerConfig::from_options(&opts, None),
            Err(ConfigError::Missing("xcode_version"))
        ));
        let config = RunnerConfig::from_options(&opts, Some(XcodeVersion::new(10, 1))).unwrap();
        assert_eq!(config.xcode_version, XcodeVersion::new(10, 1));
    }

    #[test]
    fn test_fbsimctl_rejected_on_real_device() {
        let mut opts = options("ABC");
        opts.real_device = Some(true);
        opts.launch_system = Some(LaunchSystem::Fbsimctl);
        assert!(matches!(
            RunnerConfig::from_options(&opts, None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_launch_system_parse() {
        assert_eq!("fbsimctl".parse::<LaunchSystem>().unwrap(), LaunchSystem::Fbsimctl);
        assert_eq!("XcodeBuild".parse::<LaunchSystem>().unwrap(), LaunchSystem::Xcodebuild);
        assert!("instruments".parse::<LaunchSystem>().is_err());
    }

    #[test]
    fn test_load_layers_file_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "udid = \"FILE-UDID\"\nlaunch_timeout_ms = 120000\nlaunch_system = \"fbsimctl\"\nreal_device = false"
        )
        .unwrap();

        let overrides = RunnerOptions {
            udid: Some("CLI-UDID".into()),
            ..Default::default()
        };
        let loaded = RunnerOptions::load(Some(file.path()), &overrides).unwrap();

        assert_eq!(loaded.udid.as_deref(), Some("CLI-UDID"));
        assert_eq!(loaded.launch_timeout_ms, Some(120_000));
        assert_eq!(loaded.launch_system, Some(LaunchSystem::Fbsimctl));
        assert_eq!(loaded.xcode_signing_id.as_deref(), Some("iPhone Developer"));
        assert_eq!(loaded.connection_timeout_ms, Some(240_000));
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "udid = \"X\"\nlanuch_timeout = 5").unwrap();
        assert!(matches!(
            RunnerOptions::load(Some(file.path()), &RunnerOptions::default()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            RunnerOptions::load(Some(Path::new("/nonexistent/wda.toml")), &RunnerOptions::default()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_redacted_hides_keychain_password() {
        let opts = RunnerOptions {
            udid: Some("ABC".into()),
            keychain_password: Some("hunter2".into()),
            ..Default::default()
        };
        let value = opts.redacted();
        assert_eq!(value["keychain_password"], "[REDACTED]");
        assert_eq!(value["udid"], "ABC");
        assert!(value.get("bundle_id").is_none());

        let config = RunnerConfig::from_options(&RunnerOptions { xcode_version: Some("9.0".into()), ..opts }, None).unwrap();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_is_safari() {
        let mut opts = options("ABC");
        opts.bundle_id = Some("com.apple.mobilesafari".into());
        assert!(RunnerConfig::from_options(&opts, None).unwrap().is_safari());
        opts.bundle_id = Some("io.appium.TestApp".into());
        assert!(!RunnerConfig::from_options(&opts, None).unwrap().is_safari());
    }
}
