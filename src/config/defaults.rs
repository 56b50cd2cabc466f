//! Built-in runner defaults (layer 1)
//!
//! Values used for every option the caller leaves unset.

use serde::{Deserialize, Serialize};

/// Built-in default option values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Launch timeout in milliseconds (default: 60000)
    pub launch_timeout_ms: u64,

    /// Proxy request timeout in milliseconds (default: 240000)
    pub connection_timeout_ms: u64,

    /// Code signing identity (default: "iPhone Developer")
    pub xcode_signing_id: String,

    /// Launch system (default: "xcodebuild")
    pub launch_system: String,

    /// WebDriverAgent checkout (default: "WebDriverAgent")
    pub bootstrap_path: String,

    /// Tool names, resolved through PATH
    pub xcodebuild_path: String,
    pub fbsimctl_path: String,
    pub iproxy_path: String,

    pub real_device: bool,
    pub use_simple_build_test: bool,
    pub use_prebuilt_wda: bool,
    pub prebuild_wda: bool,
    pub show_xcode_log: bool,
    pub use_carthage_ssl: bool,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 60_000,
            connection_timeout_ms: 240_000,
            xcode_signing_id: "iPhone Developer".to_string(),
            launch_system: "xcodebuild".to_string(),
            bootstrap_path: "WebDriverAgent".to_string(),
            xcodebuild_path: "xcodebuild".to_string(),
            fbsimctl_path: "fbsimctl".to_string(),
            iproxy_path: "iproxy".to_string(),
            real_device: false,
            use_simple_build_test: false,
            use_prebuilt_wda: false,
            prebuild_wda: false,
            show_xcode_log: false,
            use_carthage_ssl: false,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for layering
    pub fn to_value(&self) -> serde_json::Value {
        // field names match RunnerOptions one to one
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
