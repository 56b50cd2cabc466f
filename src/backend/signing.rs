//! Code signing setup for real devices.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::SigningOptions;
use crate::error::{RunnerError, RunnerResult};
use crate::process::{exec, ProcessSpec};

/// Seconds the unlocked keychain stays unlocked.
const KEYCHAIN_UNLOCK_SECONDS: u32 = 3600;

/// Supplies the `.xcconfig` passed to xcodebuild for real devices.
pub trait SigningConfigProvider: Send {
    /// Path of the xcconfig to use, or `None` to build without one.
    fn xcconfig(&self, signing: &SigningOptions) -> RunnerResult<Option<PathBuf>>;
}

/// Uses the configured xcconfig file, if any. Generating one from the org
/// and signing ids is left to callers that provide their own provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredXcconfig;

impl SigningConfigProvider for ConfiguredXcconfig {
    fn xcconfig(&self, signing: &SigningOptions) -> RunnerResult<Option<PathBuf>> {
        if signing.xcode_config_file.is_none() && signing.xcode_org_id.is_some() {
            debug!(
                "Org id '{}' set without an xcconfig file; building with project signing settings",
                signing.xcode_org_id.as_deref().unwrap_or_default()
            );
        }
        Ok(signing.xcode_config_file.clone())
    }
}

impl fmt::Debug for dyn SigningConfigProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningConfigProvider")
    }
}

/// `security` invocations that make `keychain` the unlocked default.
pub fn keychain_commands(keychain: &Path, password: &str) -> Vec<ProcessSpec> {
    let keychain = keychain.to_string_lossy().into_owned();
    vec![
        ProcessSpec::new("security").args(["-v", "list-keychains", "-s", keychain.as_str()]),
        ProcessSpec::new("security")
            .args(["-v", "unlock-keychain", "-p"])
            .secret_arg(password)
            .arg(keychain.as_str()),
        ProcessSpec::new("security")
            .args(["set-keychain-settings", "-t"])
            .arg(KEYCHAIN_UNLOCK_SECONDS.to_string())
            .args(["-l", keychain.as_str()]),
    ]
}

/// Unlock the signing keychain when both path and password are configured.
///
/// Returns false when there was nothing to do.
pub fn unlock_keychain(signing: &SigningOptions) -> RunnerResult<bool> {
    let (Some(keychain), Some(password)) = (&signing.keychain_path, &signing.keychain_password) else {
        return Ok(false);
    };

    debug!("Setting security for iOS device");
    for spec in keychain_commands(keychain, password) {
        exec(&spec).map_err(|e| RunnerError::Signing(e.to_string()))?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keychain_commands() {
        let commands = keychain_commands(Path::new("/tmp/ci.keychain"), "hunter2");
        let lines: Vec<String> = commands.iter().map(ProcessSpec::command_line).collect();
        assert_eq!(
            lines,
            vec![
                "security -v list-keychains -s /tmp/ci.keychain",
                "security -v unlock-keychain -p **** /tmp/ci.keychain",
                "security set-keychain-settings -t 3600 -l /tmp/ci.keychain",
            ]
        );
        assert_eq!(commands[1].args[3], "hunter2");
    }

    #[test]
    fn test_unlock_skipped_without_password() {
        let signing = SigningOptions {
            keychain_path: Some(PathBuf::from("/tmp/ci.keychain")),
            ..Default::default()
        };
        assert!(!unlock_keychain(&signing).unwrap());
    }

    #[test]
    fn test_configured_xcconfig() {
        let mut signing = SigningOptions::default();
        assert_eq!(ConfiguredXcconfig.xcconfig(&signing).unwrap(), None);

        signing.xcode_config_file = Some(PathBuf::from("/tmp/wda.xcconfig"));
        assert_eq!(
            ConfiguredXcconfig.xcconfig(&signing).unwrap(),
            Some(PathBuf::from("/tmp/wda.xcconfig"))
        );
    }
}
