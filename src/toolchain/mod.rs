//! Xcode toolchain detection
//!
//! The backends only care about the Xcode major/minor version: it decides
//! the xcodebuild verbs, whether the legacy project fix applies and whether
//! prebuilding is possible at all.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::process::{exec, ProcessError, ProcessSpec};

/// Errors from toolchain detection.
#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("unable to run '{tool} -version': {source}")]
    Probe {
        tool: String,
        #[source]
        source: ProcessError,
    },

    #[error("unrecognised Xcode version output: {0:?}")]
    Unparseable(String),
}

/// Installed Xcode version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcodeVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<u32>,
    /// Version as printed by xcodebuild (e.g. "9.4.1")
    pub version_string: String,
    /// Build identifier (e.g. "9F2000"), when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl XcodeVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            patch: None,
            version_string: format!("{}.{}", major, minor),
            build: None,
        }
    }

    /// Parse `xcodebuild -version` output.
    ///
    /// ```text
    /// Xcode 9.4.1
    /// Build version 9F2000
    /// ```
    pub fn parse(output: &str) -> Result<Self, ToolchainError> {
        let mut version: Option<Self> = None;
        let mut build = None;

        for line in output.lines().map(str::trim) {
            if let Some(v) = line.strip_prefix("Xcode ") {
                version = Some(v.trim().parse()?);
            } else if let Some(b) = line.strip_prefix("Build version ") {
                build = Some(b.trim().to_string());
            }
        }

        let mut version = version.ok_or_else(|| ToolchainError::Unparseable(output.to_string()))?;
        version.build = build;
        Ok(version)
    }

    /// Run `<xcodebuild> -version` and parse the result.
    pub fn detect(xcodebuild: &str) -> Result<Self, ToolchainError> {
        let output = exec(&ProcessSpec::new(xcodebuild).arg("-version")).map_err(|source| {
            ToolchainError::Probe {
                tool: xcodebuild.to_string(),
                source,
            }
        })?;
        let version = Self::parse(&output.stdout)?;
        debug!("Detected Xcode {}", version);
        Ok(version)
    }

    /// Xcode 7.x and 8.0 need the older project format.
    pub fn needs_legacy_project(&self) -> bool {
        self.major == 7 || (self.major == 8 && self.minor == 0)
    }

    /// `build-for-testing` / `test-without-building` exist from Xcode 8.
    pub fn supports_split_build(&self) -> bool {
        self.major >= 8
    }
}

impl FromStr for XcodeVersion {
    type Err = ToolchainError;

    /// Parse a bare version such as "9.2" or "10.0.1".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unparseable = || ToolchainError::Unparseable(s.to_string());
        let mut parts = s.trim().split('.');

        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(unparseable)?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| unparseable())?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(p) => Some(p.parse().map_err(|_| unparseable())?),
            None => None,
        };

        Ok(Self {
            major,
            minor,
            patch,
            version_string: s.trim().to_string(),
            build: None,
        })
    }
}

impl fmt::Display for XcodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version_string)?;
        if let Some(ref build) = self.build {
            write!(f, " ({})", build)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xcodebuild_output() {
        let version = XcodeVersion::parse("Xcode 9.4.1\nBuild version 9F2000\n").unwrap();
        assert_eq!(version.major, 9);
        assert_eq!(version.minor, 4);
        assert_eq!(version.patch, Some(1));
        assert_eq!(version.version_string, "9.4.1");
        assert_eq!(version.build.as_deref(), Some("9F2000"));
        assert_eq!(version.to_string(), "9.4.1 (9F2000)");
    }

    #[test]
    fn test_parse_without_build_line() {
        let version = XcodeVersion::parse("Xcode 8.0").unwrap();
        assert_eq!((version.major, version.minor, version.patch), (8, 0, None));
        assert!(version.build.is_none());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            XcodeVersion::parse("xcode-select: error: tool 'xcodebuild' requires Xcode"),
            Err(ToolchainError::Unparseable(_))
        ));
        assert!("nine".parse::<XcodeVersion>().is_err());
        assert!("9.x".parse::<XcodeVersion>().is_err());
    }

    #[test]
    fn test_major_only() {
        let version: XcodeVersion = "10".parse().unwrap();
        assert_eq!((version.major, version.minor), (10, 0));
    }

    #[test]
    fn test_legacy_project() {
        assert!(XcodeVersion::new(7, 3).needs_legacy_project());
        assert!(XcodeVersion::new(8, 0).needs_legacy_project());
        assert!(!XcodeVersion::new(8, 1).needs_legacy_project());
        assert!(!XcodeVersion::new(9, 0).needs_legacy_project());
    }

    #[test]
    fn test_split_build_support() {
        assert!(!XcodeVersion::new(7, 3).supports_split_build());
        assert!(XcodeVersion::new(8, 0).supports_split_build());
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_with_stub_tool() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("xcodebuild");
        std::fs::write(&tool, "#!/bin/sh\necho 'Xcode 10.1'\necho 'Build version 10B61'\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let version = XcodeVersion::detect(tool.to_str().unwrap()).unwrap();
        assert_eq!(version, XcodeVersion {
            major: 10,
            minor: 1,
            patch: None,
            version_string: "10.1".to_string(),
            build: Some("10B61".to_string()),
        });
    }

    #[test]
    fn test_detect_missing_tool() {
        assert!(matches!(
            XcodeVersion::detect("/nonexistent/xcodebuild"),
            Err(ToolchainError::Probe { .. })
        ));
    }
}
