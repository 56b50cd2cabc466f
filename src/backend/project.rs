//! WebDriverAgent project preparation
//!
//! Mutations applied to the checkout before building, and their undo:
//! - legacy project format for Xcode 7.x / 8.0 (applied once, never undone)
//! - runner bundle id rewrite for real devices (backed up, restored on reset)
//! - Carthage dependency bootstrap

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::process::{exec, ProcessSpec};

/// Bundle id the upstream project ships with.
pub const WDA_RUNNER_BUNDLE_ID: &str = "com.facebook.WebDriverAgentRunner";

/// Highest project format understood by Xcode 7.x and 8.0.
pub const LEGACY_OBJECT_VERSION: u32 = 46;

/// Marker left in the checkout once the legacy fix has been applied.
const LEGACY_MARKER: &str = ".legacy-project-format";

const BACKUP_SUFFIX: &str = "old";

/// `<agent>/project.pbxproj`
pub fn project_file(agent_path: &Path) -> PathBuf {
    agent_path.join("project.pbxproj")
}

fn backup_file(agent_path: &Path) -> PathBuf {
    project_file(agent_path).with_extension(format!("pbxproj.{}", BACKUP_SUFFIX))
}

fn project_error(path: &Path, err: impl ToString) -> RunnerError {
    RunnerError::Project {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Lower the project's `objectVersion` so older Xcode releases can open it.
///
/// Returns false when the fix had already been applied.
pub fn fix_for_legacy_xcode(bootstrap_path: &Path, agent_path: &Path) -> RunnerResult<bool> {
    let marker = bootstrap_path.join(LEGACY_MARKER);
    if marker.exists() {
        debug!("Legacy project fix already applied to '{}'", bootstrap_path.display());
        return Ok(false);
    }

    let path = project_file(agent_path);
    let contents = fs::read_to_string(&path).map_err(|e| project_error(&path, e))?;
    let fixed = lower_object_version(&contents, LEGACY_OBJECT_VERSION);
    if fixed != contents {
        fs::write(&path, fixed).map_err(|e| project_error(&path, e))?;
    }
    fs::write(&marker, "").map_err(|e| project_error(&marker, e))?;
    info!("Lowered project format of '{}' to objectVersion {}", path.display(), LEGACY_OBJECT_VERSION);
    Ok(true)
}

fn lower_object_version(contents: &str, max: u32) -> String {
    let re = match Regex::new(r"objectVersion = (\d+);") {
        Ok(re) => re,
        Err(_) => return contents.to_string(),
    };
    re.replace_all(contents, |caps: &regex_lite::Captures<'_>| {
        match caps[1].parse::<u32>() {
            Ok(v) if v > max => format!("objectVersion = {};", max),
            _ => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Replace the runner bundle id in the project file.
///
/// The original file is kept as `project.pbxproj.old`. An existing backup is
/// never overwritten, so repeated updates still restore the pristine file.
pub fn update_bundle_id(agent_path: &Path, new_bundle_id: &str) -> RunnerResult<()> {
    let path = project_file(agent_path);
    let backup = backup_file(agent_path);

    if !backup.exists() {
        fs::copy(&path, &backup).map_err(|e| project_error(&backup, e))?;
    }

    let contents = fs::read_to_string(&path).map_err(|e| project_error(&path, e))?;
    fs::write(&path, contents.replace(WDA_RUNNER_BUNDLE_ID, new_bundle_id))
        .map_err(|e| project_error(&path, e))?;

    info!("Updated WebDriverAgent bundle id to '{}'", new_bundle_id);
    Ok(())
}

/// Restore the project file saved by [`update_bundle_id`].
///
/// Returns false when there was nothing to restore.
pub fn reset_bundle_id(agent_path: &Path) -> RunnerResult<bool> {
    let path = project_file(agent_path);
    let backup = backup_file(agent_path);

    match fs::copy(&backup, &path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No project backup at '{}', nothing to reset", backup.display());
            return Ok(false);
        }
        Err(e) => return Err(project_error(&path, e)),
    }
    fs::remove_file(&backup).map_err(|e| project_error(&backup, e))?;

    info!("Restored WebDriverAgent bundle id to '{}'", WDA_RUNNER_BUNDLE_ID);
    Ok(true)
}

/// Fetch Carthage dependencies when the checkout has none.
///
/// Returns true when the bootstrap script was run.
pub fn check_for_dependencies(bootstrap_path: &Path, use_ssl: bool) -> RunnerResult<bool> {
    if bootstrap_path.join("Carthage").exists() {
        return Ok(false);
    }

    info!("Carthage dependencies missing in '{}', bootstrapping", bootstrap_path.display());
    let mut spec = ProcessSpec::new("bash")
        .args(["Scripts/bootstrap.sh", "-d"])
        .current_dir(bootstrap_path);
    if use_ssl {
        spec = spec.arg("-D");
    }
    exec(&spec).map_err(RunnerError::Dependencies)?;
    Ok(true)
}
