//! Shared fixtures for integration tests
//!
//! - a throwaway WebDriverAgent checkout (project directory + Carthage)
//! - fake native tools written as shell scripts
//! - a stub agent answering `/status`

#![allow(dead_code)]

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wda_runner::config::RunnerOptions;

/// Status body reported by the stub agent.
pub const STATUS_BODY: &str =
    r#"{"value":{"state":"success","os":{"name":"iOS","version":"11.2"},"ios":{"ip":"10.0.0.7"}},"sessionId":null,"status":0}"#;

/// A temporary directory laid out like a WebDriverAgent checkout.
pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let bootstrap = root.path().join("WebDriverAgent");
        fs::create_dir_all(bootstrap.join("WebDriverAgent.xcodeproj")).unwrap();
        fs::create_dir_all(bootstrap.join("Carthage")).unwrap();
        fs::create_dir_all(root.path().join("bin")).unwrap();
        fs::create_dir_all(root.path().join("DerivedData")).unwrap();
        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn bootstrap(&self) -> PathBuf {
        self.path().join("WebDriverAgent")
    }

    pub fn derived_data(&self) -> PathBuf {
        self.path().join("DerivedData")
    }

    /// File fake tools append their arguments to.
    pub fn invocation_log(&self) -> PathBuf {
        self.path().join("invocations.log")
    }

    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.invocation_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Invocations once at least `count` have been logged. The stub agent
    /// may answer before a fake tool has run its first line.
    pub fn wait_for_invocations(&self, count: usize) -> Vec<String> {
        wait_for(Duration::from_secs(5), || {
            let lines = self.invocations();
            (lines.len() >= count).then_some(lines)
        })
        .unwrap_or_else(|| self.invocations())
    }

    /// Write an executable `bin/<name>` running `body` under `/bin/sh`.
    pub fn fake_tool(&self, name: &str, body: &str) -> String {
        let path = self.path().join("bin").join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Simulator options pointing at this checkout.
    pub fn options(&self, udid: &str, port: u16) -> RunnerOptions {
        RunnerOptions {
            udid: Some(udid.to_string()),
            platform_version: Some("11.2".to_string()),
            xcode_version: Some("9.2".to_string()),
            wda_local_port: Some(port),
            bootstrap_path: Some(self.bootstrap()),
            derived_data_root: Some(self.derived_data()),
            launch_timeout_ms: Some(5_000),
            ..Default::default()
        }
    }
}

/// Serve `body` for every request until the test process exits.
pub fn stub_agent(body: &'static str) -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tiny_http::Server::from_listener(listener, None).unwrap();
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let _ = request.respond(tiny_http::Response::from_string(body));
        }
    });
    port
}

/// A port nothing is listening on.
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `f` until it returns `Some` or `timeout` passes.
pub fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(50));
    }
}
