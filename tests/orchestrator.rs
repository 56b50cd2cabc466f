//! Orchestrator integration tests: adopting a running agent, real-device
//! port forwarding and cleanup of leftover processes.

#![cfg(unix)]

mod fixtures;

use std::process::Command;
use std::time::Duration;

use fixtures::{stub_agent, unused_port, wait_for, Workspace, STATUS_BODY};
use wda_runner::config::{RunnerConfig, RunnerOptions};
use wda_runner::WebDriverAgent;

// =============================================================================
// Provided agent URL
// =============================================================================

#[test]
fn test_provided_url_is_used_as_is() {
    let ws = Workspace::new();
    let port = stub_agent(STATUS_BODY);
    let url = format!("http://127.0.0.1:{}", port);

    let options = RunnerOptions {
        web_driver_agent_url: Some(url.clone()),
        xcodebuild_path: Some(ws.fake_tool("xcodebuild", &format!("echo run >> '{}'", ws.invocation_log().display()))),
        ..Default::default()
    };
    let mut wda = WebDriverAgent::new(RunnerConfig::from_options(&options, None).unwrap());
    let result = wda.launch(Some("abc")).unwrap();

    assert_eq!(result.url, url);
    assert_eq!(wda.url(), url);
    assert!(result.status.is_none());
    assert!(ws.invocations().is_empty());

    // channels point at the provided agent
    let status = wda
        .no_session_channel()
        .unwrap()
        .lock()
        .unwrap()
        .status(Duration::from_secs(2))
        .unwrap();
    assert_eq!(status.ip(), Some("10.0.0.7"));

    let channel = wda.session_channel().unwrap().lock().unwrap();
    assert_eq!(channel.url_for("/url"), format!("{}/session/abc/url", url));
}

// =============================================================================
// Real devices
// =============================================================================

#[test]
fn test_real_device_starts_iproxy() {
    let ws = Workspace::new();
    let port = stub_agent(STATUS_BODY);
    let log = ws.invocation_log();
    let iproxy = ws.fake_tool("iproxy", &format!("echo \"iproxy $*\" >> '{}'\nexec sleep 30", log.display()));
    let xcodebuild = ws.fake_tool("xcodebuild", &format!("echo \"xcodebuild $*\" >> '{}'\nexec sleep 30", log.display()));

    let mut options = ws.options("REAL-DEVICE-1", port);
    options.real_device = Some(true);
    options.iproxy_path = Some(iproxy);
    options.xcodebuild_path = Some(xcodebuild);
    options.xcode_config_file = Some(ws.path().join("signing.xcconfig"));
    let mut wda = WebDriverAgent::new(RunnerConfig::from_options(&options, None).unwrap());
    wda.launch(None).unwrap();
    wda.set_fully_started(true);
    assert!(wda.fully_started());

    // both tools run concurrently, so their lines may land in any order
    let invocations = ws.wait_for_invocations(2);
    assert!(invocations.contains(&format!("iproxy {} 8100 REAL-DEVICE-1", port)));
    let build = invocations
        .iter()
        .find(|line| line.starts_with("xcodebuild "))
        .expect("xcodebuild was run");
    assert!(build.starts_with("xcodebuild build-for-testing test-without-building"));
    assert!(build.ends_with(&format!("-xcconfig {}", ws.path().join("signing.xcconfig").display())));

    wda.quit();
    assert!(!wda.fully_started());
}

// =============================================================================
// Leftover processes
// =============================================================================

#[test]
fn test_kill_hanging_processes() {
    let ws = Workspace::new();
    // no exec: the shell's command line keeps naming the script and udid
    let script = ws.fake_tool("xcodebuild", "sleep 30");
    let mut child = Command::new(&script).arg("HANGING-UDID-1").spawn().unwrap();

    let mut options = ws.options("HANGING-UDID-1", unused_port());
    options.xcodebuild_path = Some(script);
    let config = RunnerConfig::from_options(&options, None).unwrap();

    // give ps a chance to see the child
    std::thread::sleep(Duration::from_millis(200));
    WebDriverAgent::kill_hanging_processes(&config);

    let status = wait_for(Duration::from_secs(5), || child.try_wait().ok().flatten());
    let status = status.expect("hanging process was killed");
    assert!(!status.success());
}
