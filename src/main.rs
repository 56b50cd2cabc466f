//! wda-runner CLI
//!
//! Entry point for the `wda-runner` command-line tool.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::debug;
use wda_runner::backend::XcodeBuild;
use wda_runner::config::{LaunchSystem, RunnerConfig, RunnerOptions};
use wda_runner::logging::init_logging;
use wda_runner::toolchain::XcodeVersion;
use wda_runner::WebDriverAgent;

#[derive(Parser)]
#[command(name = "wda-runner")]
#[command(about = "Launch and supervise WebDriverAgent", version)]
struct Cli {
    /// Log at debug level (overrides WDA_RUNNER_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch WebDriverAgent and keep it running until interrupted
    Launch {
        #[command(flatten)]
        options: OptionArgs,

        /// Session id attached to the session-bound channel (default: random)
        #[arg(long)]
        session_id: Option<String>,

        /// Print the launch result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the xcodebuild invocation without running it
    Command {
        #[command(flatten)]
        options: OptionArgs,

        /// Show the build-only invocation
        #[arg(long)]
        build_only: bool,
    },
}

#[derive(Args)]
struct OptionArgs {
    /// Path to a TOML options file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Device or simulator udid
    #[arg(long)]
    udid: Option<String>,

    /// Platform version of the device (e.g. "11.2")
    #[arg(long)]
    platform_version: Option<String>,

    /// Target is a physical device
    #[arg(long)]
    real_device: bool,

    /// Bundle id of the application under test
    #[arg(long)]
    bundle_id: Option<String>,

    /// Local port the agent is exposed on
    #[arg(long)]
    wda_local_port: Option<u16>,

    /// xcodebuild or fbsimctl
    #[arg(long)]
    launch_system: Option<LaunchSystem>,

    /// Assume this Xcode version instead of detecting it
    #[arg(long)]
    xcode_version: Option<String>,

    /// WebDriverAgent checkout
    #[arg(long)]
    bootstrap_path: Option<PathBuf>,

    /// WebDriverAgent.xcodeproj (default: inside the checkout)
    #[arg(long)]
    agent_path: Option<PathBuf>,

    /// Prebuilt WebDriverAgentRunner.xctest, or a directory to search
    #[arg(long)]
    xctest_path: Option<PathBuf>,

    /// Use an already running agent at this URL
    #[arg(long)]
    web_driver_agent_url: Option<String>,

    /// Launch timeout in milliseconds
    #[arg(long)]
    launch_timeout_ms: Option<u64>,

    /// Build before launching, then only run the test phase
    #[arg(long)]
    prebuild: bool,

    /// Skip the build phase
    #[arg(long)]
    use_prebuilt: bool,

    /// Use plain build/test verbs
    #[arg(long)]
    use_simple_build_test: bool,

    /// Log xcodebuild output and its diagnostic log
    #[arg(long)]
    show_xcode_log: bool,
}

impl OptionArgs {
    fn overrides(&self) -> RunnerOptions {
        RunnerOptions {
            udid: self.udid.clone(),
            platform_version: self.platform_version.clone(),
            real_device: self.real_device.then_some(true),
            bundle_id: self.bundle_id.clone(),
            wda_local_port: self.wda_local_port,
            launch_system: self.launch_system,
            xcode_version: self.xcode_version.clone(),
            bootstrap_path: self.bootstrap_path.clone(),
            agent_path: self.agent_path.clone(),
            xctest_path: self.xctest_path.clone(),
            web_driver_agent_url: self.web_driver_agent_url.clone(),
            launch_timeout_ms: self.launch_timeout_ms,
            prebuild_wda: self.prebuild.then_some(true),
            use_prebuilt_wda: self.use_prebuilt.then_some(true),
            use_simple_build_test: self.use_simple_build_test.then_some(true),
            show_xcode_log: self.show_xcode_log.then_some(true),
            ..Default::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Launch {
            options,
            session_id,
            json,
        } => {
            let config = resolve_config(&options);
            run_launch(config, session_id, json);
        }
        Commands::Command { options, build_only } => {
            let config = resolve_config(&options);
            run_command(config, build_only);
        }
    }
}

fn resolve_config(args: &OptionArgs) -> RunnerConfig {
    let options = match RunnerOptions::load(args.config.as_deref(), &args.overrides()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error loading options: {}", e);
            process::exit(1);
        }
    };
    debug!("Effective options: {}", options.redacted());

    let detected = if options.xcode_version.is_some() || options.web_driver_agent_url.is_some() {
        None
    } else {
        Some(detect_xcode(options.xcodebuild_path.as_deref().unwrap_or("xcodebuild")))
    };

    match RunnerConfig::from_options(&options, detected) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn detect_xcode(xcodebuild: &str) -> XcodeVersion {
    match XcodeVersion::detect(xcodebuild) {
        Ok(version) => version,
        Err(e) => {
            eprintln!("Error detecting Xcode: {}", e);
            eprintln!("Pass --xcode-version to skip detection.");
            process::exit(1);
        }
    }
}

fn run_launch(config: RunnerConfig, session_id: Option<String>, json: bool) {
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut wda = WebDriverAgent::new(config);

    let (tx, rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        eprintln!("Error installing interrupt handler: {}", e);
        process::exit(1);
    }

    let result = match wda.launch(Some(&session_id)) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Unable to launch WebDriverAgent: {}", e);
            wda.quit();
            process::exit(1);
        }
    };
    wda.set_fully_started(true);

    if json {
        let output = serde_json::json!({
            "url": result.url,
            "session_id": session_id,
            "agent_url": wda.agent_url(),
            "derived_data_path": wda.derived_data_path().map(|p| p.display().to_string()),
            "status": result.status,
        });
        println!("{}", output);
    } else {
        println!("WebDriverAgent listening at {}", result.url);
        if let Some(agent_url) = wda.agent_url() {
            println!("  Device address: {}", agent_url);
        }
        if let Some(path) = wda.derived_data_path() {
            println!("  Derived data: {}", path.display());
        }
        if result.status.is_none() {
            println!("  (agent did not answer /status yet)");
        }
    }

    eprintln!("Press Ctrl-C to stop.");
    let _ = rx.recv();
    eprintln!("\nReceived interrupt signal, shutting down...");
    wda.quit();
}

fn run_command(config: RunnerConfig, build_only: bool) {
    if config.launch_system != LaunchSystem::Xcodebuild {
        eprintln!("Launch system '{}' does not use xcodebuild", config.launch_system);
        process::exit(1);
    }
    let bootstrap = config.bootstrap_path.clone();
    let port = config.wda_remote_port;
    let spec = XcodeBuild::new(Arc::new(config)).command(build_only);

    println!("cd {}", display_path(&bootstrap));
    println!("USE_PORT={} {}", port, spec.command_line());
}

fn display_path(path: &Path) -> String {
    let shown = path.display().to_string();
    if shown.contains(' ') {
        format!("'{}'", shown)
    } else {
        shown
    }
}
