//! l3-agentd daemon entry point.
//!
//! Loads the configuration, builds the driver and controller client, and
//! runs the agent until SIGINT or SIGTERM. SIGHUP requests a full sync.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use l3_agent_common::{CommandExecutor, PluginApi, RecordingExecutor, ShellExecutor};
use l3_agentd::config::DEFAULT_CONFIG_PATH;
use l3_agentd::driver::create_driver;
use l3_agentd::{AgentConfig, FilePluginApi, L3Agent};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// L3 router agent
#[derive(Parser, Debug)]
#[command(name = "l3-agentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Host name to report under
    #[arg(long)]
    host: Option<String>,

    /// Record commands instead of executing them
    #[arg(long)]
    dry_run: bool,

    /// Number of router workers
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// JSON state file backing the standalone controller
    #[arg(long)]
    controller_state_file: Option<PathBuf>,

    /// Interface driver (ovs, linuxbridge)
    #[arg(long)]
    interface_driver: Option<String>,
}

impl Args {
    fn apply(&self, conf: &mut AgentConfig) {
        if let Some(host) = &self.host {
            conf.host = host.clone();
        }
        if self.dry_run {
            conf.dry_run = true;
        }
        if let Some(workers) = self.workers {
            conf.workers = workers;
        }
        if let Some(path) = &self.controller_state_file {
            conf.controller_state_file = Some(path.clone());
        }
        if let Some(driver) = &self.interface_driver {
            conf.interface_driver = Some(driver.clone());
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .init();
}

fn build_executor(conf: &AgentConfig) -> Arc<dyn CommandExecutor> {
    if conf.dry_run {
        info!("Dry-run mode: commands are recorded, not executed");
        Arc::new(RecordingExecutor::new())
    } else {
        Arc::new(ShellExecutor)
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut conf = AgentConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut conf);
    let driver_kind = conf.check_config_params()?;

    let executor = build_executor(&conf);
    let driver = create_driver(executor.clone(), driver_kind, conf.state_path.clone());

    let controller_path = conf
        .controller_state_file
        .clone()
        .unwrap_or_else(|| conf.state_path.join("controller.json"));
    info!(path = %controller_path.display(), "Using file-backed controller");
    let plugin_rpc: Arc<dyn PluginApi> = Arc::new(FilePluginApi::new(controller_path));

    let agent = L3Agent::new(conf, plugin_rpc, driver, executor).await?;

    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    {
        let agent = Arc::clone(&agent);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Received SIGINT, shutting down gracefully...");
                        break;
                    }
                    _ = sigterm.recv() => {
                        warn!("Received SIGTERM, shutting down gracefully...");
                        break;
                    }
                    _ = sighup.recv() => {
                        info!("Received SIGHUP, scheduling full sync");
                        agent.agent_updated(&serde_json::json!({"reason": "SIGHUP"}));
                    }
                }
            }
            cancel.cancel();
        });
    }

    agent.run(cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting l3-agentd ---");
    match run(args).await {
        Ok(()) => {
            info!("--- l3-agentd shutdown complete ---");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("l3-agentd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
