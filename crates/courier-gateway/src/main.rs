#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary, stdout/stderr is the UI

mod cli;
mod command;
mod config;
mod config_check;
mod config_watcher;
mod dedup;
mod delivery;
mod executor;
mod loop_guard;
mod registry;
mod relay_loop;
mod scheduler;
mod session_store;
mod sinks;
mod sources;
mod tracing_setup;

use anyhow::{Context, Result};
use clap::Parser;
use courier_agent::{ClaudeConfig, ClaudeRunner};
use courier_channels::{SlackChannel, SlackConfig};
use courier_core::AgentRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{CheckFormat, Cli, Commands};
use crate::config::{AgentConfig, Config, RelayConfig, resolve_config_path, shared_config};
use crate::dedup::DedupFilter;
use crate::delivery::DeliveryLimits;
use crate::registry::SessionRegistry;
use crate::relay_loop::{RelayContext, run_relay_loop};
use crate::scheduler::{TaskExecutor, TaskRunOutcome};
use crate::sinks::SinkContext;

/// How long in-flight work gets to wind down after ctrl-c.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "courier starting"
    );

    match cli.command {
        Commands::Check { format } => cmd_check(cli.config.as_deref(), format),
        Commands::Serve => cmd_serve(cli.config.as_deref()).await,
        Commands::Run { task } => cmd_run(cli.config.as_deref(), &task).await,
        Commands::Version => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn config_dir_of(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

fn load_config(config_path: Option<&str>) -> Result<(Config, PathBuf, PathBuf)> {
    let config_file = Config::find_config_path(config_path);
    let config = Config::load(&config_file)
        .with_context(|| format!("loading config from {}", config_file.display()))?;
    let config_dir = config_dir_of(&config_file);
    Ok((config, config_file, config_dir))
}

fn build_runner(agent: &AgentConfig, config_dir: &Path) -> Arc<dyn AgentRunner> {
    Arc::new(ClaudeRunner::new(ClaudeConfig {
        binary: agent.binary.clone(),
        model: agent.model.clone(),
        extra_args: agent.extra_args.clone(),
        workdir: agent
            .workdir
            .as_deref()
            .map(|dir| resolve_config_path(config_dir, dir)),
        stop_grace: agent.stop_grace(),
    }))
}

fn open_registry(config: &Config, config_dir: &Path) -> Result<Arc<SessionRegistry>> {
    let dir = resolve_config_path(config_dir, &config.sessions.dir);
    let registry = SessionRegistry::open(&dir)
        .with_context(|| format!("opening session store {}", dir.display()))?;
    info!(dir = %dir.display(), sessions = registry.len(), "session registry loaded");
    Ok(Arc::new(registry))
}

// ---------------------------------------------------------------------------
// cmd_check: validate config without starting
// ---------------------------------------------------------------------------

#[allow(clippy::unnecessary_wraps)] // must return Result to match main's match arms
fn cmd_check(config_path: Option<&str>, format: CheckFormat) -> Result<()> {
    let config_file = Config::find_config_path(config_path);
    let config_dir = config_dir_of(&config_file);

    let report = config_check::validate_config(&config_file, &config_dir);

    match format {
        CheckFormat::Json => report.print_json(),
        CheckFormat::Human => report.print_human(),
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_serve: scheduler plus optional relay until ctrl-c
// ---------------------------------------------------------------------------

async fn cmd_serve(config_path: Option<&str>) -> Result<()> {
    let (config, config_file, config_dir) = load_config(config_path)?;

    let registry = open_registry(&config, &config_dir)?;
    let runner = build_runner(&config.agent, &config_dir);
    let sinks = SinkContext::from_config(&config, &config_dir);
    let executor = Arc::new(TaskExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&runner),
        sinks,
    ));

    let relay = config.relay.clone();
    let task_count = config.tasks.len();
    let shared = shared_config(config);
    let shutdown_token = CancellationToken::new();

    let config_watcher = config_watcher::spawn_config_watcher(
        config_file,
        Arc::clone(&shared),
        shutdown_token.clone(),
    );

    let scheduler = tokio::spawn(scheduler::run_scheduler(
        Arc::clone(&shared),
        executor,
        shutdown_token.clone(),
    ));

    let relay_task = match relay {
        Some(relay) => start_relay(&relay, registry, runner, shutdown_token.clone()),
        None => {
            info!("no [relay] configured, chat relay disabled");
            None
        }
    };

    info!(
        tasks = task_count,
        relay = relay_task.is_some(),
        "courier serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown_token.cancel();

    let mut handles = vec![config_watcher, scheduler];
    handles.extend(relay_task);
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("background task did not stop within the shutdown grace period");
        }
    }

    Ok(())
}

/// Start the Slack relay in the background. Only missing credentials keep
/// it from starting; connection trouble is retried inside the task so
/// scheduled tasks keep running meanwhile.
fn start_relay(
    relay: &RelayConfig,
    registry: Arc<SessionRegistry>,
    runner: Arc<dyn AgentRunner>,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let credentials = match relay.credentials() {
        Ok(credentials) => credentials,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "relay disabled: missing credentials");
            return None;
        }
    };

    let slack = SlackConfig {
        bot_token: credentials.bot_token,
        app_token: credentials.app_token,
        api_base: relay.api_base.clone(),
    };
    let ctx = Arc::new(RelayContext {
        registry,
        runner,
        dedup: DedupFilter::default(),
        allowed_tools: relay.allowed_tools.clone(),
        limits: DeliveryLimits::from(&relay.delivery),
    });

    Some(tokio::spawn(async move {
        let channel = tokio::select! {
            result = SlackChannel::connect(slack) => match result {
                Ok(channel) => channel,
                Err(error) => {
                    error!(error = %format!("{error:#}"), "relay disabled: slack rejected the bot token");
                    return;
                }
            },
            () = shutdown.cancelled() => return,
        };
        if let Err(error) = run_relay_loop(channel, ctx, shutdown).await {
            warn!(error = %format!("{error:#}"), "relay loop stopped");
        }
    }))
}

// ---------------------------------------------------------------------------
// cmd_run: fire one task and exit
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&str>, task_name: &str) -> Result<()> {
    let (config, _config_file, config_dir) = load_config(config_path)?;
    let task = config.task(task_name).cloned().with_context(|| {
        let known: Vec<_> = config.tasks.iter().map(|t| t.name.as_str()).collect();
        format!("unknown task '{task_name}' (configured: {})", known.join(", "))
    })?;

    let registry = open_registry(&config, &config_dir)?;
    let runner = build_runner(&config.agent, &config_dir);
    let sinks = SinkContext::from_config(&config, &config_dir);
    let executor = TaskExecutor::new(registry, runner, sinks);

    match executor.fire(&task).await {
        TaskRunOutcome::Completed { delivered } => {
            println!("task '{task_name}' completed (delivered: {delivered})");
            Ok(())
        }
        TaskRunOutcome::NoNewItems => {
            println!("task '{task_name}' had no new source items");
            Ok(())
        }
        TaskRunOutcome::Skipped => {
            println!("task '{task_name}' is already running");
            Ok(())
        }
        TaskRunOutcome::Failed(reason) => anyhow::bail!("task '{task_name}' failed: {reason}"),
    }
}
