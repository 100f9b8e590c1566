//! Celery worker - Main Entry Point
//!
//! Runs a worker with the demo task set against the configured broker.

use celery_worker::broker::{BrokerConnection, MqttConnector};
use celery_worker::config::WorkerConfig;
use celery_worker::error::{sanitize_error_message, TaskError};
use celery_worker::observability::{init_default_logging, metrics::metrics};
use celery_worker::worker::{FailureReport, TaskArgs, TaskExecutor, TaskKwargs};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use tokio::{
    signal,
    time::{sleep, timeout, Duration},
};
use tracing::{error, info, warn};

/// Celery-protocol task worker
#[derive(Parser)]
#[command(name = "celery-worker")]
#[command(about = "Consume Celery task messages and run registered handlers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CELERY_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL, overrides the configuration file
    #[arg(long, env = "CELERY_BROKER_URL")]
    broker_url: Option<String>,

    /// Queue to consume, overrides the configuration file
    #[arg(long)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting celery worker v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_worker(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_error_message(&e.to_string()));
        process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn load_configuration(cli: &Cli) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            WorkerConfig::load_from_file(path)?
        }
        None => {
            let default_paths = ["celery-worker.toml", "config/celery-worker.toml"];
            match default_paths.iter().map(PathBuf::from).find(|p| p.exists()) {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    WorkerConfig::load_from_file(&path)?
                }
                None => {
                    info!("No configuration file found, using defaults");
                    WorkerConfig::default()
                }
            }
        }
    };

    if let Some(url) = &cli.broker_url {
        config.broker.url = url.clone();
    }
    if let Some(queue) = &cli.queue {
        config.broker.queue = queue.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_worker(config: WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        queue = %config.broker.queue,
        "Connecting to broker at {}",
        config.broker.url
    );

    let mut executor = TaskExecutor::connect(MqttConnector, config.broker.clone()).await?;
    register_demo_tasks(&mut executor)?;
    executor.set_failure_sink(log_failure);

    executor.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Worker is running and waiting for tasks...");

    let mut exit_with_error = false;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(executor.connection()) => {
            error!("Broker connection permanently lost, shutting down worker...");
            exit_with_error = true;
        }
    }

    let drain_timeout = config.drain_timeout();
    info!(
        in_flight = executor.in_flight_count(),
        "Waiting up to {}s for running tasks",
        drain_timeout.as_secs()
    );
    if timeout(drain_timeout, executor.when_current_jobs_finished())
        .await
        .is_err()
    {
        warn!(
            in_flight = executor.in_flight_count(),
            "Drain timed out, abandoning running tasks"
        );
    }

    executor.disconnect().await?;
    info!(metrics = ?metrics().snapshot(), "Final worker metrics");

    if exit_with_error {
        return Err("broker connection permanently lost".into());
    }
    Ok(())
}

fn register_demo_tasks(
    executor: &mut TaskExecutor<MqttConnector>,
) -> Result<(), Box<dyn std::error::Error>> {
    executor.register_fn("tasks.add", |args, _kwargs| add(&args))?;
    executor.register_fn("tasks.add_kwargs", |_args, kwargs| {
        Ok(json!(int_arg(&kwargs, "x")? + int_arg(&kwargs, "y")?))
    })?;
    executor.register_async("tasks.add_mixed", |args, kwargs| async move {
        let positional = add(&args)?.as_i64().unwrap_or_default();
        Ok::<_, TaskError>(json!(positional + int_arg(&kwargs, "z").unwrap_or_default()))
    })?;
    executor.register_fn("tasks.error", |_args, _kwargs| {
        Err(TaskError::failed("this task always fails"))
    })?;
    Ok(())
}

fn add(args: &TaskArgs) -> Result<Value, TaskError> {
    args.iter()
        .map(|arg| {
            arg.as_i64()
                .ok_or_else(|| TaskError::invalid_arguments(format!("not an integer: {arg}")))
        })
        .sum::<Result<i64, TaskError>>()
        .map(|sum| json!(sum))
}

fn int_arg(kwargs: &TaskKwargs, key: &str) -> Result<i64, TaskError> {
    kwargs
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| TaskError::invalid_arguments(format!("missing integer argument '{key}'")))
}

fn log_failure(report: FailureReport) {
    error!(
        task_name = %report.task_name,
        task_id = %report.task_id,
        body = %report.body,
        "Task failed permanently: {}",
        sanitize_error_message(&report.error.to_string())
    );
}

fn handle_config_command(
    config: WorkerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolves once the broker connection is gone for good
async fn monitor_connection_health(connection: &BrokerConnection<MqttConnector>) {
    let mut state = connection.subscribe_state();
    loop {
        if connection.is_permanently_disconnected() {
            break;
        }
        if state.changed().await.is_err() {
            // Sender dropped with the connection
            sleep(Duration::from_millis(100)).await;
        }
    }
}
