//! Celery Task Publishing Utility
//!
//! Publishes one task message onto a queue, the way a Celery producer would.
//!
//! ## Usage
//!
//! ```bash
//! # Positional arguments
//! send-task --task tasks.add --args '[1, 2]'
//!
//! # Keyword arguments
//! send-task --task tasks.add_kwargs --kwargs '{"x": 1, "y": 2}'
//!
//! # Failing task with two retries, one second apart
//! send-task --task tasks.error --retries 2 --retry-policy '{"interval_start": 1, "interval_max": 1, "interval_step": 1}'
//!
//! # Legacy protocol v1 body
//! send-task --task tasks.add --args '[1, 2]' --protocol 1
//! ```

use celery_worker::broker::{BrokerConnection, MqttConnector};
use celery_worker::config::{BrokerOptions, BrokerSection};
use celery_worker::observability::init_default_logging;
use celery_worker::protocol::{OutgoingTask, ProtocolCodec, RetryPolicy};
use clap::Parser;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "send-task",
    about = "Publish a Celery task message onto a queue",
    long_about = "Publishes one protocol v2 (or v1) task message so a running worker can pick it up."
)]
struct Args {
    /// Registered task name
    #[arg(long, required = true)]
    task: String,

    /// Positional arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,

    /// Keyword arguments as a JSON object
    #[arg(long, default_value = "{}")]
    kwargs: String,

    /// Retries the worker may attempt
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Retry policy as JSON (interval_start, interval_max, interval_step)
    #[arg(long)]
    retry_policy: Option<String>,

    /// Message protocol version (1 or 2)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=2))]
    protocol: u8,

    /// Broker URL
    #[arg(long, env = "CELERY_BROKER_URL", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Destination queue
    #[arg(long, default_value = "celery")]
    queue: String,

    /// Deployment exchange
    #[arg(long, default_value = "default")]
    exchange: String,
}

fn parse_json<T: serde::de::DeserializeOwned>(
    flag: &str,
    raw: &str,
) -> Result<T, Box<dyn std::error::Error>> {
    serde_json::from_str(raw).map_err(|e| format!("invalid --{flag}: {e}").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_default_logging();

    let positional: Vec<Value> = parse_json("args", &args.args)?;
    let kwargs: Map<String, Value> = parse_json("kwargs", &args.kwargs)?;

    let mut task = OutgoingTask::new(args.task.clone(), positional).with_kwargs(kwargs);
    if let Some(raw) = &args.retry_policy {
        let policy: RetryPolicy = parse_json("retry-policy", raw)?;
        task = task.with_retries(args.retries, policy);
    } else {
        task.retries = args.retries;
    }
    task.origin = Some(format!("send-task@{}", std::process::id()));

    let (headers, body) = match args.protocol {
        1 => (Map::new(), ProtocolCodec::encode_v1(&task)),
        _ => ProtocolCodec::encode_v2(&task),
    };

    let config = BrokerSection {
        url: args.broker_url.clone(),
        queue: args.queue.clone(),
        exchange: args.exchange.clone(),
        max_retries: 3,
        retry_delay_ms: 1_000,
        // A publisher has nothing for the broker to keep between runs
        options: BrokerOptions {
            clean_start: true,
            ..Default::default()
        },
        ..Default::default()
    };
    config.validate()?;

    let connection = BrokerConnection::connect(MqttConnector, config).await?;
    connection.is_ready().await?;

    let mut properties = Map::new();
    properties.insert("correlationId".to_string(), json!(task.id));
    connection
        .publish(&body, &args.exchange, &args.queue, headers, properties)
        .await?;

    info!(
        task_name = %task.name,
        task_id = %task.id,
        queue = %args.queue,
        "Sent task {}[{}]",
        task.name,
        task.id
    );
    println!("{}", task.id);

    connection.disconnect().await?;
    Ok(())
}
