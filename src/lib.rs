//! Celery Worker - Rust Implementation
//!
//! A worker runtime that consumes Celery-protocol task messages from a
//! message broker and runs them against registered handlers.
//!
//! # Overview
//!
//! This crate provides:
//! - Broker connectivity with bounded connect retries and automatic reconnection
//! - Decoding of Celery protocol v1 and v2 task messages
//! - Per-task retry scheduling driven by the producer's retry policy
//! - Task dispatch with in-flight tracking for graceful drain
//!
//! # Quick Start
//!
//! ```rust
//! use celery_worker::testing::{memory_broker_config, MemoryBroker};
//! use celery_worker::TaskExecutor;
//! use serde_json::{json, Value};
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let mut executor = TaskExecutor::connect(broker.connector(), memory_broker_config()).await?;
//!
//! executor.register_fn("tasks.add", |args, _kwargs| {
//!     Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
//! })?;
//! executor.set_failure_sink(|report| eprintln!("task {} failed: {}", report.task_id, report.error));
//! executor.start().await?;
//!
//! executor.when_current_jobs_finished().await;
//! executor.disconnect().await?;
//! # Ok::<(), celery_worker::WorkerError>(())
//! # });
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod retry;
pub mod testing;
pub mod worker;

pub use broker::{BrokerConnection, ConnectionState, MqttConnector};
pub use config::{BrokerSection, WorkerConfig};
pub use error::{ProtocolError, TaskError, TransportError, WorkerError, WorkerResult};
pub use protocol::{Envelope, OutgoingTask, ProtocolCodec, RetryPolicy, TaskInvocation};
pub use retry::{RetryDecision, RetryScheduler};
pub use worker::{FailureReport, TaskExecutor, TaskHandler};
