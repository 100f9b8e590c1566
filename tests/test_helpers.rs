//! Shared helpers for integration tests

#![allow(dead_code)]

use celery_worker::broker::BrokerConnection;
use celery_worker::testing::{memory_broker_config, MemoryBroker, MemoryConnector};
use celery_worker::worker::{FailureReport, TaskExecutor};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub type MemoryExecutor = TaskExecutor<MemoryConnector>;

/// Executor on a fresh in-memory broker, bound to the `celery` queue
pub async fn test_executor() -> (MemoryBroker, MemoryExecutor) {
    let broker = MemoryBroker::new();
    let executor = TaskExecutor::connect(broker.connector(), memory_broker_config())
        .await
        .unwrap();
    (broker, executor)
}

pub async fn test_connection(broker: &MemoryBroker) -> BrokerConnection<MemoryConnector> {
    BrokerConnection::connect(broker.connector(), memory_broker_config())
        .await
        .unwrap()
}

/// Protocol v2 headers for a task message
pub fn v2_headers(task: &str, id: &str, retries: u32) -> Map<String, Value> {
    let mut headers = Map::new();
    headers.insert("lang".to_string(), json!("py"));
    headers.insert("task".to_string(), json!(task));
    headers.insert("id".to_string(), json!(id));
    headers.insert("root_id".to_string(), json!(id));
    headers.insert("retries".to_string(), json!(retries));
    headers.insert("timelimit".to_string(), json!([null, null]));
    headers
}

/// Publish a protocol v2 task onto the executor's queue
pub async fn publish_v2(executor: &MemoryExecutor, task: &str, id: &str, body: Value, retries: u32) {
    executor
        .connection()
        .publish(
            &body,
            "celery",
            executor.queue(),
            v2_headers(task, id, retries),
            Map::new(),
        )
        .await
        .unwrap();
}

/// Failure sink forwarding every report into a channel
pub fn failure_channel(executor: &MemoryExecutor) -> mpsc::UnboundedReceiver<FailureReport> {
    let (tx, rx) = mpsc::unbounded_channel();
    executor.set_failure_sink(move |report| {
        let _ = tx.send(report);
    });
    rx
}

/// Poll `condition` until it holds, failing the test after `limit`
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Await `future`, failing the test after `limit`
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .expect("timed out")
}
