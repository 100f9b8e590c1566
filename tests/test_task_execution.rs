//! End-to-end task execution over the in-memory broker
//!
//! Messages go through the full path: publish, delivery, ack, decode,
//! dispatch, retry and failure reporting.

mod test_helpers;

use celery_worker::error::{ProtocolError, TaskError, WorkerError};
use celery_worker::protocol::{OutgoingTask, ProtocolCodec, RetryPolicy};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[tokio::test]
async fn test_add_task_runs_and_drains() {
    let (_broker, mut executor) = test_executor().await;
    let (tx, mut results) = mpsc::unbounded_channel();
    executor
        .register_fn("tasks.add", move |args, _kwargs| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            let _ = tx.send(sum);
            Ok(json!(sum))
        })
        .unwrap();
    executor.start().await.unwrap();

    publish_v2(&executor, "tasks.add", "X", json!([[1, 2], {}, {}]), 0).await;

    assert_eq!(within(Duration::from_secs(5), results.recv()).await, Some(3));
    within(Duration::from_secs(5), executor.when_current_jobs_finished()).await;
    assert_eq!(executor.in_flight_count(), 0);
}

#[tokio::test]
async fn test_v1_message_is_dispatched() {
    let (_broker, mut executor) = test_executor().await;
    let (tx, mut results) = mpsc::unbounded_channel();
    executor
        .register_fn("tasks.add_kwargs", move |args, kwargs| {
            let _ = tx.send((args, kwargs));
            Ok(Value::Null)
        })
        .unwrap();
    executor.start().await.unwrap();

    let mut kwargs = Map::new();
    kwargs.insert("x".to_string(), json!(4));
    let task = OutgoingTask::new("tasks.add_kwargs", vec![json!(1)]).with_kwargs(kwargs.clone());
    executor
        .connection()
        .publish(
            &ProtocolCodec::encode_v1(&task),
            "celery",
            "celery",
            Map::new(),
            Map::new(),
        )
        .await
        .unwrap();

    let (args, received) = within(Duration::from_secs(5), results.recv())
        .await
        .unwrap();
    assert_eq!(args, vec![json!(1)]);
    assert_eq!(received, kwargs);
}

#[tokio::test]
async fn test_async_handler_receives_args_and_kwargs() {
    let (_broker, mut executor) = test_executor().await;
    let (tx, mut results) = mpsc::unbounded_channel();
    executor
        .register_async("tasks.add_mixed", move |args, kwargs| {
            let tx = tx.clone();
            async move {
                tokio::task::yield_now().await;
                let total = args.iter().filter_map(Value::as_i64).sum::<i64>()
                    + kwargs.get("z").and_then(Value::as_i64).unwrap_or(0);
                let _ = tx.send(total);
                Ok::<_, TaskError>(json!(total))
            }
        })
        .unwrap();
    executor.start().await.unwrap();

    publish_v2(&executor, "tasks.add_mixed", "M", json!([[1, 2], {"z": 3}, {}]), 0).await;
    assert_eq!(within(Duration::from_secs(5), results.recv()).await, Some(6));
}

#[tokio::test(start_paused = true)]
async fn test_failing_task_retries_then_reports_once() {
    let (_broker, mut executor) = test_executor().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    executor
        .register_fn("tasks.error", move |_args, _kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::failed("always fails"))
        })
        .unwrap();
    let mut failures = failure_channel(&executor);
    executor.start().await.unwrap();

    let embed = json!({"retryPolicy": RetryPolicy::new(0.0, 1.0, 0.1)});
    publish_v2(&executor, "tasks.error", "R-1", json!([[], {}, embed]), 2).await;

    let report = within(Duration::from_secs(30), failures.recv())
        .await
        .unwrap();
    assert_eq!(report.task_id, "R-1");
    assert_eq!(report.task_name, "tasks.error");
    assert!(matches!(report.error, WorkerError::TaskExecution(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    within(Duration::from_secs(5), executor.when_current_jobs_finished()).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(failures.try_recv().is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_empty_retry_policy_still_waits_between_attempts() {
    let (_broker, mut executor) = test_executor().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    executor
        .register_fn("tasks.error", move |_args, _kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::failed("always fails"))
        })
        .unwrap();
    let mut failures = failure_channel(&executor);
    executor.start().await.unwrap();

    let started = Instant::now();
    publish_v2(&executor, "tasks.error", "E-1", json!([[], {}, {"retryPolicy": {}}]), 3).await;

    let report = within(Duration::from_secs(30), failures.recv())
        .await
        .unwrap();
    assert_eq!(report.task_id, "E-1");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // Three retries, one second apart
    assert!(started.elapsed() >= Duration::from_secs(3), "took {:?}", started.elapsed());
}

#[tokio::test(start_paused = true)]
async fn test_drain_waits_through_retry_delay() {
    let (_broker, mut executor) = test_executor().await;
    let (tx, mut calls) = mpsc::unbounded_channel();
    executor
        .register_fn("tasks.flaky", move |_args, _kwargs| {
            let _ = tx.send(());
            static ATTEMPTS: AtomicU32 = AtomicU32::new(0);
            if ATTEMPTS.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskError::failed("first attempt fails"))
            } else {
                Ok(json!("ok"))
            }
        })
        .unwrap();
    executor.start().await.unwrap();

    let embed = json!({"retryPolicy": RetryPolicy::new(5.0, 10.0, 5.0)});
    publish_v2(&executor, "tasks.flaky", "D", json!([[], {}, embed]), 1).await;
    within(Duration::from_secs(1), calls.recv()).await;

    // First retry waits 5s; the drain must not resolve before it
    let drained = tokio::time::timeout(
        Duration::from_secs(4),
        executor.when_current_jobs_finished(),
    )
    .await;
    assert!(drained.is_err());
    assert_eq!(executor.in_flight_count(), 1);

    within(Duration::from_secs(10), executor.when_current_jobs_finished()).await;
    within(Duration::from_secs(1), calls.recv()).await;
    assert_eq!(executor.in_flight_count(), 0);
}

#[tokio::test]
async fn test_unsupported_content_type_is_reported_not_dispatched() {
    let (broker, mut executor) = test_executor().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    executor
        .register_fn("tasks.add", move |_args, _kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .unwrap();
    let mut failures = failure_channel(&executor);
    executor.start().await.unwrap();

    broker.deliver_raw(
        "celery",
        "<task/>",
        Some("application/xml"),
        Some("utf-8"),
        v2_headers("tasks.add", "XML", 0),
    );

    let report = within(Duration::from_secs(5), failures.recv())
        .await
        .unwrap();
    assert!(matches!(
        report.error,
        WorkerError::Protocol(ProtocolError::UnsupportedContentType(_))
    ));
    assert_eq!(report.task_id, "XML");
    assert!(report.envelope.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(executor.in_flight_count(), 0);
    // Acked on receipt even though it was rejected
    assert_eq!(broker.acked().len(), 1);
}

#[tokio::test]
async fn test_unsupported_encoding_is_reported() {
    let (broker, executor) = test_executor().await;
    let mut failures = failure_channel(&executor);
    executor.start().await.unwrap();

    broker.deliver_raw(
        "celery",
        "[[], {}, {}]",
        Some("application/json"),
        Some("binary"),
        v2_headers("tasks.add", "BIN", 0),
    );

    let report = within(Duration::from_secs(5), failures.recv())
        .await
        .unwrap();
    assert!(matches!(
        report.error,
        WorkerError::Protocol(ProtocolError::UnsupportedContentEncoding(_))
    ));
}

#[tokio::test]
async fn test_unknown_task_fails_only_that_message() {
    let (_broker, mut executor) = test_executor().await;
    let (tx, mut results) = mpsc::unbounded_channel();
    executor
        .register_fn("tasks.add", move |args, _kwargs| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            let _ = tx.send(sum);
            Ok(json!(sum))
        })
        .unwrap();
    let mut failures = failure_channel(&executor);
    executor.start().await.unwrap();

    publish_v2(&executor, "tasks.nope", "U", json!([[], {}, {}]), 0).await;
    publish_v2(&executor, "tasks.add", "A", json!([[2, 2], {}, {}]), 0).await;

    let report = within(Duration::from_secs(5), failures.recv())
        .await
        .unwrap();
    assert!(matches!(report.error, WorkerError::MissingHandler { ref name } if name == "tasks.nope"));
    assert_eq!(within(Duration::from_secs(5), results.recv()).await, Some(4));
}

#[tokio::test]
async fn test_handlers_run_concurrently() {
    let (_broker, mut executor) = test_executor().await;
    let release = Arc::new(tokio::sync::Notify::new());
    let (tx, mut started) = mpsc::unbounded_channel();
    let gate = Arc::clone(&release);
    executor
        .register_async("tasks.block", move |args, _kwargs| {
            let gate = Arc::clone(&gate);
            let tx = tx.clone();
            async move {
                let released = gate.notified();
                let _ = tx.send(args.first().cloned().unwrap_or(Value::Null));
                released.await;
                Ok::<_, TaskError>(Value::Null)
            }
        })
        .unwrap();
    executor.start().await.unwrap();

    for i in 0..3 {
        publish_v2(&executor, "tasks.block", &format!("B{i}"), json!([[i], {}, {}]), 0).await;
    }
    for _ in 0..3 {
        within(Duration::from_secs(5), started.recv()).await;
    }
    assert_eq!(executor.in_flight_count(), 3);

    release.notify_waiters();
    within(Duration::from_secs(5), executor.when_current_jobs_finished()).await;
}

#[tokio::test]
async fn test_publish_applies_default_properties() {
    let (broker, executor) = test_executor().await;

    let mut properties = Map::new();
    properties.insert("priority".to_string(), json!(5));
    properties.insert("contentType".to_string(), json!("text/plain"));
    executor
        .connection()
        .publish(
            &json!([[1], {}, {}]),
            "celery",
            "other",
            v2_headers("tasks.add", "P", 0),
            properties,
        )
        .await
        .unwrap();

    assert!(broker.has_queue("other"));
    let published = broker.published();
    let (exchange, routing_key, message) = &published[0];
    assert_eq!(exchange, "celery");
    assert_eq!(routing_key, "other");
    assert_eq!(message.properties.delivery_mode, Some(2));
    assert_eq!(message.properties.priority, Some(5));
    assert_eq!(
        message.properties.content_type.as_deref(),
        Some("application/json")
    );
    assert_eq!(message.properties.headers["id"], json!("P"));
}
