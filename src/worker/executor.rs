//! Task executor: registration, dispatch, retries, failure reporting, drain
//!
//! Every delivery becomes its own tokio task, so slow handlers never hold up
//! the consume loop. There is no cap on concurrent executions.

use super::failure::{FailureReport, FailureSinkSlot};
use super::in_flight::{InFlightEntry, InFlightSet};
use super::registry::{handler_async, handler_fn, invoke_guarded, HandlerRegistry, TaskArgs, TaskHandler, TaskKwargs};
use crate::broker::{BrokerConnection, Connector, MessageConsumer, RawMessage};
use crate::config::BrokerSection;
use crate::error::{sanitize_error_message, ProtocolError, TaskError, WorkerError, WorkerResult};
use crate::observability::metrics;
use crate::protocol::{Envelope, ProtocolCodec, TaskInvocation};
use crate::retry::{RetryDecision, RetryScheduler};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Wait applied when a retry policy yields no usable delay
const FALLBACK_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// State shared by the executor and its running dispatches
#[derive(Clone)]
struct ExecutorCore {
    registry: Arc<HandlerRegistry>,
    in_flight: InFlightSet,
    failure_sink: FailureSinkSlot,
}

/// Consumes task messages from one queue and runs registered handlers
pub struct TaskExecutor<C: Connector> {
    connection: BrokerConnection<C>,
    queue: String,
    core: ExecutorCore,
    started: AtomicBool,
}

impl<C: Connector> TaskExecutor<C> {
    /// Executor consuming `queue` over an existing connection
    pub fn new(connection: BrokerConnection<C>, queue: impl Into<String>) -> Self {
        Self {
            connection,
            queue: queue.into(),
            core: ExecutorCore {
                registry: Arc::new(HandlerRegistry::new()),
                in_flight: InFlightSet::new(),
                failure_sink: FailureSinkSlot::default(),
            },
            started: AtomicBool::new(false),
        }
    }

    /// Connect to the configured broker and bind to its queue
    pub async fn connect(connector: C, config: BrokerSection) -> WorkerResult<Self> {
        let queue = config.queue.clone();
        let connection = BrokerConnection::connect(connector, config).await?;
        Ok(Self::new(connection, queue))
    }

    /// Register a handler for `name`
    ///
    /// Only possible before [`start`](Self::start); afterwards the registry is
    /// shared with the consume path and this returns
    /// [`WorkerError::RegistrationClosed`].
    pub fn register(&mut self, name: &str, handler: Arc<dyn TaskHandler>) -> WorkerResult<()> {
        let registry =
            Arc::get_mut(&mut self.core.registry).ok_or(WorkerError::RegistrationClosed)?;
        registry.register(name, handler)?;
        debug!(task_name = %name, "Registered task handler");
        Ok(())
    }

    /// Register a synchronous closure
    pub fn register_fn<F>(&mut self, name: &str, f: F) -> WorkerResult<()>
    where
        F: Fn(TaskArgs, TaskKwargs) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.register(name, handler_fn(f))
    }

    /// Register an async closure
    pub fn register_async<F, Fut>(&mut self, name: &str, f: F) -> WorkerResult<()>
    where
        F: Fn(TaskArgs, TaskKwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, handler_async(f))
    }

    /// Install the failure sink, replacing any previous one
    pub fn set_failure_sink<F>(&self, sink: F)
    where
        F: Fn(FailureReport) + Send + Sync + 'static,
    {
        self.core.failure_sink.set(Arc::new(sink));
    }

    /// Wait for the broker, then consume the configured queue
    ///
    /// Failures are logged and returned; nothing panics.
    pub async fn start(&self) -> WorkerResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(queue = %self.queue, "Executor already started");
            return Ok(());
        }

        let span = crate::lifecycle_span!(phase = "start", queue = %self.queue);
        let result = async {
            self.connection.is_ready().await?;

            let names = self.core.registry.names();
            info!(tasks = ?names, "Registered tasks: {}", names.join(", "));

            let consumer = Arc::new(Dispatcher {
                core: self.core.clone(),
            });
            self.connection.subscribe(&self.queue, consumer).await?;
            info!("Worker consuming from queue '{}'", self.queue);
            Ok::<(), WorkerError>(())
        }
        .instrument(span)
        .await;

        if let Err(e) = &result {
            error!(error = %sanitize_error_message(&e.to_string()), "Worker failed to start");
            self.started.store(false, Ordering::Release);
        }
        result
    }

    /// Decode and run one envelope to its terminal outcome
    ///
    /// Returns the handler result, or `None` when the task failed for good
    /// (the failure sink has been called by then).
    pub async fn dispatch(&self, envelope: Envelope) -> Option<Value> {
        match self.core.begin(envelope) {
            Some(dispatch) => dispatch.run().await,
            None => None,
        }
    }

    /// Resolves once no task is running or waiting to be retried
    pub fn when_current_jobs_finished(&self) -> impl Future<Output = ()> + Send + 'static {
        let in_flight = self.core.in_flight.clone();
        async move { in_flight.drained().await }
    }

    /// Not supported: consumption cannot be stopped without disconnecting
    pub fn stop(&self) -> WorkerResult<()> {
        Err(WorkerError::NotImplemented {
            operation: "TaskExecutor::stop",
        })
    }

    pub async fn disconnect(&self) -> WorkerResult<()> {
        self.connection.disconnect().await
    }

    pub fn in_flight_count(&self) -> usize {
        self.core.in_flight.len()
    }

    pub fn registered_tasks(&self) -> Vec<String> {
        self.core.registry.names()
    }

    pub fn connection(&self) -> &BrokerConnection<C> {
        &self.connection
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl ExecutorCore {
    /// Decode, look up the handler and enter the in-flight set
    ///
    /// Synchronous so the in-flight entry exists before anything else runs.
    fn begin(&self, envelope: Envelope) -> Option<Dispatch> {
        metrics().task_received();

        let invocation = match ProtocolCodec::decode(&envelope) {
            Ok(invocation) => invocation,
            Err(e) => {
                self.reject(&envelope, e);
                return None;
            }
        };

        let Some(handler) = self.registry.get(&invocation.name) else {
            let err = WorkerError::MissingHandler {
                name: invocation.name.clone(),
            };
            error!(task_name = %invocation.name, task_id = %invocation.id, "{}", err);
            self.report(FailureReport {
                task_name: invocation.name,
                task_id: invocation.id,
                body: envelope.body_for_report(),
                error: err,
                envelope: Some(envelope),
            });
            return None;
        };

        metrics().task_started();
        Some(Dispatch {
            entry: self.in_flight.enter(),
            core: self.clone(),
            handler,
            invocation,
            envelope,
        })
    }

    fn reject(&self, envelope: &Envelope, error: ProtocolError) {
        warn!(error = %error, "Rejecting undecodable task message");
        metrics().task_rejected();
        self.report(FailureReport {
            task_name: envelope.task_header().unwrap_or_default().to_string(),
            task_id: envelope.id_header().unwrap_or_default().to_string(),
            body: envelope.body_for_report(),
            error: error.into(),
            envelope: Some(envelope.clone()),
        });
    }

    fn report(&self, report: FailureReport) {
        let (task_name, task_id) = (report.task_name.clone(), report.task_id.clone());
        if !self.failure_sink.report(report) {
            debug!(task_name = %task_name, task_id = %task_id, "No failure sink installed, failure dropped");
        }
    }
}

/// One accepted invocation on its way to a terminal outcome
struct Dispatch {
    core: ExecutorCore,
    handler: Arc<dyn TaskHandler>,
    invocation: TaskInvocation,
    envelope: Envelope,
    // Held through retry delays; dropping it is the terminal transition
    entry: InFlightEntry,
}

impl Dispatch {
    async fn run(self) -> Option<Value> {
        let span = crate::task_span!(
            task_name = %self.invocation.name,
            task_id = %self.invocation.id,
            in_flight_handle = self.entry.handle()
        );
        self.execute().instrument(span).await
    }

    async fn execute(self) -> Option<Value> {
        let Dispatch {
            core,
            handler,
            invocation,
            envelope,
            entry,
        } = self;
        let (args, kwargs) = invocation.call_arguments();
        let retries_allowed = invocation.retries_allowed();

        info!(
            args = ?args,
            kwargs = ?kwargs,
            protocol = ?invocation.protocol,
            "Received task {}[{}]",
            invocation.name,
            invocation.id
        );
        let time_limit = invocation.headers.time_limit;
        if time_limit.soft.is_some() || time_limit.hard.is_some() {
            debug!(soft = ?time_limit.soft, hard = ?time_limit.hard, "Task time limits are not enforced");
        }

        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let outcome = invoke_guarded(handler.as_ref(), args.clone(), kwargs.clone()).await;
            let elapsed = started.elapsed();

            let error = match outcome {
                Ok(value) => {
                    metrics().task_succeeded(elapsed);
                    info!(
                        duration_s = elapsed.as_secs_f64(),
                        "Task {}[{}] succeeded in {}s: {}",
                        invocation.name,
                        invocation.id,
                        elapsed.as_secs_f64(),
                        value
                    );
                    drop(entry);
                    metrics().task_finished();
                    return Some(value);
                }
                Err(error) => error,
            };

            metrics().task_failed(elapsed);
            warn!(
                attempt,
                error = %sanitize_error_message(&error.to_string()),
                "Task {}[{}] failed",
                invocation.name,
                invocation.id
            );

            match RetryScheduler::decide(retries_allowed, attempt, invocation.retry_policy.as_ref()) {
                RetryDecision::Retry { attempt: next, delay } => {
                    let delay = if delay.is_zero() { FALLBACK_RETRY_DELAY } else { delay };
                    metrics().task_retried();
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        "Retrying task {}[{}] in {}ms (Retry {}/{})",
                        invocation.name,
                        invocation.id,
                        delay.as_millis(),
                        next,
                        retries_allowed
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::GiveUp { attempts } => {
                    if retries_allowed > 0 {
                        error!(
                            attempts,
                            "Task {}[{}] failed after exhausting {} retries",
                            invocation.name,
                            invocation.id,
                            retries_allowed
                        );
                    }
                    drop(entry);
                    metrics().task_finished();
                    core.report(FailureReport {
                        task_name: invocation.name,
                        task_id: invocation.id,
                        body: envelope.body_for_report(),
                        error: WorkerError::TaskExecution(error),
                        envelope: Some(envelope),
                    });
                    return None;
                }
            }
        }
    }
}

/// Bridges broker deliveries into the executor
struct Dispatcher {
    core: ExecutorCore,
}

impl MessageConsumer for Dispatcher {
    fn on_message(&self, envelope: Envelope) {
        if let Some(dispatch) = self.core.begin(envelope) {
            tokio::spawn(async move {
                dispatch.run().await;
            });
        }
    }

    fn on_rejected(&self, message: RawMessage, error: ProtocolError) {
        let header = |key: &str| {
            message
                .properties
                .headers
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let body = serde_json::from_slice(&message.body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&message.body).into_owned())
        });

        self.core.report(FailureReport {
            task_name: header("task"),
            task_id: header("id"),
            body,
            error: error.into(),
            envelope: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RetryPolicy;
    use crate::testing::{memory_broker_config, MemoryBroker};
    use serde_json::{json, Map};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn executor(broker: &MemoryBroker) -> TaskExecutor<crate::testing::MemoryConnector> {
        TaskExecutor::connect(broker.connector(), memory_broker_config())
            .await
            .unwrap()
    }

    fn v2_envelope(task: &str, id: &str, body: Value, retries: u32) -> Envelope {
        let mut headers = Map::new();
        headers.insert("task".to_string(), json!(task));
        headers.insert("id".to_string(), json!(id));
        headers.insert("retries".to_string(), json!(retries));
        Envelope::json(&body, headers)
    }

    fn collect_failures(executor: &TaskExecutor<crate::testing::MemoryConnector>) -> Arc<Mutex<Vec<FailureReport>>> {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        executor.set_failure_sink(move |report| sink.lock().unwrap().push(report));
        failures
    }

    #[tokio::test]
    async fn test_dispatch_add() {
        let broker = MemoryBroker::new();
        let mut executor = executor(&broker).await;
        executor
            .register_fn("tasks.add", |args, _kwargs| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            })
            .unwrap();

        let result = executor
            .dispatch(v2_envelope("tasks.add", "X", json!([[1, 2], {}, {}]), 0))
            .await;
        assert_eq!(result, Some(json!(3)));
        assert_eq!(executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_kwargs_are_passed_through() {
        let broker = MemoryBroker::new();
        let mut executor = executor(&broker).await;
        executor
            .register_fn("tasks.add_kwargs", |_args, kwargs| {
                let a = kwargs.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = kwargs.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            })
            .unwrap();

        let result = executor
            .dispatch(v2_envelope(
                "tasks.add_kwargs",
                "K",
                json!([[], {"a": 5, "b": 6}, {}]),
                0,
            ))
            .await;
        assert_eq!(result, Some(json!(11)));
    }

    #[tokio::test]
    async fn test_missing_handler_is_reported_per_message() {
        let broker = MemoryBroker::new();
        let executor = executor(&broker).await;
        let failures = collect_failures(&executor);

        let result = executor
            .dispatch(v2_envelope("tasks.unknown", "M", json!([[], {}, {}]), 0))
            .await;
        assert_eq!(result, None);
        assert_eq!(executor.in_flight_count(), 0);

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, WorkerError::MissingHandler { .. }));
        assert_eq!(failures[0].task_id, "M");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_reports_once() {
        let broker = MemoryBroker::new();
        let mut executor = executor(&broker).await;
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        executor
            .register_fn("tasks.error", move |_args, _kwargs| {
                *counter.lock().unwrap() += 1;
                Err(TaskError::failed("always"))
            })
            .unwrap();
        let failures = collect_failures(&executor);

        let policy = json!({"retryPolicy": RetryPolicy::new(0.0, 1.0, 0.1)});
        let result = executor
            .dispatch(v2_envelope("tasks.error", "R", json!([[], {}, policy]), 2))
            .await;

        assert_eq!(result, None);
        assert_eq!(*calls.lock().unwrap(), 3);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, "R");
        assert!(matches!(failures[0].error, WorkerError::TaskExecution(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_policy_retries_after_fallback_delay() {
        let broker = MemoryBroker::new();
        let mut executor = executor(&broker).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&calls);
        executor
            .register_fn("tasks.error", move |_args, _kwargs| {
                recorder.lock().unwrap().push(Instant::now());
                Err(TaskError::failed("always"))
            })
            .unwrap();
        let failures = collect_failures(&executor);

        let started = Instant::now();
        executor
            .dispatch(v2_envelope("tasks.error", "E", json!([[], {}, {"retryPolicy": {}}]), 3))
            .await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= FALLBACK_RETRY_DELAY);
        }
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_policy_means_no_retry() {
        let broker = MemoryBroker::new();
        let mut executor = executor(&broker).await;
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        executor
            .register_fn("tasks.error", move |_args, _kwargs| {
                *counter.lock().unwrap() += 1;
                Err(TaskError::failed("nope"))
            })
            .unwrap();
        let failures = collect_failures(&executor);

        executor
            .dispatch(v2_envelope("tasks.error", "N", json!([[], {}, {}]), 5))
            .await;
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_reported() {
        let broker = MemoryBroker::new();
        let executor = executor(&broker).await;
        let failures = collect_failures(&executor);

        let envelope = Envelope::json(&json!({"args": [1]}), Map::new());
        assert_eq!(executor.dispatch(envelope).await, None);
        assert_eq!(executor.in_flight_count(), 0);

        let failures = failures.lock().unwrap();
        assert!(matches!(
            failures[0].error,
            WorkerError::Protocol(ProtocolError::MissingTaskName)
        ));
    }

    #[tokio::test]
    async fn test_registration_closes_after_start() {
        let broker = MemoryBroker::new();
        let mut executor = executor(&broker).await;
        executor
            .register_fn("tasks.add", |_args, _kwargs| Ok(json!(0)))
            .unwrap();
        assert!(matches!(
            executor.register_fn("tasks.add", |_args, _kwargs| Ok(json!(0))),
            Err(WorkerError::DuplicateHandler { .. })
        ));

        executor.start().await.unwrap();
        assert!(matches!(
            executor.register_fn("tasks.other", |_args, _kwargs| Ok(json!(0))),
            Err(WorkerError::RegistrationClosed)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_not_implemented() {
        let broker = MemoryBroker::new();
        let executor = executor(&broker).await;
        assert!(matches!(
            executor.stop(),
            Err(WorkerError::NotImplemented { .. })
        ));
        assert!(matches!(
            executor.stop(),
            Err(WorkerError::NotImplemented { .. })
        ));
    }

    #[tokio::test]
    async fn test_drain_with_nothing_in_flight() {
        let broker = MemoryBroker::new();
        let executor = executor(&broker).await;
        tokio::time::timeout(Duration::from_millis(100), executor.when_current_jobs_finished())
            .await
            .expect("nothing in flight");
    }
}
