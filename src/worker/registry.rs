//! Task handler registry
//!
//! Handlers are registered by task name before the executor starts. Sync
//! closures, async closures and custom [`TaskHandler`] implementations all
//! end up behind the same trait object, and panics in any of them come back
//! as [`TaskError::Panicked`].

use crate::error::{TaskError, WorkerError, WorkerResult};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Positional arguments of a task call
pub type TaskArgs = Vec<Value>;
/// Keyword arguments of a task call
pub type TaskKwargs = Map<String, Value>;

/// A callable task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task with positional arguments and the keyword mapping
    async fn invoke(&self, args: TaskArgs, kwargs: TaskKwargs) -> Result<Value, TaskError>;
}

/// Adapter for synchronous closures
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(TaskArgs, TaskKwargs) -> Result<Value, TaskError> + Send + Sync,
{
    async fn invoke(&self, args: TaskArgs, kwargs: TaskKwargs) -> Result<Value, TaskError> {
        (self.0)(args, kwargs)
    }
}

/// Adapter for closures returning a future
pub struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFnHandler<F>
where
    F: Fn(TaskArgs, TaskKwargs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn invoke(&self, args: TaskArgs, kwargs: TaskKwargs) -> Result<Value, TaskError> {
        (self.0)(args, kwargs).await
    }
}

/// Invoke a handler, turning a panic into a task error
///
/// Panics raised while building the future and while polling it are both caught.
pub async fn invoke_guarded(
    handler: &dyn TaskHandler,
    args: TaskArgs,
    kwargs: TaskKwargs,
) -> Result<Value, TaskError> {
    let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(args, kwargs)));
    let future = match call {
        Ok(future) => future,
        Err(payload) => return Err(panic_error(payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(payload)),
    }
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> TaskError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    TaskError::Panicked { message }
}

/// Task name to handler mapping with unique keys
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`
    ///
    /// Fails with [`WorkerError::InvalidHandler`] for a blank name and with
    /// [`WorkerError::DuplicateHandler`] if the name is taken.
    pub fn register(&mut self, name: &str, handler: Arc<dyn TaskHandler>) -> WorkerResult<()> {
        if name.trim().is_empty() {
            return Err(WorkerError::invalid_handler("task name must not be empty"));
        }
        if self.handlers.contains_key(name) {
            return Err(WorkerError::DuplicateHandler {
                name: name.to_string(),
            });
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskArgs, TaskKwargs) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap an async closure as a handler
pub fn handler_async<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskArgs, TaskKwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}
