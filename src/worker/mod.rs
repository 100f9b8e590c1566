//! Task execution
//!
//! - [`registry`] - task name to handler mapping
//! - [`executor`] - [`TaskExecutor`]: dispatch, retries, drain
//! - [`in_flight`] - bookkeeping behind graceful drain
//! - [`failure`] - terminal failure reports

pub mod executor;
pub mod failure;
pub mod in_flight;
pub mod registry;

pub use executor::TaskExecutor;
pub use failure::{FailureReport, FailureSink, FailureSinkSlot};
pub use in_flight::{InFlightEntry, InFlightSet};
pub use registry::{
    handler_async, handler_fn, invoke_guarded, AsyncFnHandler, FnHandler, HandlerRegistry,
    TaskArgs, TaskHandler, TaskKwargs,
};
