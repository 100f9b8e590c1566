//! Terminal failure reporting

use crate::error::WorkerError;
use crate::protocol::Envelope;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A task that will not be retried again, or a delivery that never became one
#[derive(Debug)]
pub struct FailureReport {
    /// Empty when the delivery carried no task name
    pub task_name: String,
    pub task_id: String,
    /// Decoded body as received; a string when it was not valid JSON
    pub body: Value,
    pub error: WorkerError,
    /// Missing only for deliveries rejected before an envelope could be built
    pub envelope: Option<Envelope>,
}

/// Callback receiving terminal failures
pub type FailureSink = Arc<dyn Fn(FailureReport) + Send + Sync>;

/// Single replaceable sink slot
#[derive(Default, Clone)]
pub struct FailureSinkSlot {
    sink: Arc<RwLock<Option<FailureSink>>>,
}

impl FailureSinkSlot {
    /// Install `sink`, replacing any previous one
    pub fn set(&self, sink: FailureSink) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    pub fn is_set(&self) -> bool {
        self.sink.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Hand a report to the sink; returns false if none is installed
    pub fn report(&self, report: FailureReport) -> bool {
        // Clone out of the lock so the sink may replace itself
        let sink = self.sink.read().ok().and_then(|slot| slot.clone());
        match sink {
            Some(sink) => {
                sink(report);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for FailureSinkSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureSinkSlot")
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn report(id: &str) -> FailureReport {
        FailureReport {
            task_name: "tasks.error".to_string(),
            task_id: id.to_string(),
            body: Value::Null,
            error: TaskError::failed("boom").into(),
            envelope: None,
        }
    }

    #[test]
    fn test_report_without_sink() {
        let slot = FailureSinkSlot::default();
        assert!(!slot.is_set());
        assert!(!slot.report(report("1")));
    }

    #[test]
    fn test_later_sink_replaces_earlier() {
        let slot = FailureSinkSlot::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        slot.set(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        slot.set(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(slot.report(report("1")));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
