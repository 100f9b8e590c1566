//! Normalized task invocation model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire encoding a message arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Task metadata embedded in the JSON body
    V1,
    /// Task metadata carried in message headers, body is `[args, kwargs, embed]`
    V2,
}

/// Retry parameters attached to a task by its producer
///
/// Field names follow the producer's camelCase form; snake_case is accepted
/// too, and the camelCase value wins when both are present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RetryPolicyFields")]
pub struct RetryPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    pub interval_start: f64,
    pub interval_max: f64,
    pub interval_step: f64,
}

/// Both spellings of every policy field, resolved into a [`RetryPolicy`]
#[derive(Deserialize)]
struct RetryPolicyFields {
    #[serde(default, rename = "maxRetries")]
    max_retries: Option<u32>,
    #[serde(default, rename = "max_retries")]
    max_retries_snake: Option<u32>,
    #[serde(default, rename = "intervalStart")]
    interval_start: Option<f64>,
    #[serde(default, rename = "interval_start")]
    interval_start_snake: Option<f64>,
    #[serde(default, rename = "intervalMax")]
    interval_max: Option<f64>,
    #[serde(default, rename = "interval_max")]
    interval_max_snake: Option<f64>,
    #[serde(default, rename = "intervalStep")]
    interval_step: Option<f64>,
    #[serde(default, rename = "interval_step")]
    interval_step_snake: Option<f64>,
}

impl From<RetryPolicyFields> for RetryPolicy {
    fn from(fields: RetryPolicyFields) -> Self {
        Self {
            max_retries: fields.max_retries.or(fields.max_retries_snake),
            interval_start: fields.interval_start.or(fields.interval_start_snake).unwrap_or_default(),
            interval_max: fields.interval_max.or(fields.interval_max_snake).unwrap_or_default(),
            interval_step: fields.interval_step.or(fields.interval_step_snake).unwrap_or_default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(interval_start: f64, interval_max: f64, interval_step: f64) -> Self {
        Self {
            max_retries: None,
            interval_start,
            interval_max,
            interval_step,
        }
    }
}

/// Soft and hard time limits in seconds
///
/// Parsed for wire compatibility; the worker does not enforce them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeLimit {
    pub soft: Option<f64>,
    pub hard: Option<f64>,
}

/// Auxiliary task metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskHeaders {
    pub lang: Option<String>,
    pub root_id: Option<String>,
    pub parent_id: Option<String>,
    pub group: Option<String>,
    /// Number of local retries the producer allows
    pub retries: u32,
    pub eta: Option<String>,
    pub expires: Option<String>,
    pub time_limit: TimeLimit,
    pub origin: Option<String>,
    pub shadow: Option<String>,
    pub meth: Option<String>,
    pub argsrepr: Option<String>,
    pub kwargsrepr: Option<String>,
}

/// A delivery normalized into a callable task
///
/// Derived once from an envelope and reused unchanged across local retries.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInvocation {
    pub name: String,
    pub id: String,
    pub protocol: ProtocolVersion,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub embed: Value,
    /// Body as dispatched: `[args, kwargs, embed]`, or the raw payload when opaque
    pub body: Value,
    /// The body did not follow either protocol shape and is handed over as-is
    pub opaque: bool,
    pub headers: TaskHeaders,
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskInvocation {
    /// Positional and keyword arguments handed to the handler
    ///
    /// Opaque payloads arrive as the single positional argument.
    pub fn call_arguments(&self) -> (Vec<Value>, Map<String, Value>) {
        if self.opaque {
            (vec![self.body.clone()], Map::new())
        } else {
            (self.args.clone(), self.kwargs.clone())
        }
    }

    /// Retries the producer allows for this invocation
    pub fn retries_allowed(&self) -> u32 {
        self.headers.retries
    }
}
