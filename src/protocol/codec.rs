//! Protocol codec: normalizes deliveries into task invocations
//!
//! Two wire encodings are understood:
//!
//! - **v2**: the `task` header is present; the body is `[args, kwargs, embed]`
//!   and all metadata lives in headers.
//! - **v1**: no `task` header; the body is one JSON object carrying the task
//!   name, id, args, kwargs and the remaining metadata.
//!
//! Bodies that follow neither shape are forwarded untouched as an opaque
//! payload, with metadata taken from the envelope headers.
//!
//! Decoding is pure: no I/O, and the same envelope always yields the same
//! invocation.

use super::envelope::Envelope;
use super::invocation::{
    ProtocolVersion, RetryPolicy, TaskHeaders, TaskInvocation, TimeLimit,
};
use crate::error::ProtocolError;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Metadata fields shared by v2 headers and v1 bodies
///
/// Producers spell the lineage ids either way, sometimes both at once; the
/// snake_case spelling wins.
#[derive(Debug, Default, Deserialize)]
struct WireMeta {
    lang: Option<String>,
    id: Option<String>,
    root_id: Option<String>,
    #[serde(rename = "rootId")]
    root_id_camel: Option<String>,
    parent_id: Option<String>,
    #[serde(rename = "parentId")]
    parent_id_camel: Option<String>,
    group: Option<String>,
    meth: Option<String>,
    shadow: Option<String>,
    eta: Option<String>,
    expires: Option<String>,
    retries: Option<u32>,
    timelimit: Option<(Option<f64>, Option<f64>)>,
    argsrepr: Option<String>,
    kwargsrepr: Option<String>,
    origin: Option<String>,
}

impl WireMeta {
    fn from_map(map: &Map<String, Value>) -> Result<Self, ProtocolError> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| ProtocolError::InvalidHeaders(e.to_string()))
    }

    fn into_headers(self) -> TaskHeaders {
        let time_limit = self
            .timelimit
            .map(|(soft, hard)| TimeLimit { soft, hard })
            .unwrap_or_default();

        TaskHeaders {
            lang: self.lang,
            root_id: self.root_id.or(self.root_id_camel),
            parent_id: self.parent_id.or(self.parent_id_camel),
            group: self.group,
            retries: self.retries.unwrap_or(0),
            eta: self.eta,
            expires: self.expires,
            time_limit,
            origin: self.origin,
            shadow: self.shadow,
            meth: self.meth,
            argsrepr: self.argsrepr,
            kwargsrepr: self.kwargsrepr,
        }
    }
}

/// Stateless encoder/decoder for task messages
pub struct ProtocolCodec;

impl ProtocolCodec {
    /// Normalize an envelope into a task invocation
    pub fn decode(envelope: &Envelope) -> Result<TaskInvocation, ProtocolError> {
        let body = envelope.decode_body()?;
        match envelope.task_header() {
            Some(name) => Self::decode_v2(name, envelope, body),
            None => Self::decode_v1(envelope, body),
        }
    }

    fn decode_v2(
        name: &str,
        envelope: &Envelope,
        body: Value,
    ) -> Result<TaskInvocation, ProtocolError> {
        let meta = WireMeta::from_map(&envelope.headers)?;
        let id = meta.id.clone().unwrap_or_default();

        match split_v2_body(&body) {
            Some((args, kwargs, embed)) => Ok(TaskInvocation {
                name: name.to_string(),
                id,
                protocol: ProtocolVersion::V2,
                args,
                kwargs,
                embed,
                retry_policy: find_retry_policy(&body),
                body,
                opaque: false,
                headers: meta.into_headers(),
            }),
            None => Ok(opaque_invocation(
                name,
                id,
                ProtocolVersion::V2,
                meta,
                body,
            )),
        }
    }

    fn decode_v1(envelope: &Envelope, body: Value) -> Result<TaskInvocation, ProtocolError> {
        let object = body.as_object().ok_or_else(|| {
            ProtocolError::InvalidBody(
                "protocol v1 body must be a JSON object carrying the task name".to_string(),
            )
        })?;

        let name = object
            .get("task")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or(ProtocolError::MissingTaskName)?
            .to_string();

        if !object.contains_key("args") {
            let meta = WireMeta::from_map(&envelope.headers)?;
            let id = meta
                .id
                .clone()
                .or_else(|| object.get("id").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            return Ok(opaque_invocation(
                &name,
                id,
                ProtocolVersion::V1,
                meta,
                body,
            ));
        }

        let meta = WireMeta::from_map(object)?;
        let args = match object.get("args") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(ProtocolError::InvalidBody(
                    "protocol v1 args must be an array".to_string(),
                ))
            }
        };
        let kwargs = match object.get("kwargs") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(ProtocolError::InvalidBody(
                    "protocol v1 kwargs must be an object".to_string(),
                ))
            }
        };

        let field = |key: &str| object.get(key).cloned().unwrap_or(Value::Null);
        let mut embed = json!({
            "callbacks": field("callbacks"),
            "errbacks": field("errbacks"),
            "chord": field("chord"),
            "chain": Value::Null,
        });
        if let (Some(policy), Some(embed_map)) = (
            object
                .get("retryPolicy")
                .or_else(|| object.get("retry_policy")),
            embed.as_object_mut(),
        ) {
            embed_map.insert("retryPolicy".to_string(), policy.clone());
        }

        let normalized = json!([args.clone(), kwargs.clone(), embed.clone()]);
        Ok(TaskInvocation {
            name,
            id: meta.id.clone().unwrap_or_default(),
            protocol: ProtocolVersion::V1,
            args,
            kwargs,
            embed,
            retry_policy: find_retry_policy(&normalized),
            body: normalized,
            opaque: false,
            headers: meta.into_headers(),
        })
    }

    /// Encode a task as protocol v2 headers and body
    pub fn encode_v2(task: &OutgoingTask) -> (Map<String, Value>, Value) {
        let mut headers = Map::new();
        headers.insert("lang".to_string(), json!("rust"));
        headers.insert("task".to_string(), json!(task.name));
        headers.insert("id".to_string(), json!(task.id));
        headers.insert("shadow".to_string(), Value::Null);
        headers.insert("eta".to_string(), Value::Null);
        headers.insert("expires".to_string(), Value::Null);
        headers.insert("group".to_string(), Value::Null);
        headers.insert("retries".to_string(), json!(task.retries));
        headers.insert("timelimit".to_string(), json!([null, null]));
        headers.insert("root_id".to_string(), json!(task.id));
        headers.insert("parent_id".to_string(), Value::Null);
        headers.insert("origin".to_string(), json!(task.origin));

        let mut embed = json!({
            "callbacks": null,
            "errbacks": null,
            "chain": null,
            "chord": null,
        });
        if let (Some(policy), Some(embed_map)) = (&task.retry_policy, embed.as_object_mut()) {
            embed_map.insert("retryPolicy".to_string(), json!(policy));
        }

        let body = json!([task.args, task.kwargs, embed]);
        (headers, body)
    }

    /// Encode a task as a protocol v1 body
    pub fn encode_v1(task: &OutgoingTask) -> Value {
        let mut body = json!({
            "task": task.name,
            "id": task.id,
            "args": task.args,
            "kwargs": task.kwargs,
            "retries": task.retries,
            "eta": null,
            "expires": null,
            "timelimit": [null, null],
            "origin": task.origin,
        });
        if let (Some(policy), Some(body_map)) = (&task.retry_policy, body.as_object_mut()) {
            body_map.insert("retryPolicy".to_string(), json!(policy));
        }
        body
    }
}

/// A task a producer wants to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingTask {
    pub name: String,
    pub id: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub retries: u32,
    pub retry_policy: Option<RetryPolicy>,
    pub origin: Option<String>,
}

impl OutgoingTask {
    /// New task with a random id and no retries
    pub fn new<S: Into<String>>(name: S, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4().to_string(),
            args,
            kwargs: Map::new(),
            retries: 0,
            retry_policy: None,
            origin: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_retries(mut self, retries: u32, policy: RetryPolicy) -> Self {
        self.retries = retries;
        self.retry_policy = Some(policy);
        self
    }
}

/// Split a v2 body into its three parts; `None` when it does not have that shape
fn split_v2_body(body: &Value) -> Option<(Vec<Value>, Map<String, Value>, Value)> {
    let items = body.as_array()?;
    let args = match items.first() {
        Some(Value::Array(args)) => args.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return None,
    };
    let kwargs = match items.get(1) {
        Some(Value::Object(kwargs)) => kwargs.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => return None,
    };
    let embed = items
        .get(2)
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    Some((args, kwargs, embed))
}

/// First body element carrying a retry policy, in iteration order
fn find_retry_policy(body: &Value) -> Option<RetryPolicy> {
    let candidates: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![body],
        _ => Vec::new(),
    };

    candidates.into_iter().find_map(|item| {
        let map = item.as_object()?;
        let policy = map.get("retryPolicy").or_else(|| map.get("retry_policy"))?;
        serde_json::from_value(policy.clone()).ok()
    })
}

fn opaque_invocation(
    name: &str,
    id: String,
    protocol: ProtocolVersion,
    meta: WireMeta,
    body: Value,
) -> TaskInvocation {
    TaskInvocation {
        name: name.to_string(),
        id,
        protocol,
        args: Vec::new(),
        kwargs: Map::new(),
        embed: Value::Null,
        retry_policy: find_retry_policy(&body),
        body,
        opaque: true,
        headers: meta.into_headers(),
    }
}
