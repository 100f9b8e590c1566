//! Delivered message envelope and wire-format constants

use crate::error::ProtocolError;
use bytes::Bytes;
use serde_json::{Map, Value};

/// The only content type the worker accepts
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// The only content encoding the worker accepts
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// One broker delivery with its transport metadata
///
/// Built once per delivery after content validation and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: Bytes,
    pub content_type: String,
    pub content_encoding: String,
    /// Message properties other than headers (delivery mode, correlation id, ...)
    pub properties: Map<String, Value>,
    pub headers: Map<String, Value>,
}

impl Envelope {
    /// Build a validated envelope from delivery metadata
    pub fn new(
        body: Bytes,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
        properties: Map<String, Value>,
        headers: Map<String, Value>,
    ) -> Result<Self, ProtocolError> {
        validate_content(content_type, content_encoding)?;
        Ok(Self {
            body,
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: CONTENT_ENCODING_UTF8.to_string(),
            properties,
            headers,
        })
    }

    /// Envelope carrying a JSON body with the fixed content type and encoding
    pub fn json(body: &Value, headers: Map<String, Value>) -> Self {
        Self {
            body: Bytes::from(body.to_string()),
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: CONTENT_ENCODING_UTF8.to_string(),
            properties: Map::new(),
            headers,
        }
    }

    /// Task name carried in headers (protocol v2 marker)
    pub fn task_header(&self) -> Option<&str> {
        self.headers
            .get("task")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Task id carried in headers, if any
    pub fn id_header(&self) -> Option<&str> {
        self.headers.get("id").and_then(Value::as_str)
    }

    /// Decode the body as UTF-8 JSON
    pub fn decode_body(&self) -> Result<Value, ProtocolError> {
        let text = std::str::from_utf8(&self.body)
            .map_err(|e| ProtocolError::InvalidBody(format!("body is not utf-8: {e}")))?;
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidBody(e.to_string()))
    }

    /// Best-effort decoded body for failure reports; undecodable bodies become a string
    pub fn body_for_report(&self) -> Value {
        self.decode_body()
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

/// Check content type and encoding against the fixed supported values
pub fn validate_content(
    content_type: Option<&str>,
    content_encoding: Option<&str>,
) -> Result<(), ProtocolError> {
    match content_type {
        Some(CONTENT_TYPE_JSON) => {}
        other => {
            return Err(ProtocolError::UnsupportedContentType(
                other.unwrap_or("<none>").to_string(),
            ))
        }
    }
    match content_encoding {
        Some(CONTENT_ENCODING_UTF8) => Ok(()),
        other => Err(ProtocolError::UnsupportedContentEncoding(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}
