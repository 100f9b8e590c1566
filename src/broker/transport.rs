//! Broker driver seam
//!
//! [`BrokerConnection`](super::BrokerConnection) owns connection management
//! and delivery validation; everything broker-specific sits behind the
//! [`Connector`] and [`Channel`] traits so drivers can be swapped (MQTT in
//! production, an in-memory broker in tests).

use crate::config::BrokerOptions;
use crate::error::TransportError;
use crate::protocol::{CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;

/// Persistent delivery mode
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Message properties as carried by the broker
///
/// Serialized in the producer's camelCase form so caller-supplied property
/// maps merge field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Properties this crate does not model, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageProperties {
    /// Library defaults for an outgoing JSON message: persistent delivery
    pub fn json_defaults() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            content_encoding: Some(CONTENT_ENCODING_UTF8.to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            ..Default::default()
        }
    }

    /// Merge caller-supplied properties over the defaults
    ///
    /// Content type and encoding are fixed and cannot be overridden.
    pub fn merged(
        headers: Map<String, Value>,
        overrides: Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        let mut merged = match serde_json::to_value(Self::json_defaults())? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merged.extend(overrides);

        let mut properties: MessageProperties = serde_json::from_value(Value::Object(merged))?;
        properties.content_type = Some(CONTENT_TYPE_JSON.to_string());
        properties.content_encoding = Some(CONTENT_ENCODING_UTF8.to_string());
        properties.headers.extend(headers);
        Ok(properties)
    }

    /// Everything except headers, content type and encoding, as a JSON map
    pub fn envelope_properties(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.remove("headers");
        map.remove("contentType");
        map.remove("contentEncoding");
        map
    }
}

/// A message as it travels through the broker
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// One delivery from a consumer, identified by a driver-specific tag
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub message: RawMessage,
}

/// An open channel to the broker
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Create the durable direct exchange if absent
    async fn assert_exchange(&self, name: &str) -> Result<(), TransportError>;

    /// Create the durable queue if absent
    async fn assert_queue(&self, name: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: RawMessage,
    ) -> Result<(), TransportError>;

    /// Start consuming a queue; deliveries arrive on the returned receiver
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Resolves once the connection behind this channel is gone, with the reason
    async fn closed(&self) -> String;
}

/// Opens channels to a broker URL
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    async fn connect(
        &self,
        url: &str,
        options: &BrokerOptions,
        timeout: Duration,
    ) -> Result<Self::Channel, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_defaults_are_persistent_json() {
        let defaults = MessageProperties::json_defaults();
        assert_eq!(defaults.content_type.as_deref(), Some("application/json"));
        assert_eq!(defaults.content_encoding.as_deref(), Some("utf-8"));
        assert_eq!(defaults.delivery_mode, Some(DELIVERY_MODE_PERSISTENT));
    }

    #[test]
    fn test_merge_overrides_defaults() {
        let properties = MessageProperties::merged(
            map(json!({"task": "tasks.add"})),
            map(json!({"deliveryMode": 1, "correlationId": "abc", "expiration": "60000"})),
        )
        .unwrap();

        assert_eq!(properties.delivery_mode, Some(1));
        assert_eq!(properties.correlation_id.as_deref(), Some("abc"));
        assert_eq!(properties.extra.get("expiration"), Some(&json!("60000")));
        assert_eq!(properties.headers.get("task"), Some(&json!("tasks.add")));
    }

    #[test]
    fn test_content_type_cannot_be_overridden() {
        let properties = MessageProperties::merged(
            Map::new(),
            map(json!({"contentType": "text/plain", "contentEncoding": "binary"})),
        )
        .unwrap();

        assert_eq!(properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(properties.content_encoding.as_deref(), Some("utf-8"));
    }

    #[test]
    fn test_envelope_properties_skip_headers() {
        let properties = MessageProperties::merged(
            map(json!({"id": "1"})),
            map(json!({"replyTo": "results"})),
        )
        .unwrap();

        let envelope_props = properties.envelope_properties();
        assert!(!envelope_props.contains_key("headers"));
        assert!(!envelope_props.contains_key("contentType"));
        assert_eq!(envelope_props.get("replyTo"), Some(&json!("results")));
        assert_eq!(envelope_props.get("deliveryMode"), Some(&json!(2)));
    }
}
