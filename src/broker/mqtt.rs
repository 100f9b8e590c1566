//! MQTT v5 broker driver
//!
//! Queues map onto topics under a configurable prefix (`celery/<queue>`).
//! Consumers join a shared subscription (`$share/<group>/celery/<queue>`) so
//! workers in one group split a queue's messages instead of each getting a
//! copy. A persistent session (stable client id, `clean_start = false`, a
//! session expiry) makes the broker hold QoS 1 messages while a worker is
//! away. Deliveries use manual acks so acknowledgement timing stays under the
//! control of [`BrokerConnection`](super::BrokerConnection).
//!
//! Message metadata travels in MQTT v5 publish properties: the content type
//! in its dedicated field, everything else as user properties.

use super::transport::{Channel, Connector, Delivery, MessageProperties, RawMessage};
use crate::config::BrokerOptions;
use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

const USER_PROP_CONTENT_ENCODING: &str = "content-encoding";
const USER_PROP_HEADERS: &str = "headers";
const USER_PROP_PROPERTIES: &str = "properties";

const DELIVERY_BUFFER: usize = 128;
const REQUEST_CAPACITY: usize = 64;

/// Canonical MQTT topic: no leading or trailing slash, no empty levels
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Topic a queue or routing key maps onto
pub fn queue_topic(prefix: &str, queue: &str) -> String {
    canonicalize_topic(&format!("{prefix}/{queue}"))
}

/// Subscription filter for a queue topic; an empty group subscribes directly
pub fn shared_subscription(group: &str, topic: &str) -> String {
    if group.is_empty() {
        topic.to_string()
    } else {
        format!("$share/{group}/{topic}")
    }
}

/// Queue names must be usable as a single concrete topic
pub fn validate_queue_name(queue: &str) -> Result<(), TransportError> {
    if queue.trim().is_empty() {
        return Err(TransportError::Topology {
            name: queue.to_string(),
            reason: "queue name is empty".to_string(),
        });
    }
    if let Some(ch) = queue.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
        return Err(TransportError::Topology {
            name: queue.to_string(),
            reason: format!("queue name contains reserved character '{ch}'"),
        });
    }
    Ok(())
}

/// Build client options from a broker URL and options
pub fn configure_mqtt_options(
    url: &str,
    options: &BrokerOptions,
) -> Result<MqttOptions, TransportError> {
    let parsed = Url::parse(url).map_err(|_| TransportError::InvalidBrokerUrl(url.to_string()))?;

    let tls = match parsed.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => {
            return Err(TransportError::InvalidBrokerUrl(format!(
                "{url} (scheme '{other}' is not an MQTT scheme)"
            )))
        }
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(url.to_string()))?;
    let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });

    let client_id = options.clone().ensure_client_id().to_string();
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Environment credentials win over credentials embedded in the URL
    if let Some((username, password)) = options.credentials() {
        mqtt_options.set_credentials(username, password);
    } else if !parsed.username().is_empty() {
        mqtt_options.set_credentials(parsed.username(), parsed.password().unwrap_or_default());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(options.max_packet_size));
    mqtt_options.set_clean_start(options.clean_start);
    mqtt_options.set_manual_acks(true);

    // MQTT v5 ends a session on disconnect unless an expiry is requested
    if !options.clean_start {
        let mut properties = mqtt_options
            .connect_properties()
            .unwrap_or_else(ConnectProperties::new);
        properties.session_expiry_interval = Some(options.session_expiry_secs);
        mqtt_options.set_connect_properties(properties);
    }

    Ok(mqtt_options)
}

/// Encode message properties as MQTT v5 publish properties
pub fn to_publish_properties(
    properties: &MessageProperties,
) -> Result<PublishProperties, TransportError> {
    let encode = |value: &Map<String, Value>| {
        serde_json::to_string(value).map_err(|e| TransportError::PublishFailed(e.to_string()))
    };

    let mut user_properties = Vec::new();
    if let Some(encoding) = &properties.content_encoding {
        user_properties.push((USER_PROP_CONTENT_ENCODING.to_string(), encoding.clone()));
    }
    user_properties.push((USER_PROP_HEADERS.to_string(), encode(&properties.headers)?));
    user_properties.push((
        USER_PROP_PROPERTIES.to_string(),
        encode(&properties.envelope_properties())?,
    ));

    Ok(PublishProperties {
        content_type: properties.content_type.clone(),
        user_properties,
        ..Default::default()
    })
}

/// Decode MQTT v5 publish properties back into message properties
///
/// Malformed user properties are dropped with a warning; the delivery itself
/// still goes through content validation.
pub fn from_publish_properties(properties: Option<&PublishProperties>) -> MessageProperties {
    let Some(properties) = properties else {
        return MessageProperties::default();
    };

    let mut message_properties = MessageProperties::default();
    for (key, value) in &properties.user_properties {
        match key.as_str() {
            USER_PROP_CONTENT_ENCODING => {
                message_properties.content_encoding = Some(value.clone());
            }
            USER_PROP_HEADERS => match serde_json::from_str::<Map<String, Value>>(value) {
                Ok(headers) => message_properties.headers = headers,
                Err(e) => warn!(error = %e, "Ignoring malformed headers user property"),
            },
            USER_PROP_PROPERTIES => match serde_json::from_str::<MessageProperties>(value) {
                Ok(extra) => {
                    message_properties.delivery_mode = extra.delivery_mode;
                    message_properties.correlation_id = extra.correlation_id;
                    message_properties.reply_to = extra.reply_to;
                    message_properties.priority = extra.priority;
                    message_properties.extra = extra.extra;
                }
                Err(e) => warn!(error = %e, "Ignoring malformed properties user property"),
            },
            _ => {}
        }
    }
    message_properties.content_type = properties.content_type.clone();
    message_properties
}

/// Routing decisions for MQTT events
#[derive(Debug)]
enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(Publish),
    Disconnected,
    Other,
}

fn route_event(event: Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived(publish),
        Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
        _ => EventRoute::Other,
    }
}

/// State shared between a channel and its event-loop task
struct MqttShared {
    client: AsyncClient,
    consumers: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
    pending_acks: Mutex<HashMap<u64, Publish>>,
    next_tag: AtomicU64,
    closed_tx: watch::Sender<Option<String>>,
}

impl MqttShared {
    fn mark_closed(&self, reason: String) {
        self.closed_tx.send_if_modified(|closed| {
            if closed.is_none() {
                *closed = Some(reason);
                true
            } else {
                false
            }
        });
        // Dropping senders ends every delivery stream of this channel
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    async fn route_publish(&self, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();

        if publish.retain {
            debug!(topic = %topic, "Ignoring retained message");
            if let Err(e) = self.client.ack(&publish).await {
                warn!(error = %e, "Failed to acknowledge retained message");
            }
            return;
        }

        let sender = self
            .consumers
            .lock()
            .ok()
            .and_then(|consumers| consumers.get(&topic).cloned());
        let Some(sender) = sender else {
            // Unacked QoS 1 messages block the broker's in-flight window
            debug!(topic = %topic, "No consumer for topic, acknowledging");
            if let Err(e) = self.client.ack(&publish).await {
                warn!(error = %e, "Failed to acknowledge unrouted message");
            }
            return;
        };

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            tag,
            message: RawMessage {
                body: publish.payload.clone(),
                properties: from_publish_properties(publish.properties.as_ref()),
            },
        };
        if let Ok(mut pending) = self.pending_acks.lock() {
            pending.insert(tag, publish);
        }

        if sender.send(delivery).await.is_err() {
            debug!(topic = %topic, "Consumer dropped, discarding delivery");
            let publish = self
                .pending_acks
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&tag));
            if let Some(publish) = publish {
                if let Err(e) = self.client.ack(&publish).await {
                    warn!(error = %e, "Failed to acknowledge discarded message");
                }
            }
        }
    }

}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<MqttShared>,
    connack_tx: oneshot::Sender<Result<(), String>>,
) {
    let mut connack_tx = Some(connack_tx);
    let mut closed_rx = shared.closed_tx.subscribe();

    loop {
        tokio::select! {
            _ = closed_rx.changed() => {
                debug!("MQTT channel closed, stopping event loop");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(event) => match route_event(event) {
                    EventRoute::ConnectionAcknowledged => {
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    EventRoute::MessageReceived(publish) => shared.route_publish(publish).await,
                    EventRoute::Disconnected => {
                        shared.mark_closed("broker sent disconnect".to_string());
                        break;
                    }
                    EventRoute::Other => {}
                },
                Err(e) => {
                    let reason = e.to_string();
                    match connack_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(reason.clone()));
                        }
                        None => error!(error = %reason, "MQTT event loop error"),
                    }
                    // Reconnection is owned by BrokerConnection; this loop ends here
                    shared.mark_closed(reason);
                    break;
                }
            }
        }
    }
}

/// Opens MQTT channels
#[derive(Debug, Clone, Default)]
pub struct MqttConnector;

#[async_trait]
impl Connector for MqttConnector {
    type Channel = MqttChannel;

    async fn connect(
        &self,
        url: &str,
        options: &BrokerOptions,
        timeout: Duration,
    ) -> Result<MqttChannel, TransportError> {
        let mqtt_options = configure_mqtt_options(url, options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (closed_tx, _) = watch::channel(None);

        let shared = Arc::new(MqttShared {
            client,
            consumers: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed_tx,
        });

        let (connack_tx, connack_rx) = oneshot::channel();
        let driver = tokio::spawn(drive_event_loop(event_loop, Arc::clone(&shared), connack_tx));

        let outcome = match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::ConnectionFailed(reason)),
            Ok(Err(_)) => Err(TransportError::ConnectionFailed(
                "event loop stopped before ConnAck".to_string(),
            )),
            Err(_) => Err(TransportError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        };

        if let Err(e) = outcome {
            driver.abort();
            return Err(e);
        }

        Ok(MqttChannel {
            shared,
            topic_prefix: options.topic_prefix.clone(),
            share_group: options.share_group.clone(),
            driver,
        })
    }
}

/// One MQTT session
pub struct MqttChannel {
    shared: Arc<MqttShared>,
    topic_prefix: String,
    share_group: String,
    driver: JoinHandle<()>,
}

impl MqttChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            Err(TransportError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn assert_exchange(&self, name: &str) -> Result<(), TransportError> {
        // Topics need no declaration; an open session is all there is to check
        self.ensure_open()?;
        debug!(exchange = %name, "Exchange asserted");
        Ok(())
    }

    async fn assert_queue(&self, name: &str) -> Result<(), TransportError> {
        // MQTT has no queue declaration: the durable queue is the shared
        // subscription held by the persistent session, created by `consume`
        self.ensure_open()?;
        validate_queue_name(name)
    }

    async fn publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        message: RawMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let topic = queue_topic(&self.topic_prefix, routing_key);
        let properties = to_publish_properties(&message.properties)?;

        self.shared
            .client
            .publish_with_properties(&topic, QoS::AtLeastOnce, false, message.body, properties)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        self.ensure_open()?;
        validate_queue_name(queue)?;
        let topic = queue_topic(&self.topic_prefix, queue);
        let filter = shared_subscription(&self.share_group, &topic);
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

        // Shared subscriptions still deliver on the real topic
        if let Ok(mut consumers) = self.shared.consumers.lock() {
            consumers.insert(topic.clone(), tx);
        }

        self.shared
            .client
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;
        debug!(topic = %topic, filter = %filter, "Subscribed to topic");
        Ok(rx)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let publish = self
            .shared
            .pending_acks
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&delivery.tag))
            .ok_or_else(|| TransportError::AckFailed(format!("unknown delivery tag {}", delivery.tag)))?;

        self.shared
            .client
            .ack(&publish)
            .await
            .map_err(|e| TransportError::AckFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let result = self
            .shared
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()));
        self.shared.mark_closed("closed by client".to_string());
        result
    }

    async fn closed(&self) -> String {
        let mut closed_rx = self.shared.closed_tx.subscribe();
        let reason = match closed_rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_has_no_empty_levels(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(!result.starts_with('/'));
            prop_assert!(!result.ends_with('/'));
            prop_assert!(!result.contains("//"));
        }
    }

    #[test]
    fn test_queue_topic() {
        assert_eq!(queue_topic("celery", "celery"), "celery/celery");
        assert_eq!(queue_topic("/celery/", "//media//"), "celery/media");
        assert_eq!(queue_topic("", "jobs"), "jobs");
    }

    #[test]
    fn test_validate_queue_name() {
        assert!(validate_queue_name("celery").is_ok());
        assert!(validate_queue_name("media.high").is_ok());
        assert!(matches!(
            validate_queue_name("  "),
            Err(TransportError::Topology { .. })
        ));
        assert!(matches!(
            validate_queue_name("jobs/#"),
            Err(TransportError::Topology { .. })
        ));
        assert!(matches!(
            validate_queue_name("a+b"),
            Err(TransportError::Topology { .. })
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = BrokerOptions {
            client_id: Some("worker-1".to_string()),
            ..Default::default()
        };
        let mqtt_options = configure_mqtt_options("mqtt://localhost:1883", &options).unwrap();
        assert_eq!(mqtt_options.client_id(), "worker-1");
        assert_eq!(mqtt_options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_persistent_session_requests_expiry() {
        let options = BrokerOptions {
            session_expiry_secs: 900,
            ..Default::default()
        };
        let mqtt_options = configure_mqtt_options("mqtt://localhost", &options).unwrap();
        assert!(!mqtt_options.clean_start());
        let properties = mqtt_options.connect_properties().unwrap();
        assert_eq!(properties.session_expiry_interval, Some(900));
        assert_eq!(properties.max_packet_size, Some(options.max_packet_size));
    }

    #[test]
    fn test_clean_session_has_no_expiry() {
        let options = BrokerOptions {
            clean_start: true,
            ..Default::default()
        };
        let mqtt_options = configure_mqtt_options("mqtt://localhost", &options).unwrap();
        assert!(mqtt_options.clean_start());
        let properties = mqtt_options.connect_properties().unwrap();
        assert_eq!(properties.session_expiry_interval, None);
    }

    #[test]
    fn test_shared_subscription() {
        assert_eq!(
            shared_subscription("celery-workers", "celery/celery"),
            "$share/celery-workers/celery/celery"
        );
        assert_eq!(shared_subscription("", "celery/celery"), "celery/celery");
    }

    fn shared_state() -> (Arc<MqttShared>, EventLoop) {
        let options = configure_mqtt_options("mqtt://localhost", &BrokerOptions::default()).unwrap();
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (closed_tx, _) = watch::channel(None);
        let shared = Arc::new(MqttShared {
            client,
            consumers: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed_tx,
        });
        (shared, event_loop)
    }

    fn incoming(topic: &str, pkid: u16) -> Publish {
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, "[[], {}, {}]", None);
        publish.pkid = pkid;
        publish
    }

    fn pending_acks(shared: &MqttShared) -> usize {
        shared.pending_acks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_unrouted_message_is_not_left_pending() {
        let (shared, _event_loop) = shared_state();
        shared.route_publish(incoming("celery/other", 1)).await;
        assert_eq!(pending_acks(&shared), 0);
    }

    #[tokio::test]
    async fn test_dropped_consumer_releases_pending_ack() {
        let (shared, _event_loop) = shared_state();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        shared
            .consumers
            .lock()
            .unwrap()
            .insert("celery/celery".to_string(), tx);

        shared.route_publish(incoming("celery/celery", 2)).await;
        assert_eq!(pending_acks(&shared), 0);
    }

    #[tokio::test]
    async fn test_routed_message_waits_for_ack() {
        let (shared, _event_loop) = shared_state();
        let (tx, mut rx) = mpsc::channel(1);
        shared
            .consumers
            .lock()
            .unwrap()
            .insert("celery/celery".to_string(), tx);

        shared.route_publish(incoming("celery/celery", 3)).await;
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.message.body, bytes::Bytes::from("[[], {}, {}]"));
        assert_eq!(pending_acks(&shared), 1);
    }

    #[tokio::test]
    async fn test_closed_resolves_with_reason() {
        let (shared, _event_loop) = shared_state();
        let channel = MqttChannel {
            shared: Arc::clone(&shared),
            topic_prefix: "celery".to_string(),
            share_group: "celery-workers".to_string(),
            driver: tokio::spawn(async {}),
        };

        let waiter = tokio::spawn(async move { channel.closed().await });
        shared.mark_closed("broker sent disconnect".to_string());
        assert_eq!(waiter.await.unwrap(), "broker sent disconnect");
    }

    #[test]
    fn test_default_ports() {
        let options = BrokerOptions::default();
        let plain = configure_mqtt_options("tcp://broker", &options).unwrap();
        assert_eq!(plain.broker_address().1, 1883);
        let tls = configure_mqtt_options("mqtts://broker", &options).unwrap();
        assert_eq!(tls.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_urls() {
        let options = BrokerOptions::default();
        assert!(matches!(
            configure_mqtt_options("invalid-url", &options),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            configure_mqtt_options("amqp://localhost:5672", &options),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_publish_properties_carry_metadata() {
        let mut headers = Map::new();
        headers.insert("task".to_string(), json!("tasks.add"));
        headers.insert("id".to_string(), json!("abc"));
        let mut overrides = Map::new();
        overrides.insert("correlationId".to_string(), json!("abc"));
        let properties = MessageProperties::merged(headers, overrides).unwrap();

        let publish_properties = to_publish_properties(&properties).unwrap();
        assert_eq!(
            publish_properties.content_type.as_deref(),
            Some("application/json")
        );

        let decoded = from_publish_properties(Some(&publish_properties));
        assert_eq!(decoded, properties);
    }

    #[test]
    fn test_missing_publish_properties() {
        let decoded = from_publish_properties(None);
        assert_eq!(decoded.content_type, None);
        assert!(decoded.headers.is_empty());
    }

    #[test]
    fn test_malformed_user_properties_are_dropped() {
        let publish_properties = PublishProperties {
            content_type: Some("application/json".to_string()),
            user_properties: vec![
                ("content-encoding".to_string(), "utf-8".to_string()),
                ("headers".to_string(), "{not json".to_string()),
            ],
            ..Default::default()
        };
        let decoded = from_publish_properties(Some(&publish_properties));
        assert_eq!(decoded.content_encoding.as_deref(), Some("utf-8"));
        assert!(decoded.headers.is_empty());
    }
}
