//! In-memory broker
//!
//! [`MemoryBroker`] implements the driver seam without any network: queues
//! live in a shared map, channels can be failed or closed on demand, and every
//! publish and ack is recorded for assertions.

use crate::broker::{Channel, Connector, Delivery, MessageProperties, RawMessage};
use crate::config::{BrokerOptions, BrokerSection};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// URL scheme accepted by [`MemoryConnector`]
pub const MEMORY_SCHEME: &str = "memory://";

const CONSUMER_BUFFER: usize = 1024;

/// A message seen by the broker: `(exchange, routing_key, message)`
pub type PublishedMessage = (String, String, RawMessage);

/// Broker settings suited to tests: memory URL, short delays
pub fn memory_broker_config() -> BrokerSection {
    BrokerSection {
        url: "memory://localhost".to_string(),
        queue: "celery".to_string(),
        exchange: "celery".to_string(),
        max_retries: 5,
        retry_delay_ms: 100,
        progress_log_interval_secs: 1,
        connect_timeout_secs: 1,
        options: BrokerOptions::default(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<RawMessage>,
    consumer: Option<(u64, mpsc::Sender<Delivery>)>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    exchanges: Mutex<HashSet<String>>,
    channels: Mutex<Vec<(u64, Arc<watch::Sender<Option<String>>>)>>,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<u64>>,
    client_ids: Mutex<Vec<Option<String>>>,
    fail_next_connects: AtomicU32,
    connect_calls: AtomicU32,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
}

impl BrokerState {
    fn deliver(&self, queue: &str, message: RawMessage) {
        let mut queues = lock(&self.queues);
        let state = queues.entry(queue.to_string()).or_default();
        let Some((_, sender)) = &state.consumer else {
            state.backlog.push_back(message);
            return;
        };

        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
            message,
        };
        match sender.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                state.backlog.push_back(delivery.message);
            }
            Err(mpsc::error::TrySendError::Closed(delivery)) => {
                state.consumer = None;
                state.backlog.push_back(delivery.message);
            }
        }
    }

    fn close_channel(&self, id: u64, reason: &str) {
        for (channel_id, closed_tx) in lock(&self.channels).iter() {
            if *channel_id == id {
                closed_tx.send_if_modified(|closed| {
                    if closed.is_some() {
                        return false;
                    }
                    *closed = Some(reason.to_string());
                    true
                });
            }
        }
        for state in lock(&self.queues).values_mut() {
            if state.consumer.as_ref().is_some_and(|(owner, _)| *owner == id) {
                state.consumer = None;
            }
        }
    }
}

/// Shared in-memory broker; clones observe the same queues
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening channels on this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state.fail_next_connects.store(count, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, failed ones included
    pub fn connect_calls(&self) -> u32 {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Client id presented on each connection attempt, in order
    pub fn client_ids(&self) -> Vec<Option<String>> {
        lock(&self.state.client_ids).clone()
    }

    /// Close every open channel as if the broker went away
    pub fn close_all(&self, reason: &str) {
        let ids: Vec<u64> = lock(&self.state.channels).iter().map(|(id, _)| *id).collect();
        for id in ids {
            self.state.close_channel(id, reason);
        }
    }

    /// Channels that are still open
    pub fn open_channels(&self) -> usize {
        lock(&self.state.channels)
            .iter()
            .filter(|(_, closed_tx)| closed_tx.borrow().is_none())
            .count()
    }

    /// Put a raw message on `queue`, bypassing the publish path
    ///
    /// Lets tests deliver content types a producer would never send.
    pub fn deliver_raw(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
        headers: Map<String, Value>,
    ) {
        let message = RawMessage {
            body: body.into(),
            properties: MessageProperties {
                content_type: content_type.map(str::to_string),
                content_encoding: content_encoding.map(str::to_string),
                headers,
                ..Default::default()
            },
        };
        self.state.deliver(queue, message);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state.published).clone()
    }

    /// Delivery tags acknowledged so far
    pub fn acked(&self) -> Vec<u64> {
        lock(&self.state.acked).clone()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state.queues).contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        lock(&self.state.exchanges).contains(exchange)
    }

    /// Messages waiting on `queue` with no consumer attached
    pub fn backlog(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map_or(0, |state| state.backlog.len())
    }
}

/// Opens [`MemoryChannel`]s on a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Channel = MemoryChannel;

    async fn connect(
        &self,
        url: &str,
        options: &BrokerOptions,
        _timeout: Duration,
    ) -> Result<MemoryChannel, TransportError> {
        let state = &self.broker.state;
        state.connect_calls.fetch_add(1, Ordering::SeqCst);
        lock(&state.client_ids).push(options.client_id.clone());

        if !url.starts_with(MEMORY_SCHEME) {
            return Err(TransportError::InvalidBrokerUrl(url.to_string()));
        }

        let should_fail = state
            .fail_next_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }

        let id = state.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        let (closed_tx, _) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        lock(&state.channels).push((id, Arc::clone(&closed_tx)));

        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
            closed_tx,
        })
    }
}

/// One open connection to a [`MemoryBroker`]
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed_tx: Arc<watch::Sender<Option<String>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed_tx.borrow().is_some() {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    /// Close just this channel, as if its connection dropped
    pub fn simulate_loss(&self, reason: &str) {
        self.broker.state.close_channel(self.id, reason);
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn assert_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state.exchanges).insert(name.to_string());
        Ok(())
    }

    async fn assert_queue(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(TransportError::Topology {
                name: name.to_string(),
                reason: "queue name must not be empty".to_string(),
            });
        }
        lock(&self.broker.state.queues)
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: RawMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state.published).push((
            exchange.to_string(),
            routing_key.to_string(),
            message.clone(),
        ));
        self.broker.state.deliver(routing_key, message);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);

        let backlog: Vec<RawMessage> = {
            let mut queues = lock(&self.broker.state.queues);
            let state = queues.entry(queue.to_string()).or_default();
            state.consumer = Some((self.id, tx));
            state.backlog.drain(..).collect()
        };
        for message in backlog {
            self.broker.state.deliver(queue, message);
        }
        Ok(rx)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state.acked).push(delivery.tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.close_channel(self.id, "closed by client");
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed_rx = self.closed_tx.subscribe();
        let reason = match closed_rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "channel dropped".to_string(),
        };
        reason
    }
}
