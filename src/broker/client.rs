//! Broker connection with automatic reconnection
//!
//! [`BrokerConnection`] wraps a [`Connector`] and adds what every driver
//! needs: bounded connect retries, topology assertion, JSON publishing,
//! delivery validation, and a reconnect supervisor that re-creates the channel
//! and re-establishes subscriptions when the broker goes away.

use super::connection::{
    ConnectionEvent, ConnectionState, ConnectionSupervisor, ReconnectConfig, ReconnectionDecision,
};
use super::transport::{Channel, Connector, Delivery, MessageProperties, RawMessage};
use crate::config::BrokerSection;
use crate::error::{sanitize_error_message, ProtocolError, TransportError, WorkerError, WorkerResult};
use crate::observability::metrics;
use crate::protocol::Envelope;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Receives validated deliveries from a subscription
///
/// Called from the consume loop; implementations must not block it.
pub trait MessageConsumer: Send + Sync + 'static {
    /// A delivery passed content validation
    fn on_message(&self, envelope: Envelope);

    /// A delivery failed content validation and will not be dispatched
    fn on_rejected(&self, message: RawMessage, error: ProtocolError);
}

struct Subscription {
    queue: String,
    consumer: Arc<dyn MessageConsumer>,
}

struct Shared<C: Connector> {
    connector: C,
    config: BrokerSection,
    reconnect: ReconnectConfig,
    channel: RwLock<Option<Arc<C::Channel>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    reconnecting: AtomicBool,
    reconnect_loops: AtomicU32,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Durable publish/subscribe over a reconnecting broker channel
///
/// Cheap to clone; all clones share one underlying connection.
pub struct BrokerConnection<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for BrokerConnection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> BrokerConnection<C> {
    /// Connect, retrying up to `max_retries` times with `retry_delay_ms` between attempts
    ///
    /// Exhausting the attempts is fatal: the error is a
    /// [`WorkerError::Connection`] and no instance is returned.
    pub async fn connect(connector: C, mut config: BrokerSection) -> WorkerResult<Self> {
        // Every reconnect resumes the same broker session
        config.options.ensure_client_id();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            connector,
            reconnect: ReconnectConfig::from_broker(&config),
            config,
            channel: RwLock::new(None),
            state_tx,
            shutdown_tx,
            reconnecting: AtomicBool::new(false),
            reconnect_loops: AtomicU32::new(0),
            subscriptions: Mutex::new(Vec::new()),
        });

        let channel = match shared.connect_with_retries().await {
            Ok(channel) => channel,
            Err(e) => {
                shared.transition(ConnectionEvent::PermanentFailure(e.to_string()));
                return Err(e);
            }
        };

        *shared.channel.write().await = Some(Arc::clone(&channel));
        shared.transition(ConnectionEvent::Established);
        Shared::watch_for_close(&shared, channel);

        Ok(Self { shared })
    }

    /// Assert the deployment exchange and the configured queue
    ///
    /// Waits while a reconnect is in progress. Idempotent.
    pub async fn is_ready(&self) -> WorkerResult<()> {
        let channel = self.shared.wait_until_connected().await?;
        self.shared.assert_topology(&channel).await?;
        debug!(
            exchange = %self.shared.config.exchange,
            queue = %self.shared.config.queue,
            "Broker topology asserted"
        );
        Ok(())
    }

    /// Publish `body` as JSON to `routing_key`
    ///
    /// The destination queue is asserted first. `properties` are merged over
    /// the defaults (persistent delivery); content type and encoding are fixed.
    pub async fn publish(
        &self,
        body: &Value,
        exchange: &str,
        routing_key: &str,
        headers: Map<String, Value>,
        properties: Map<String, Value>,
    ) -> WorkerResult<()> {
        let span = crate::broker_span!(operation = "publish", routing_key = %routing_key);
        async {
            let channel = self.shared.current_channel().await?;
            let payload = serde_json::to_vec(body)?;
            let properties = MessageProperties::merged(headers, properties)?;

            channel.assert_queue(routing_key).await?;
            let message = RawMessage {
                body: payload.into(),
                properties,
            };
            if let Err(e) = channel.publish(exchange, routing_key, message).await {
                metrics().publish_failed();
                return Err(e.into());
            }

            metrics().message_published();
            debug!("Published message");
            Ok::<(), WorkerError>(())
        }
        .instrument(span)
        .await
    }

    /// Assert `queue` and consume it
    ///
    /// Every delivery is acknowledged on receipt, before `consumer` sees it.
    /// The subscription is re-established after each reconnect.
    pub async fn subscribe(
        &self,
        queue: &str,
        consumer: Arc<dyn MessageConsumer>,
    ) -> WorkerResult<()> {
        let channel = self.shared.current_channel().await?;
        Shared::<C>::start_consuming(&channel, queue, Arc::clone(&consumer)).await?;

        self.shared.subscriptions.lock().await.push(Subscription {
            queue: queue.to_string(),
            consumer,
        });
        info!(queue = %queue, "Subscribed to queue");
        Ok(())
    }

    /// Close the channel and stop any reconnect loop
    ///
    /// Later calls are no-ops. A failure to close the open channel is returned.
    pub async fn disconnect(&self) -> WorkerResult<()> {
        if self.shared.shutdown_tx.send_replace(true) {
            debug!("Broker connection already closed");
            return Ok(());
        }

        let channel = self.shared.channel.write().await.take();
        self.shared.transition(ConnectionEvent::ClosedByClient);

        if let Some(channel) = channel {
            channel.close().await?;
        }
        info!("Disconnected from broker");
        Ok(())
    }

    /// React to the connection closing, by error or cleanly
    ///
    /// Starts the reconnect loop unless one is already running or the
    /// connection was closed by [`disconnect`](Self::disconnect).
    pub fn on_connection_closed(&self, reason: impl Into<String>) {
        Shared::handle_close(&self.shared, reason.into());
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Receiver for state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        ConnectionSupervisor::can_operate(&self.state())
    }

    /// Reconnect attempts are exhausted and nothing will recover the connection
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(self.state(), ConnectionState::PermanentlyDisconnected(_))
    }

    /// Number of reconnect loops started over the lifetime of this connection
    pub fn reconnect_loops_started(&self) -> u32 {
        self.shared.reconnect_loops.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BrokerSection {
        &self.shared.config
    }
}

impl<C: Connector> Shared<C> {
    fn transition(&self, event: ConnectionEvent) {
        let next = ConnectionSupervisor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            ConnectionSupervisor::log_state_transition(&previous, &next);
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn open_channel(&self) -> Result<Arc<C::Channel>, TransportError> {
        metrics().connection_attempt();
        match self
            .connector
            .connect(
                &self.config.url,
                &self.config.options,
                self.config.connect_timeout(),
            )
            .await
        {
            Ok(channel) => {
                metrics().connection_established();
                Ok(Arc::new(channel))
            }
            Err(e) => {
                metrics().connection_failed();
                Err(e)
            }
        }
    }

    async fn connect_with_retries(&self) -> WorkerResult<Arc<C::Channel>> {
        let max = self.reconnect.max_attempts;

        for attempt in 1..=max {
            match self.open_channel().await {
                Ok(channel) => {
                    info!(attempt, "Connected to broker");
                    return Ok(channel);
                }
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts = max,
                        error = %sanitize_error_message(&e.to_string()),
                        "Failed to connect to broker (Attempt {}/{})",
                        attempt,
                        max
                    );
                    if attempt < max {
                        info!(
                            "Retrying in {} seconds... ({}/{} attempts)",
                            self.reconnect.retry_delay.as_secs_f64(),
                            attempt,
                            max
                        );
                        if !self.interruptible_sleep(self.reconnect.retry_delay).await {
                            return Err(WorkerError::connection(
                                "Shutdown requested while connecting to broker",
                            ));
                        }
                    }
                }
            }
        }

        Err(WorkerError::connection(format!(
            "Failed to connect to broker after {max} attempts"
        )))
    }

    async fn assert_topology(&self, channel: &Arc<C::Channel>) -> WorkerResult<()> {
        channel.assert_exchange(&self.config.exchange).await?;
        channel.assert_queue(&self.config.queue).await?;
        Ok(())
    }

    async fn current_channel(&self) -> WorkerResult<Arc<C::Channel>> {
        let state = self.state_tx.borrow().clone();
        if !ConnectionSupervisor::can_operate(&state) {
            return Err(TransportError::NotConnected {
                state: state.to_string(),
            }
            .into());
        }
        self.channel.read().await.clone().ok_or_else(|| {
            TransportError::NotConnected {
                state: state.to_string(),
            }
            .into()
        })
    }

    async fn wait_until_connected(&self) -> WorkerResult<Arc<C::Channel>> {
        let mut state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                return Err(TransportError::NotConnected {
                    state: self.state_tx.borrow().to_string(),
                }
                .into());
            }

            let state = state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => {
                    if let Some(channel) = self.channel.read().await.clone() {
                        return Ok(channel);
                    }
                }
                ConnectionState::PermanentlyDisconnected(reason) => {
                    return Err(WorkerError::connection(reason));
                }
                _ => debug!(state = %state, "Waiting for broker connection"),
            }

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::ChannelClosed.into());
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Returns false if shutdown was requested during the sleep
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Sleep `delay` in slices, logging progress after each slice
    async fn wait_with_progress(&self, delay: Duration, next_attempt: u32) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let slice = (deadline - now).min(self.reconnect.progress_log_interval);
            if !self.interruptible_sleep(slice).await {
                return false;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                info!(
                    next_attempt,
                    max_attempts = self.reconnect.max_attempts,
                    "Still reconnecting to broker, next attempt in {:.0}s ({}/{})",
                    remaining.as_secs_f64(),
                    next_attempt,
                    self.reconnect.max_attempts
                );
            }
        }
    }

    fn watch_for_close(shared: &Arc<Self>, channel: Arc<C::Channel>) {
        let weak: Weak<Self> = Arc::downgrade(shared);
        tokio::spawn(async move {
            let reason = channel.closed().await;
            let Some(shared) = weak.upgrade() else {
                return;
            };

            // Only the live channel may trigger a reconnect
            let is_current = shared
                .channel
                .read()
                .await
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &channel));
            if is_current {
                Self::handle_close(&shared, reason);
            } else {
                debug!(reason = %reason, "Stale channel closed");
            }
        });
    }

    fn handle_close(shared: &Arc<Self>, reason: String) {
        if shared.shutdown_requested() {
            debug!(reason = %reason, "Channel closed after disconnect");
            return;
        }

        metrics().connection_lost();
        if !matches!(
            *shared.state_tx.borrow(),
            ConnectionState::Reconnecting(_) | ConnectionState::PermanentlyDisconnected(_)
        ) {
            shared.transition(ConnectionEvent::Lost(sanitize_error_message(&reason)));
        }

        if shared
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason = %reason, "Reconnect loop already running, ignoring close event");
            return;
        }

        shared.reconnect_loops.fetch_add(1, Ordering::AcqRel);
        metrics().reconnect_loop_started();

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            Self::reconnect_loop(&shared).await;
        });
    }

    async fn reconnect_loop(shared: &Arc<Self>) {
        // Drop the dead channel so nothing publishes into it
        let stale = shared.channel.write().await.take();
        if let Some(stale) = stale {
            let _ = stale.close().await;
        }

        let mut attempts = 0u32;
        let recovered = loop {
            let decision = ConnectionSupervisor::should_attempt_reconnection(
                attempts,
                &shared.reconnect,
                shared.shutdown_requested(),
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    attempts = attempt;
                    shared.transition(ConnectionEvent::ReconnectionStarted(attempt));

                    if !shared.wait_with_progress(delay, attempt).await {
                        break None;
                    }
                    info!(
                        attempt,
                        "Attempting reconnection {}/{}", attempt, shared.reconnect.max_attempts
                    );

                    match shared.reestablish().await {
                        Ok(channel) => break Some(channel),
                        Err(e) => warn!(
                            attempt,
                            error = %sanitize_error_message(&e.to_string()),
                            "Reconnection attempt failed"
                        ),
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown signal received, stopping reconnection");
                    break None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let fatal = WorkerError::connection(format!(
                        "Max reconnection attempts ({}) exceeded",
                        shared.reconnect.max_attempts
                    ));
                    error!(error = %fatal, "Broker connection lost for good, process restart required");
                    shared.transition(ConnectionEvent::PermanentFailure(fatal.to_string()));
                    break None;
                }
            }
        };

        shared.reconnecting.store(false, Ordering::Release);

        // Watch only after the guard is clear so a quick second loss starts a new loop
        if let Some(channel) = recovered {
            Self::watch_for_close(shared, channel);
        }
    }

    /// Open a new channel, assert topology and resubscribe
    async fn reestablish(&self) -> WorkerResult<Arc<C::Channel>> {
        let channel = self.open_channel().await?;
        if let Err(e) = self.assert_topology(&channel).await {
            let _ = channel.close().await;
            return Err(e);
        }

        if self.shutdown_requested() {
            let _ = channel.close().await;
            return Err(WorkerError::connection("Shutdown requested during reconnection"));
        }

        *self.channel.write().await = Some(Arc::clone(&channel));
        self.resubscribe(&channel).await;
        self.transition(ConnectionEvent::Established);
        Ok(channel)
    }

    async fn resubscribe(&self, channel: &Arc<C::Channel>) {
        let subscriptions = self.subscriptions.lock().await;
        for subscription in subscriptions.iter() {
            match Self::start_consuming(
                channel,
                &subscription.queue,
                Arc::clone(&subscription.consumer),
            )
            .await
            {
                Ok(()) => debug!(queue = %subscription.queue, "Re-subscribed to queue"),
                Err(e) => error!(
                    queue = %subscription.queue,
                    error = %e,
                    "Failed to re-subscribe to queue"
                ),
            }
        }
    }

    async fn start_consuming(
        channel: &Arc<C::Channel>,
        queue: &str,
        consumer: Arc<dyn MessageConsumer>,
    ) -> WorkerResult<()> {
        channel.assert_queue(queue).await?;
        let mut deliveries = channel.consume(queue).await?;

        let channel = Arc::clone(channel);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                Self::handle_delivery(channel.as_ref(), delivery, consumer.as_ref()).await;
            }
            debug!(queue = %queue, "Delivery stream ended");
        });
        Ok(())
    }

    async fn handle_delivery(channel: &C::Channel, delivery: Delivery, consumer: &dyn MessageConsumer) {
        metrics().message_received();

        // Ack on receipt: a crash while the handler runs loses this attempt
        if let Err(e) = channel.ack(&delivery).await {
            warn!(tag = delivery.tag, error = %e, "Failed to acknowledge delivery");
        }

        let RawMessage { body, properties } = delivery.message;
        let envelope = Envelope::new(
            body.clone(),
            properties.content_type.as_deref(),
            properties.content_encoding.as_deref(),
            properties.envelope_properties(),
            properties.headers.clone(),
        );

        match envelope {
            Ok(envelope) => consumer.on_message(envelope),
            Err(e) => {
                warn!(error = %e, "Rejecting delivery");
                metrics().task_rejected();
                consumer.on_rejected(RawMessage { body, properties }, e);
            }
        }
    }
}
