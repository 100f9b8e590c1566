//! Pure connection state management
//!
//! State transitions and reconnection decisions live here as plain functions
//! so the I/O side in [`client`](super::client) only has to act on them.

use crate::config::BrokerSection;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection state of a [`BrokerConnection`](super::BrokerConnection)
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Connected and ready for topology, publish and consume
    Connected,
    /// Connection lost (or closed by the client) with reason
    Disconnected(String),
    /// Reconnect loop running (attempt number)
    Reconnecting(u32),
    /// Reconnect attempts exhausted; the connection will not recover
    PermanentlyDisconnected(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::PermanentlyDisconnected(reason) => {
                write!(f, "permanently disconnected ({reason})")
            }
        }
    }
}

/// Reconnection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts per connect or reconnect cycle
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// How often a waiting reconnect loop reports that it is still alive
    pub progress_log_interval: Duration,
}

impl ReconnectConfig {
    pub fn from_broker(config: &BrokerSection) -> Self {
        Self {
            max_attempts: config.max_retries,
            retry_delay: config.retry_delay(),
            progress_log_interval: config.progress_log_interval(),
        }
    }

    /// Upper bound on the time one reconnect cycle can spend waiting
    pub fn max_total_delay(&self) -> Duration {
        self.retry_delay.saturating_mul(self.max_attempts)
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Channel opened and topology asserted
    Established,
    /// The broker side went away
    Lost(String),
    /// A reconnect attempt is about to run
    ReconnectionStarted(u32),
    /// No attempts left
    PermanentFailure(String),
    /// `disconnect()` was called
    ClosedByClient,
}

/// Decision result for the next reconnection step
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then run attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Pure transition and decision functions
pub struct ConnectionSupervisor;

impl ConnectionSupervisor {
    /// Decide whether another reconnect attempt runs
    ///
    /// The first attempt of a cycle runs immediately; later attempts are
    /// spaced by the configured delay.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if current_attempts >= config.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let delay = if current_attempts == 0 {
            Duration::ZERO
        } else {
            config.retry_delay
        };
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay,
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::Established => ConnectionState::Connected,
            ConnectionEvent::Lost(reason) => ConnectionState::Disconnected(reason),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::ClosedByClient => {
                ConnectionState::Disconnected("closed by client".to_string())
            }
        }
    }

    /// Check if connection state allows channel operations
    pub fn can_operate(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Whether the state can still become `Connected` without caller action
    pub fn may_recover(state: &ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::Connecting
                | ConnectionState::Disconnected(_)
                | ConnectionState::Reconnecting(_)
        )
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Broker connection lost");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "Reconnected to broker");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "Broker connection permanently failed");
            }
            _ => {
                tracing::debug!(from = %from, to = %to, "Broker connection state changed");
            }
        }
    }
}
