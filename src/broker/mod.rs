//! Broker connectivity
//!
//! - [`transport`] - driver seam (`Connector`, `Channel`) and message types
//! - [`connection`] - pure connection state and reconnection decisions
//! - [`client`] - [`BrokerConnection`]: retries, topology, publish, consume, reconnect
//! - [`mqtt`] - MQTT v5 driver
//!
//! ```rust,no_run
//! use celery_worker::broker::{BrokerConnection, MqttConnector};
//! use celery_worker::config::BrokerSection;
//!
//! # tokio_test::block_on(async {
//! let connection = BrokerConnection::connect(MqttConnector, BrokerSection::default()).await?;
//! connection.is_ready().await?;
//! # Ok::<(), celery_worker::error::WorkerError>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod mqtt;
pub mod transport;

pub use client::{BrokerConnection, MessageConsumer};
pub use connection::{
    ConnectionEvent, ConnectionState, ConnectionSupervisor, ReconnectConfig, ReconnectionDecision,
};
pub use mqtt::{MqttChannel, MqttConnector};
pub use transport::{Channel, Connector, Delivery, MessageProperties, RawMessage};
