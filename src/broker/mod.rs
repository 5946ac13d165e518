//! Broker publishing.
//!
//! The broker is consumed through three small traits so the transport can be
//! swapped: a [`Connector`] produces a [`BrokerConnection`], which opens
//! short-lived [`PublishSession`]s. [`BrokerPublisher`] owns the one shared
//! connection and drives the per-cell publish loop.

pub mod amqp;
pub mod memory;
mod publisher;

pub use publisher::{BrokerPublisher, PublishReport};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConnectError, PublishError};

/// Application message id attached to every grid update.
pub const APP_MESSAGE_ID: &str = "OC-TRANSPO-UPDATE";

/// A fully encoded message ready to hand to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub app_message_id: String,
    pub payload: Vec<u8>,
}

/// Establishes broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ConnectError>;
}

/// A live broker connection, shared across requests.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the transport is still up.
    fn is_connected(&self) -> bool;

    async fn open_session(&self) -> Result<Box<dyn PublishSession>, PublishError>;

    async fn close(&self);
}

/// A publish session scoped to one pipeline pass.
#[async_trait]
pub trait PublishSession: Send {
    /// Sends one message. Never queues when the broker cannot accept it.
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError>;

    /// Releases the session. Must be called on every exit path.
    async fn terminate(self: Box<Self>);
}
