//! Contracts for the downstream side of the bridge
//!
//! The bridge never constructs a downstream connection itself. It is handed
//! one, and asks a [`SenderFactory`] to open a sender on it for every
//! attaching client. Senders report their own credit and queue depth and
//! call back when their send queue has drained.

pub mod memory;

use crate::{Result, TelemetryMessage};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

pub use memory::{MemoryConnection, MemoryReceiver, MemorySender, MemorySenderFactory};

/// Callback fired by a sender when its outbound queue has drained
pub type DrainCallback = Arc<dyn Fn() + Send + Sync>;

/// Shared handle to a downstream connection
pub type ConnectionRef = Arc<dyn DownstreamConnection>;

/// Shared handle to a downstream sender
pub type SenderRef = Arc<dyn DownstreamSender>;

/// A live connection to the downstream messaging backend
pub trait DownstreamConnection: Send + Sync + Debug {
    /// Identifier used in diagnostics
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;
}

/// A downstream link the bridge forwards one client's messages to
pub trait DownstreamSender: Send + Sync + Debug {
    fn is_open(&self) -> bool;

    /// Remaining send capacity granted by the downstream peer
    fn credit(&self) -> u32;

    /// Messages accepted but not yet transferred
    fn queued(&self) -> u32;

    /// Whether the downstream peer asked for outstanding credit to be used up
    fn drain(&self) -> bool;

    /// Hand one message to the sender without waiting for transfer
    fn send(&self, message: TelemetryMessage) -> Result<()>;

    /// Register the send-queue-drained callback, replacing any previous one
    fn set_drain_callback(&self, callback: DrainCallback);

    fn close(&self);
}

/// Creates downstream senders for attaching clients
#[async_trait]
pub trait SenderFactory: Send + Sync + Debug {
    /// Open a sender on `connection` targeting `address`
    ///
    /// `on_drain` must be registered on the created sender before it is
    /// returned.
    async fn create_sender(
        &self,
        connection: ConnectionRef,
        address: &str,
        on_drain: DrainCallback,
    ) -> Result<SenderRef>;
}
