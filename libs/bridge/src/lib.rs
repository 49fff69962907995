//! # Telemetry Bridge
//!
//! Forwards telemetry from upstream client links to a downstream messaging
//! backend and keeps each upstream sender's credit in step with the real
//! capacity of its downstream link.
//!
//! ```text
//! upstream link --attach--> ForwardingAdapter --SenderFactory--> downstream sender
//!      ^                          |                                   |
//!      |                      link lane  <------- drain callback -----+
//!      +--- FlowControlNotifier --+
//! ```
//!
//! Each attached client gets its own lane task that owns the link state. The
//! lane announces `credit - queued` when the sender is created and again every
//! time the sender's send queue drains, forwarding the downstream drain flag
//! when set.

pub mod adapter;
pub mod address;
pub mod bus;
pub mod config;
pub mod downstream;
pub mod error;
pub mod flow_control;
mod lane;
pub mod message;
pub mod metrics;
pub mod notifier;
pub mod registry;
pub mod test_utils;

pub use adapter::ForwardingAdapter;
pub use address::ResourceIdentifier;
pub use bus::{BusMessage, LocalBus};
pub use config::{BridgeConfig, BridgeSettings, DownstreamSettings};
pub use downstream::{
    ConnectionRef, DownstreamConnection, DownstreamSender, DrainCallback, MemoryConnection,
    MemoryReceiver, MemorySender, MemorySenderFactory, SenderFactory, SenderRef,
};
pub use error::{BridgeError, Result};
pub use flow_control::{
    available_credit, flow_control_address, ErrorMessage, FlowControlMessage, LinkPhase,
    UpstreamNotice,
};
pub use lane::CloseReason;
pub use message::TelemetryMessage;
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use notifier::{BusNotifier, FlowControlNotifier};
pub use registry::{ClientKey, ClientRegistry, LinkHandle};
