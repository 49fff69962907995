//! Delivery of flow-control and error notices to upstream link handlers

use crate::bus::LocalBus;
use crate::flow_control::UpstreamNotice;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Publishes notices on upstream flow-control channels
#[async_trait]
pub trait FlowControlNotifier: Send + Sync + Debug {
    /// Fire-and-forget delivery
    fn publish(&self, address: &str, notice: &UpstreamNotice) -> Result<()>;

    /// Deliver and wait for the upstream handler to acknowledge
    async fn request(&self, address: &str, notice: &UpstreamNotice, timeout: Duration)
        -> Result<()>;
}

/// [`FlowControlNotifier`] over a [`LocalBus`], encoding notices as JSON
#[derive(Debug, Clone)]
pub struct BusNotifier {
    bus: Arc<LocalBus>,
}

impl BusNotifier {
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    fn encode(notice: &UpstreamNotice) -> Result<Bytes> {
        Ok(Bytes::from(notice.to_json()?))
    }
}

#[async_trait]
impl FlowControlNotifier for BusNotifier {
    fn publish(&self, address: &str, notice: &UpstreamNotice) -> Result<()> {
        trace!("Publishing {:?} on {}", notice, address);
        self.bus.send(address, Self::encode(notice)?)
    }

    async fn request(
        &self,
        address: &str,
        notice: &UpstreamNotice,
        timeout: Duration,
    ) -> Result<()> {
        trace!("Requesting ack for {:?} on {}", notice, address);
        let payload = Self::encode(notice)?;
        self.bus.request(address, payload, timeout).await
    }
}
