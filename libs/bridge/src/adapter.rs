//! Forwarding adapter
//!
//! Bridges upstream client links to downstream senders. Every public
//! operation validates its input, enqueues work on the affected link lanes
//! and returns without waiting for downstream I/O.
//!
//! ## Attach
//!
//! 1. No downstream connection or an unparseable target are rejected
//!    immediately with an error notice. A second link for the same client id
//!    is rejected without one when its flow-control address belongs to the
//!    live link, since that link's handler would be told to close.
//! 2. Otherwise the link is reserved in phase `Attaching` and its lane asks
//!    the [`SenderFactory`] for a sender.
//! 3. Once the sender exists the lane announces `credit - queued` and the
//!    link becomes `Active`. A failed or timed-out creation produces exactly
//!    one error notice instead.

use crate::address::ResourceIdentifier;
use crate::config::BridgeSettings;
use crate::downstream::{ConnectionRef, SenderFactory, SenderRef};
use crate::flow_control::{flow_control_address, LinkPhase, UpstreamNotice};
use crate::lane::{CloseReason, LaneContext, LinkCommand, LinkLane};
use crate::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::notifier::FlowControlNotifier;
use crate::registry::{ClientKey, ClientRegistry, LinkHandle};
use crate::{BridgeError, Result, TelemetryMessage};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Adapter forwarding telemetry from upstream links to downstream senders
///
/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct ForwardingAdapter {
    inner: Arc<AdapterInner>,
}

#[derive(Debug)]
struct AdapterInner {
    settings: BridgeSettings,
    factory: Arc<dyn SenderFactory>,
    notifier: Arc<dyn FlowControlNotifier>,
    registry: Arc<ClientRegistry>,
    downstream: RwLock<Option<ConnectionRef>>,
    metrics: Arc<BridgeMetrics>,
}

impl ForwardingAdapter {
    pub fn new(
        settings: BridgeSettings,
        factory: Arc<dyn SenderFactory>,
        notifier: Arc<dyn FlowControlNotifier>,
    ) -> Self {
        Self::with_metrics(settings, factory, notifier, Arc::new(BridgeMetrics::new()))
    }

    pub fn with_metrics(
        settings: BridgeSettings,
        factory: Arc<dyn SenderFactory>,
        notifier: Arc<dyn FlowControlNotifier>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        info!("Creating forwarding adapter '{}'", settings.name);
        Self {
            inner: Arc::new(AdapterInner {
                settings,
                factory,
                notifier,
                registry: Arc::new(ClientRegistry::new()),
                downstream: RwLock::new(None),
                metrics,
            }),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    /// Install the downstream connection used for new senders
    pub fn set_downstream_connection(&self, connection: ConnectionRef) {
        info!("Downstream connection '{}' available", connection.name());
        *self.inner.downstream.write() = Some(connection);
    }

    pub fn has_downstream_connection(&self) -> bool {
        self.downstream_connection().is_some()
    }

    fn downstream_connection(&self) -> Option<ConnectionRef> {
        self.inner
            .downstream
            .read()
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    /// Attach an upstream client link to `target_address`
    ///
    /// Returns once the link is reserved; the initial credit announcement
    /// follows on the client's flow-control address when the downstream
    /// sender is ready.
    pub fn attach(
        &self,
        connection_id: &str,
        client_id: &str,
        target_address: &str,
        flow_control_prefix: &str,
    ) -> Result<()> {
        let key = ClientKey::new(connection_id, client_id);
        let fc_address = flow_control_address(flow_control_prefix, client_id);
        self.inner.metrics.record_attach_attempt();

        let Some(connection) = self.downstream_connection() else {
            warn!("No downstream connection for attach of {}", key);
            return self.reject(&key, &fc_address, BridgeError::NoDownstreamConnection);
        };

        let target = match ResourceIdentifier::parse(target_address) {
            Ok(target) => target,
            Err(err) => {
                warn!("Rejecting attach of {}: {}", key, err);
                return self.reject(&key, &fc_address, err);
            }
        };
        let downstream_address = target.downstream_address(&self.inner.settings.downstream_prefix);

        let (lane, handle) = self.new_lane(key.clone(), fc_address.clone());
        if let Err(err) = self.inner.registry.reserve(handle) {
            warn!("Rejecting attach of {}: {}", key, err);
            let shared = self
                .inner
                .registry
                .lookup_client(client_id)
                .is_some_and(|live| live.flow_control_address() == fc_address);
            if shared {
                self.inner.metrics.record_attach_failure();
                return Err(err);
            }
            return self.reject(&key, &fc_address, err);
        }

        info!("Attaching {} to {}", key, downstream_address);
        tokio::spawn(lane.run_attach(connection, downstream_address));
        Ok(())
    }

    /// Register a link around an already created sender
    ///
    /// The link starts `Active` and no initial credit is announced.
    pub fn add_sender(
        &self,
        connection_id: &str,
        client_id: &str,
        flow_control_prefix: &str,
        sender: SenderRef,
    ) -> Result<()> {
        let key = ClientKey::new(connection_id, client_id);
        let fc_address = flow_control_address(flow_control_prefix, client_id);

        let (lane, handle) = self.new_lane(key.clone(), fc_address);
        self.inner.registry.reserve(handle)?;

        debug!("Added existing sender for {}", key);
        tokio::spawn(lane.run_active(sender));
        Ok(())
    }

    /// Forward one message from `client_id` to its downstream sender
    ///
    /// Fails with `DownstreamConnectionLost` when the client has no link and
    /// the downstream connection is gone, `UnknownClient` otherwise.
    pub fn process_telemetry(&self, message: TelemetryMessage, client_id: &str) -> Result<()> {
        let Some(handle) = self.inner.registry.lookup_client(client_id) else {
            self.drop_message(client_id, &message, "no link registered");
            if !self.has_downstream_connection() {
                return Err(BridgeError::DownstreamConnectionLost);
            }
            return Err(BridgeError::unknown_client(client_id));
        };

        let phase = handle.phase();
        if !phase.is_forwarding() {
            self.drop_message(client_id, &message, &format!("link {}", phase));
            return Err(BridgeError::unknown_client(client_id));
        }

        if !handle.send(LinkCommand::Forward(message)) {
            warn!("Link for client {} already closed, dropping message", client_id);
            self.inner.metrics.record_dropped();
            return Err(BridgeError::unknown_client(client_id));
        }
        Ok(())
    }

    /// Re-announce credit for a link, as when its send queue drained
    pub fn handle_flow(&self, connection_id: &str, client_id: &str) -> Result<()> {
        let key = ClientKey::new(connection_id, client_id);
        let handle = self
            .inner
            .registry
            .get(&key)
            .ok_or_else(|| BridgeError::unknown_client(client_id))?;

        if !handle.request_replenish() {
            return Err(BridgeError::unknown_client(client_id));
        }
        Ok(())
    }

    /// Upstream detached one link; no notice is sent
    pub fn detach(&self, connection_id: &str, client_id: &str) -> bool {
        let key = ClientKey::new(connection_id, client_id);
        match self.inner.registry.remove(&key) {
            Some(handle) => {
                info!("Detaching {}", key);
                handle.send(LinkCommand::Close(CloseReason::Detached));
                true
            }
            None => {
                debug!("Detach of unknown link {}", key);
                false
            }
        }
    }

    /// Upstream connection closed; detach all of its links
    pub fn on_upstream_connection_closed(&self, connection_id: &str) -> usize {
        let handles = self.inner.registry.remove_connection(connection_id);
        if !handles.is_empty() {
            info!(
                "Upstream connection {} closed, detaching {} links",
                connection_id,
                handles.len()
            );
        }
        close_all(&handles, CloseReason::UpstreamClosed)
    }

    /// Downstream connection lost; every link is told to close and purged
    pub fn on_downstream_connection_lost(&self) -> usize {
        if let Some(connection) = self.inner.downstream.write().take() {
            error!("Downstream connection '{}' lost", connection.name());
        }

        let handles = self.inner.registry.drain_all();
        if !handles.is_empty() {
            warn!("Closing {} links after downstream connection loss", handles.len());
        }
        close_all(&handles, CloseReason::DownstreamLost)
    }

    /// Current phase of a link, `Unattached` if none is registered
    pub fn link_phase(&self, connection_id: &str, client_id: &str) -> LinkPhase {
        self.inner
            .registry
            .get(&ClientKey::new(connection_id, client_id))
            .map(|handle| handle.phase())
            .unwrap_or(LinkPhase::Unattached)
    }

    /// Subscribe to phase changes of a registered link
    pub fn watch_link(&self, connection_id: &str, client_id: &str) -> Option<watch::Receiver<LinkPhase>> {
        self.inner
            .registry
            .get(&ClientKey::new(connection_id, client_id))
            .map(|handle| handle.watch_phase())
    }

    pub fn is_attached(&self, client_id: &str) -> bool {
        self.inner.registry.contains_client(client_id)
    }

    pub fn link_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        self.inner.metrics.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn new_lane(&self, key: ClientKey, fc_address: String) -> (LinkLane, LinkHandle) {
        let link_id = self.inner.registry.allocate_link_id();
        LinkLane::new(key, link_id, fc_address, self.lane_context())
    }

    fn lane_context(&self) -> LaneContext {
        LaneContext {
            factory: self.inner.factory.clone(),
            notifier: self.inner.notifier.clone(),
            registry: self.inner.registry.clone(),
            metrics: self.inner.metrics.clone(),
            drain_ack_timeout: self.inner.settings.drain_ack_timeout(),
            sender_create_timeout: self.inner.settings.sender_create_timeout(),
        }
    }

    fn reject(&self, key: &ClientKey, fc_address: &str, err: BridgeError) -> Result<()> {
        let metrics = &self.inner.metrics;
        metrics.record_attach_failure();
        metrics.record_error_notice();

        let notice = UpstreamNotice::close_link(key.client_id());
        if let Err(notify_err) = self.inner.notifier.publish(fc_address, &notice) {
            warn!("Failed to deliver error notice for {}: {}", key, notify_err);
            metrics.record_notify_failure();
        }
        Err(err)
    }

    fn drop_message(&self, client_id: &str, message: &TelemetryMessage, why: &str) {
        warn!(
            "Dropping message from client {} (device {}): {}",
            client_id,
            message.device_id().unwrap_or("unknown"),
            why
        );
        self.inner.metrics.record_dropped();
    }
}

fn close_all(handles: &[LinkHandle], reason: CloseReason) -> usize {
    handles
        .iter()
        .filter(|handle| handle.send(LinkCommand::Close(reason)))
        .count()
}
