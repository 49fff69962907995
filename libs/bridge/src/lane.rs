//! Per-client link lane
//!
//! Every link runs as one task that exclusively owns its [`ClientLinkState`].
//! Forwards, drain callbacks and close requests arrive as [`LinkCommand`]s on
//! an unbounded queue and are handled strictly in order.
//!
//! While a drain request waits for its acknowledgement the lane keeps
//! reading its queue: a close request abandons the wait, anything else is
//! deferred until the wait ends.
//!
//! The drain callback registered on the downstream sender only holds a weak
//! reference to the queue, so a sender outliving its link never keeps the
//! lane alive.

use crate::downstream::{ConnectionRef, DrainCallback, SenderFactory, SenderRef};
use crate::flow_control::{available_credit, LinkPhase, UpstreamNotice};
use crate::metrics::BridgeMetrics;
use crate::notifier::FlowControlNotifier;
use crate::registry::{ClientKey, ClientRegistry, LinkHandle};
use crate::{BridgeError, Result, TelemetryMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Work item for a link lane
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Forward(TelemetryMessage),
    /// Re-read sender state and announce credit
    Replenish,
    Close(CloseReason),
}

/// Why a link is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Upstream detached the link
    Detached,
    /// Upstream connection closed
    UpstreamClosed,
    /// Downstream connection lost
    DownstreamLost,
    /// Downstream sender closed or refused a message
    SenderClosed,
}

impl CloseReason {
    /// Upstream still holds the link and must be told to close it
    pub fn owes_notice(self) -> bool {
        matches!(self, CloseReason::DownstreamLost | CloseReason::SenderClosed)
    }
}

/// State of an attached link, owned by its lane
#[derive(Debug)]
pub(crate) struct ClientLinkState {
    sender: SenderRef,
    last_announced_credit: u32,
    drain_requested: bool,
    flow_control_address: String,
}

/// Collaborators shared by every lane
#[derive(Debug, Clone)]
pub(crate) struct LaneContext {
    pub factory: Arc<dyn SenderFactory>,
    pub notifier: Arc<dyn FlowControlNotifier>,
    pub registry: Arc<ClientRegistry>,
    pub metrics: Arc<BridgeMetrics>,
    pub drain_ack_timeout: Duration,
    pub sender_create_timeout: Duration,
}

enum AttachOutcome {
    Created(SenderRef),
    Failed(BridgeError),
    Cancelled(CloseReason),
}

pub(crate) struct LinkLane {
    key: ClientKey,
    link_id: u64,
    flow_control_address: String,
    ctx: LaneContext,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    deferred: VecDeque<LinkCommand>,
    weak_tx: mpsc::WeakUnboundedSender<LinkCommand>,
    replenish_pending: Arc<AtomicBool>,
    phase: watch::Sender<LinkPhase>,
}

impl LinkLane {
    /// Create a lane in phase `Attaching` together with its registry handle
    pub(crate) fn new(
        key: ClientKey,
        link_id: u64,
        flow_control_address: String,
        ctx: LaneContext,
    ) -> (Self, LinkHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (phase, phase_rx) = watch::channel(LinkPhase::Unattached);
        let replenish_pending = Arc::new(AtomicBool::new(false));

        let handle = LinkHandle::new(
            key.clone(),
            link_id,
            flow_control_address.clone(),
            tx.clone(),
            replenish_pending.clone(),
            phase_rx,
        );
        let lane = Self {
            key,
            link_id,
            flow_control_address,
            ctx,
            commands,
            deferred: VecDeque::new(),
            weak_tx: tx.downgrade(),
            replenish_pending,
            phase,
        };
        lane.transition(LinkPhase::Attaching);
        (lane, handle)
    }

    /// Create the downstream sender, announce initial credit, then serve
    pub(crate) async fn run_attach(mut self, connection: ConnectionRef, downstream_address: String) {
        match self.create_sender(connection, downstream_address).await {
            AttachOutcome::Created(sender) => {
                let state = self.activate(sender, true);
                self.serve(state).await;
            }
            AttachOutcome::Failed(err) => {
                error!("Attach of {} failed: {}", self.key, err);
                self.ctx.metrics.record_attach_failure();
                self.finish(false, true);
            }
            AttachOutcome::Cancelled(reason) => {
                info!("Attach of {} cancelled: {:?}", self.key, reason);
                if reason.owes_notice() {
                    self.ctx.metrics.record_attach_failure();
                }
                self.finish(false, reason.owes_notice());
            }
        }
    }

    /// Serve a link around a sender that already exists, without announcing
    pub(crate) async fn run_active(mut self, sender: SenderRef) {
        sender.set_drain_callback(self.drain_callback());
        let state = self.activate(sender, false);
        self.serve(state).await;
    }

    async fn create_sender(
        &mut self,
        connection: ConnectionRef,
        downstream_address: String,
    ) -> AttachOutcome {
        let timeout = self.ctx.sender_create_timeout;
        let factory = self.ctx.factory.clone();
        let on_drain = self.drain_callback();
        let address = downstream_address.clone();

        debug!("Requesting downstream sender for {} at {}", self.key, downstream_address);
        let creation = tokio::time::timeout(timeout, async move {
            factory.create_sender(connection, &address, on_drain).await
        });
        tokio::pin!(creation);

        loop {
            tokio::select! {
                result = &mut creation => {
                    return match result {
                        Ok(Ok(sender)) => AttachOutcome::Created(sender),
                        Ok(Err(err)) => AttachOutcome::Failed(err),
                        Err(_) => AttachOutcome::Failed(BridgeError::SenderCreationTimeout {
                            address: downstream_address,
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Forward(_)) => {
                        warn!("Dropping message for {}: link still attaching", self.key);
                        self.ctx.metrics.record_dropped();
                    }
                    Some(LinkCommand::Replenish) => {}
                    Some(LinkCommand::Close(reason)) => return AttachOutcome::Cancelled(reason),
                    None => return AttachOutcome::Cancelled(CloseReason::Detached),
                },
            }
        }
    }

    fn activate(&mut self, sender: SenderRef, announce: bool) -> ClientLinkState {
        // Drain callbacks seen so far are covered by the initial credit
        self.replenish_pending.store(false, Ordering::SeqCst);
        let credits = available_credit(sender.as_ref());

        let state = ClientLinkState {
            sender,
            last_announced_credit: credits,
            drain_requested: false,
            flow_control_address: self.flow_control_address.clone(),
        };
        self.transition(LinkPhase::Active);
        self.ctx.metrics.record_link_opened();
        info!("Link {} active with {} credits", self.key, credits);

        if announce {
            self.ctx.metrics.record_flow_control(false);
            self.publish(&UpstreamNotice::flow_control(self.key.client_id(), credits, false));
        }
        state
    }

    async fn serve(&mut self, mut state: ClientLinkState) {
        loop {
            let command = match self.deferred.pop_front() {
                Some(command) => Some(command),
                None => self.commands.recv().await,
            };
            let reason = match command {
                Some(LinkCommand::Forward(message)) => match self.forward(&state, message) {
                    Ok(()) => continue,
                    Err(err) if err.is_terminal_for_link() => {
                        error!("Forwarding for {} failed: {}", self.key, err);
                        CloseReason::SenderClosed
                    }
                    Err(err) => {
                        warn!("Message for {} not forwarded: {}", self.key, err);
                        continue;
                    }
                },
                Some(LinkCommand::Replenish) => {
                    if !self.replenish_pending.swap(false, Ordering::SeqCst) {
                        continue;
                    }
                    if !state.sender.is_open() {
                        warn!("Sender for {} closed while replenishing", self.key);
                        CloseReason::SenderClosed
                    } else {
                        match self.announce(&mut state).await {
                            Some(reason) => reason,
                            None => continue,
                        }
                    }
                }
                Some(LinkCommand::Close(reason)) => reason,
                None => CloseReason::Detached,
            };

            self.close(state, reason);
            return;
        }
    }

    fn forward(&self, state: &ClientLinkState, message: TelemetryMessage) -> Result<()> {
        if !state.sender.is_open() {
            self.ctx.metrics.record_dropped();
            return Err(BridgeError::SendFailed(format!(
                "sender for {} is closed",
                self.key
            )));
        }

        if let Err(err) = state.sender.send(message) {
            self.ctx.metrics.record_dropped();
            return Err(err);
        }
        self.ctx.metrics.record_forwarded();
        Ok(())
    }

    /// Announce current credit; `Some` when a close arrived during a drain wait
    async fn announce(&mut self, state: &mut ClientLinkState) -> Option<CloseReason> {
        let credits = available_credit(state.sender.as_ref());
        let drain = state.sender.drain();
        state.last_announced_credit = credits;
        state.drain_requested = drain;

        let notice = UpstreamNotice::flow_control(self.key.client_id(), credits, drain);
        self.ctx.metrics.record_flow_control(drain);

        if !drain {
            debug!("Replenishing {} with {} credits", self.key, credits);
            self.publish(&notice);
            return None;
        }

        self.transition(LinkPhase::Draining);
        debug!("Forwarding drain request to {} with {} credits", self.key, credits);
        let closed = {
            let request = self.ctx.notifier.request(
                &state.flow_control_address,
                &notice,
                self.ctx.drain_ack_timeout,
            );
            tokio::pin!(request);

            loop {
                tokio::select! {
                    result = &mut request => {
                        if let Err(err) = result {
                            warn!("Drain request for {} not acknowledged: {}", self.key, err);
                            self.ctx.metrics.record_notify_failure();
                        }
                        break None;
                    }
                    command = self.commands.recv() => match command {
                        Some(LinkCommand::Close(reason)) => break Some(reason),
                        None => break Some(CloseReason::Detached),
                        Some(command) => self.deferred.push_back(command),
                    },
                }
            }
        };

        if let Some(reason) = closed {
            debug!("Drain request for {} abandoned: {:?}", self.key, reason);
            return Some(reason);
        }
        state.drain_requested = false;
        self.transition(LinkPhase::Active);
        None
    }

    fn close(&mut self, state: ClientLinkState, reason: CloseReason) {
        state.sender.close();
        for command in self.deferred.drain(..) {
            if let LinkCommand::Forward(_) = command {
                self.ctx.metrics.record_dropped();
            }
        }
        info!(
            "Link {} closed ({:?}, last credit {}, drain pending {})",
            self.key, reason, state.last_announced_credit, state.drain_requested
        );
        self.finish(true, reason.owes_notice());
    }

    /// Unregister the link, then tell upstream to close it if `notify`
    ///
    /// The registry entry is gone before the notice goes out so a client
    /// re-attaching on the notice never sees its old link.
    fn finish(&mut self, was_active: bool, notify: bool) {
        self.ctx.registry.remove_link(&self.key, self.link_id);
        if notify {
            self.notify_close();
        }
        self.transition(LinkPhase::Closed);
        if was_active {
            self.ctx.metrics.record_link_closed();
        }
    }

    fn notify_close(&self) {
        self.ctx.metrics.record_error_notice();
        self.publish(&UpstreamNotice::close_link(self.key.client_id()));
    }

    fn publish(&self, notice: &UpstreamNotice) {
        if let Err(err) = self.ctx.notifier.publish(&self.flow_control_address, notice) {
            warn!(
                "Failed to deliver notice for {} on {}: {}",
                self.key, self.flow_control_address, err
            );
            self.ctx.metrics.record_notify_failure();
        }
    }

    fn transition(&self, next: LinkPhase) -> bool {
        let current = *self.phase.borrow();
        if !current.can_transition_to(next) {
            warn!("Rejected transition {} -> {} for {}", current, next, self.key);
            return false;
        }
        debug!("Link {}: {} -> {}", self.key, current, next);
        self.phase.send_replace(next);
        true
    }

    fn drain_callback(&self) -> DrainCallback {
        let pending = self.replenish_pending.clone();
        let tx = self.weak_tx.clone();
        Arc::new(move || {
            if pending.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(LinkCommand::Replenish);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockSender, RecordingNotifier, StubSenderFactory};

    fn context(factory: Arc<StubSenderFactory>, notifier: Arc<RecordingNotifier>) -> LaneContext {
        context_with_ack(factory, notifier, Duration::from_millis(100))
    }

    fn context_with_ack(
        factory: Arc<StubSenderFactory>,
        notifier: Arc<RecordingNotifier>,
        drain_ack_timeout: Duration,
    ) -> LaneContext {
        LaneContext {
            factory,
            notifier,
            registry: Arc::new(ClientRegistry::new()),
            metrics: Arc::new(BridgeMetrics::new()),
            drain_ack_timeout,
            sender_create_timeout: Duration::from_millis(100),
        }
    }

    /// Spawn an active lane around `sender` and wait until it serves
    async fn serve_active(
        ctx: &LaneContext,
        sender: Arc<MockSender>,
    ) -> (LinkHandle, watch::Receiver<LinkPhase>) {
        let (lane, handle) =
            LinkLane::new(ClientKey::new("con", "c1"), 1, "fc.c1".to_string(), ctx.clone());
        ctx.registry.reserve(handle.clone()).unwrap();
        let mut phase = handle.watch_phase();
        tokio::spawn(lane.run_active(sender));
        phase.wait_for(|p| *p == LinkPhase::Active).await.unwrap();
        (handle, phase)
    }

    #[test]
    fn test_close_reason_notice() {
        assert!(CloseReason::DownstreamLost.owes_notice());
        assert!(CloseReason::SenderClosed.owes_notice());
        assert!(!CloseReason::Detached.owes_notice());
        assert!(!CloseReason::UpstreamClosed.owes_notice());
    }

    #[tokio::test]
    async fn test_new_lane_is_attaching() {
        let sender = MockSender::new(5);
        let ctx = context(
            Arc::new(StubSenderFactory::succeeding(sender)),
            Arc::new(RecordingNotifier::new()),
        );
        let (_lane, handle) =
            LinkLane::new(ClientKey::new("con", "c1"), 1, "fc.c1".to_string(), ctx);
        assert_eq!(handle.phase(), LinkPhase::Attaching);
    }

    #[tokio::test]
    async fn test_drain_callbacks_coalesce() {
        let sender = MockSender::new(5);
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = context(
            Arc::new(StubSenderFactory::succeeding(sender.clone())),
            notifier.clone(),
        );
        let (lane, handle) =
            LinkLane::new(ClientKey::new("con", "c1"), 1, "fc.c1".to_string(), ctx.clone());
        ctx.registry.reserve(handle.clone()).unwrap();
        let mut phase = handle.watch_phase();

        tokio::spawn(lane.run_active(sender.clone()));
        phase.wait_for(|p| *p == LinkPhase::Active).await.unwrap();

        // Burst before the lane gets to run
        sender.set_queued(2);
        sender.fire_drain();
        sender.fire_drain();
        sender.fire_drain();

        notifier.wait_for(1).await;
        tokio::task::yield_now().await;
        let announced = notifier.flow_control();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].credits, 3);

        assert!(handle.send(LinkCommand::Close(CloseReason::Detached)));
        phase.wait_for(|p| p.is_closed()).await.unwrap();
        assert!(sender.is_closed());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_transient_send_error_keeps_link() {
        let sender = MockSender::new(5);
        let ctx = context(
            Arc::new(StubSenderFactory::succeeding(sender.clone())),
            Arc::new(RecordingNotifier::new()),
        );
        let (handle, _phase) = serve_active(&ctx, sender.clone()).await;

        sender.fail_next_with(BridgeError::ChannelClosed("busy".to_string()));
        assert!(handle.send(LinkCommand::Forward(TelemetryMessage::new("lost"))));
        assert!(handle.send(LinkCommand::Forward(TelemetryMessage::new("kept"))));

        sender.wait_for_sent(1).await;
        assert_eq!(&sender.sent_messages()[0].payload[..], b"kept");
        assert_eq!(handle.phase(), LinkPhase::Active);
        assert!(!sender.is_closed());
        assert_eq!(ctx.metrics.snapshot().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_forwards_wait_for_drain_ack() {
        let sender = MockSender::new(5);
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = context_with_ack(
            Arc::new(StubSenderFactory::succeeding(sender.clone())),
            notifier.clone(),
            Duration::from_secs(10),
        );
        let (handle, mut phase) = serve_active(&ctx, sender.clone()).await;

        notifier.hold_requests();
        sender.set_drain(true);
        sender.fire_drain();
        notifier.wait_for(1).await;
        phase.wait_for(|p| *p == LinkPhase::Draining).await.unwrap();

        assert!(handle.send(LinkCommand::Forward(TelemetryMessage::new("during drain"))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sender.sent_count(), 0);

        notifier.release_requests();
        sender.wait_for_sent(1).await;
        phase.wait_for(|p| *p == LinkPhase::Active).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_abandons_drain_wait() {
        let sender = MockSender::new(5);
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = context_with_ack(
            Arc::new(StubSenderFactory::succeeding(sender.clone())),
            notifier.clone(),
            Duration::from_secs(10),
        );
        let (handle, mut phase) = serve_active(&ctx, sender.clone()).await;

        notifier.hold_requests();
        sender.set_drain(true);
        sender.fire_drain();
        notifier.wait_for(1).await;

        assert!(handle.send(LinkCommand::Forward(TelemetryMessage::new("stale"))));
        assert!(handle.send(LinkCommand::Close(CloseReason::DownstreamLost)));

        tokio::time::timeout(Duration::from_secs(1), phase.wait_for(|p| p.is_closed()))
            .await
            .expect("close waited for the drain ack")
            .unwrap();
        assert_eq!(notifier.errors().len(), 1);
        assert_eq!(sender.sent_count(), 0);
        assert!(sender.is_closed());
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.metrics.snapshot().messages_dropped, 1);
    }
}
