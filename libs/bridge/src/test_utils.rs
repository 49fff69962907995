//! Test doubles for the bridge's collaborators

use crate::downstream::{ConnectionRef, DownstreamConnection, DownstreamSender, DrainCallback, SenderFactory, SenderRef};
use crate::flow_control::{ErrorMessage, FlowControlMessage, UpstreamNotice};
use crate::notifier::FlowControlNotifier;
use crate::{BridgeError, Result, TelemetryMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Downstream connection that only reports an open flag
#[derive(Debug)]
pub struct StubConnection {
    name: String,
    open: AtomicBool,
}

impl StubConnection {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            open: AtomicBool::new(true),
        })
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl DownstreamConnection for StubConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Downstream sender with settable credit state that collects sent messages
pub struct MockSender {
    credit: AtomicU32,
    queued: AtomicU32,
    drain: AtomicBool,
    open: AtomicBool,
    fail_on_send: AtomicBool,
    next_error: Mutex<Option<BridgeError>>,
    close_calls: AtomicUsize,
    sent: Mutex<Vec<TelemetryMessage>>,
    on_drain: Mutex<Option<DrainCallback>>,
    sent_notify: Notify,
}

impl fmt::Debug for MockSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSender")
            .field("credit", &self.credit())
            .field("queued", &self.queued())
            .field("drain", &self.drain())
            .field("open", &self.is_open())
            .field("sent", &self.sent_count())
            .finish_non_exhaustive()
    }
}

impl MockSender {
    /// Create an open sender granting `credit`
    pub fn new(credit: u32) -> Arc<Self> {
        Arc::new(Self {
            credit: AtomicU32::new(credit),
            queued: AtomicU32::new(0),
            drain: AtomicBool::new(false),
            open: AtomicBool::new(true),
            fail_on_send: AtomicBool::new(false),
            next_error: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            on_drain: Mutex::new(None),
            sent_notify: Notify::new(),
        })
    }

    pub fn set_credit(&self, credit: u32) {
        self.credit.store(credit, Ordering::SeqCst);
    }

    pub fn set_queued(&self, queued: u32) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    pub fn set_drain(&self, drain: bool) {
        self.drain.store(drain, Ordering::SeqCst);
    }

    /// Mark the sender closed without going through `close`
    pub fn force_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Configure every following send to fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_on_send.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next send with `err`
    pub fn fail_next_with(&self, err: BridgeError) {
        *self.next_error.lock() = Some(err);
    }

    /// Invoke the registered drain callback, if any
    pub fn fire_drain(&self) {
        let callback = self.on_drain.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn has_drain_callback(&self) -> bool {
        self.on_drain.lock().is_some()
    }

    pub fn sent_messages(&self) -> Vec<TelemetryMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were sent
    pub async fn wait_for_sent(&self, count: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.sent_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl DownstreamSender for MockSender {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn credit(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }

    fn queued(&self) -> u32 {
        self.queued.load(Ordering::SeqCst)
    }

    fn drain(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }

    fn send(&self, message: TelemetryMessage) -> Result<()> {
        if !self.is_open() || self.fail_on_send.load(Ordering::SeqCst) {
            return Err(BridgeError::SendFailed("mock sender refused message".to_string()));
        }
        if let Some(err) = self.next_error.lock().take() {
            return Err(err);
        }
        self.sent.lock().push(message);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    fn set_drain_callback(&self, callback: DrainCallback) {
        *self.on_drain.lock() = Some(callback);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum StubOutcome {
    Succeed(Arc<MockSender>),
    Fail(String),
    Hang,
}

/// Sender factory completing with a preconfigured outcome
#[derive(Debug)]
pub struct StubSenderFactory {
    outcome: StubOutcome,
    drain_on_open: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    addresses: Mutex<Vec<String>>,
}

impl StubSenderFactory {
    fn with_outcome(outcome: StubOutcome) -> Self {
        Self {
            outcome,
            drain_on_open: false,
            delay: None,
            calls: AtomicUsize::new(0),
            addresses: Mutex::new(Vec::new()),
        }
    }

    /// Complete with `sender`
    pub fn succeeding(sender: Arc<MockSender>) -> Self {
        Self::with_outcome(StubOutcome::Succeed(sender))
    }

    /// Fail every request with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_outcome(StubOutcome::Fail(reason.into()))
    }

    /// Never complete
    pub fn hanging() -> Self {
        Self::with_outcome(StubOutcome::Hang)
    }

    /// Fire the drain callback as soon as the sender opens, before completing
    pub fn with_drain_on_open(mut self) -> Self {
        self.drain_on_open = true;
        self
    }

    /// Wait before completing
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested_addresses(&self) -> Vec<String> {
        self.addresses.lock().clone()
    }
}

#[async_trait]
impl SenderFactory for StubSenderFactory {
    async fn create_sender(
        &self,
        _connection: ConnectionRef,
        address: &str,
        on_drain: DrainCallback,
    ) -> Result<SenderRef> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().push(address.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.outcome.clone() {
            StubOutcome::Succeed(sender) => {
                sender.set_drain_callback(on_drain);
                if self.drain_on_open {
                    sender.fire_drain();
                }
                Ok(sender as SenderRef)
            }
            StubOutcome::Fail(reason) => Err(BridgeError::sender_creation_failed(address, reason)),
            StubOutcome::Hang => std::future::pending().await,
        }
    }
}

/// One notice captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedNotice {
    pub address: String,
    pub notice: UpstreamNotice,
    /// Sent as a request awaiting acknowledgement
    pub acked: bool,
}

/// Notifier that records every notice instead of delivering it
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<RecordedNotice>>,
    fail_requests: AtomicBool,
    hold_requests: AtomicBool,
    released: Notify,
    notify: Notify,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make drain requests fail as if the ack timed out
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Keep drain requests unanswered until released or timed out
    pub fn hold_requests(&self) {
        self.hold_requests.store(true, Ordering::SeqCst);
    }

    /// Acknowledge every held request
    pub fn release_requests(&self) {
        self.hold_requests.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    pub fn notices(&self) -> Vec<RecordedNotice> {
        self.notices.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.notices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.lock().is_empty()
    }

    pub fn flow_control(&self) -> Vec<FlowControlMessage> {
        self.notices
            .lock()
            .iter()
            .filter_map(|recorded| match &recorded.notice {
                UpstreamNotice::FlowControl(msg) => Some(msg.clone()),
                UpstreamNotice::Error(_) => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorMessage> {
        self.notices
            .lock()
            .iter()
            .filter_map(|recorded| match &recorded.notice {
                UpstreamNotice::Error(msg) => Some(msg.clone()),
                UpstreamNotice::FlowControl(_) => None,
            })
            .collect()
    }

    /// Wait until at least `count` notices were recorded
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, address: &str, notice: &UpstreamNotice, acked: bool) {
        self.notices.lock().push(RecordedNotice {
            address: address.to_string(),
            notice: notice.clone(),
            acked,
        });
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl FlowControlNotifier for RecordingNotifier {
    fn publish(&self, address: &str, notice: &UpstreamNotice) -> Result<()> {
        self.record(address, notice, false);
        Ok(())
    }

    async fn request(
        &self,
        address: &str,
        notice: &UpstreamNotice,
        timeout: Duration,
    ) -> Result<()> {
        let timed_out = || BridgeError::AckTimeout {
            address: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let failed = self.fail_requests.load(Ordering::SeqCst);
        self.record(address, notice, !failed);
        if failed {
            return Err(timed_out());
        }

        let released = async {
            loop {
                let notified = self.released.notified();
                if !self.hold_requests.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, released)
            .await
            .map_err(|_| timed_out())
    }
}
