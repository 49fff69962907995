//! In-process downstream backend
//!
//! Stands in for a real messaging backend in development runs and tests.
//! Every sender owns a bounded channel whose free slots are its credit;
//! messages accepted while the window is full wait in a local overflow queue
//! and count as `queued`. When the consumer frees a slot the overflow is moved
//! into the window and, once it is empty, the drain callback fires.

use super::{ConnectionRef, DrainCallback, DownstreamConnection, DownstreamSender, SenderFactory, SenderRef};
use crate::{BridgeError, Result, TelemetryMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// In-memory downstream connection
#[derive(Debug)]
pub struct MemoryConnection {
    name: String,
    window: usize,
    open: AtomicBool,
    accepted_tx: mpsc::UnboundedSender<MemoryReceiver>,
    accepted_rx: Mutex<Option<mpsc::UnboundedReceiver<MemoryReceiver>>>,
}

impl MemoryConnection {
    /// Create an open connection whose senders get `window` credit each
    pub fn new(name: impl Into<String>, window: usize) -> Result<Arc<Self>> {
        if window == 0 {
            return Err(BridgeError::invalid_config("memory window must be greater than 0"));
        }

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            name: name.into(),
            window,
            open: AtomicBool::new(true),
            accepted_tx,
            accepted_rx: Mutex::new(Some(accepted_rx)),
        }))
    }

    /// Take the stream of receivers for senders opened on this connection
    ///
    /// Returns `None` after the first call.
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<MemoryReceiver>> {
        self.accepted_rx.lock().take()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Mark the connection closed; senders already open keep working
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Memory connection '{}' closed", self.name);
        }
    }

    /// Open a sender targeting `address`
    pub fn open_sender(&self, address: &str) -> Result<Arc<MemorySender>> {
        if !self.is_open() {
            return Err(BridgeError::sender_creation_failed(address, "connection closed"));
        }

        let (tx, rx) = mpsc::channel(self.window);
        let sender = Arc::new(MemorySender {
            address: address.to_string(),
            tx: Mutex::new(Some(tx)),
            overflow: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
            drain: AtomicBool::new(false),
            on_drain: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
        });

        let receiver = MemoryReceiver {
            address: address.to_string(),
            rx,
            sender: Arc::downgrade(&sender),
        };
        if self.accepted_tx.send(receiver).is_err() {
            debug!("No consumer accepting links on '{}', dropping receiver", self.name);
        }

        debug!("Opened memory sender on '{}' for {}", self.name, address);
        Ok(sender)
    }
}

impl DownstreamConnection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Sender side of an in-memory downstream link
pub struct MemorySender {
    address: String,
    tx: Mutex<Option<mpsc::Sender<TelemetryMessage>>>,
    overflow: Mutex<VecDeque<TelemetryMessage>>,
    open: AtomicBool,
    drain: AtomicBool,
    on_drain: Mutex<Option<DrainCallback>>,
    messages_sent: AtomicU64,
}

impl fmt::Debug for MemorySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySender")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .field("credit", &self.credit())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl MemorySender {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Messages moved into the window so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Move overflow into free window slots, firing the drain callback once
    /// the overflow is empty
    fn pump(&self) {
        let drained = {
            let tx_guard = self.tx.lock();
            let Some(tx) = tx_guard.as_ref() else {
                return;
            };
            let mut overflow = self.overflow.lock();
            while !overflow.is_empty() {
                match tx.try_reserve() {
                    Ok(permit) => {
                        if let Some(message) = overflow.pop_front() {
                            permit.send(message);
                            self.messages_sent.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(_) => break,
                }
            }
            overflow.is_empty()
        };

        if drained {
            self.fire_drain_callback();
        }
    }

    fn set_drain_flag(&self, drain: bool) {
        self.drain.store(drain, Ordering::SeqCst);
        self.fire_drain_callback();
    }

    fn fire_drain_callback(&self) {
        let callback = self.on_drain.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl DownstreamSender for MemorySender {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.tx.lock().as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    fn credit(&self) -> u32 {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| tx.capacity() as u32)
            .unwrap_or(0)
    }

    fn queued(&self) -> u32 {
        self.overflow.lock().len() as u32
    }

    fn drain(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }

    fn send(&self, message: TelemetryMessage) -> Result<()> {
        let tx_guard = self.tx.lock();
        let tx = match tx_guard.as_ref() {
            Some(tx) if self.open.load(Ordering::SeqCst) => tx,
            _ => {
                return Err(BridgeError::SendFailed(format!(
                    "sender for {} is closed",
                    self.address
                )))
            }
        };

        let mut overflow = self.overflow.lock();
        if !overflow.is_empty() {
            overflow.push_back(message);
            return Ok(());
        }

        match tx.try_send(message) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                overflow.push_back(message);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(BridgeError::SendFailed(format!(
                    "receiver for {} is gone",
                    self.address
                )))
            }
        }
    }

    fn set_drain_callback(&self, callback: DrainCallback) {
        *self.on_drain.lock() = Some(callback);
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.tx.lock().take();
            self.on_drain.lock().take();
            debug!("Memory sender for {} closed", self.address);
        }
    }
}

/// Consumer side of an in-memory downstream link
#[derive(Debug)]
pub struct MemoryReceiver {
    address: String,
    rx: mpsc::Receiver<TelemetryMessage>,
    sender: Weak<MemorySender>,
}

impl MemoryReceiver {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Receive the next message, granting its slot back to the sender
    ///
    /// Returns `None` once the sender is closed and the window is empty.
    pub async fn recv(&mut self) -> Option<TelemetryMessage> {
        let message = self.rx.recv().await?;
        if let Some(sender) = self.sender.upgrade() {
            sender.pump();
        }
        Some(message)
    }

    /// Ask the sender to use up its remaining credit
    pub fn request_drain(&self) {
        if let Some(sender) = self.sender.upgrade() {
            sender.set_drain_flag(true);
        }
    }

    /// Drain completed from the consumer's point of view
    pub fn clear_drain(&self) {
        if let Some(sender) = self.sender.upgrade() {
            sender.drain.store(false, Ordering::SeqCst);
        }
    }
}

/// Sender factory opening [`MemorySender`]s on a [`MemoryConnection`]
#[derive(Debug, Clone)]
pub struct MemorySenderFactory {
    connection: Arc<MemoryConnection>,
}

impl MemorySenderFactory {
    pub fn new(connection: Arc<MemoryConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SenderFactory for MemorySenderFactory {
    async fn create_sender(
        &self,
        connection: ConnectionRef,
        address: &str,
        on_drain: DrainCallback,
    ) -> Result<SenderRef> {
        if !connection.is_open() {
            return Err(BridgeError::sender_creation_failed(
                address,
                format!("connection '{}' is closed", connection.name()),
            ));
        }

        let sender = self.connection.open_sender(address)?;
        sender.set_drain_callback(on_drain);
        Ok(sender as SenderRef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback() -> (DrainCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback: DrainCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[tokio::test]
    async fn test_window_and_overflow() {
        let connection = MemoryConnection::new("test", 2).unwrap();
        let mut incoming = connection.incoming().unwrap();
        let sender = connection.open_sender("telemetry/myTenant").unwrap();
        let _receiver = incoming.recv().await.unwrap();

        assert_eq!(sender.credit(), 2);
        assert_eq!(sender.queued(), 0);

        for i in 0..3u8 {
            sender.send(TelemetryMessage::new(vec![i])).unwrap();
        }

        assert_eq!(sender.credit(), 0);
        assert_eq!(sender.queued(), 1);
        assert_eq!(sender.messages_sent(), 2);
    }

    #[tokio::test]
    async fn test_recv_pumps_overflow_and_fires_callback() {
        let connection = MemoryConnection::new("test", 1).unwrap();
        let mut incoming = connection.incoming().unwrap();
        let sender = connection.open_sender("telemetry/myTenant").unwrap();
        let mut receiver = incoming.recv().await.unwrap();
        let (callback, fired) = counting_callback();
        sender.set_drain_callback(callback);

        sender.send(TelemetryMessage::new("first")).unwrap();
        sender.send(TelemetryMessage::new("second")).unwrap();
        assert_eq!(sender.queued(), 1);

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.payload, "first");
        assert_eq!(sender.queued(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let second = receiver.recv().await.unwrap();
        assert_eq!(second.payload, "second");
        assert_eq!(sender.credit(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drain_request_sets_flag() {
        let connection = MemoryConnection::new("test", 4).unwrap();
        let mut incoming = connection.incoming().unwrap();
        let sender = connection.open_sender("telemetry/myTenant").unwrap();
        let receiver = incoming.recv().await.unwrap();
        let (callback, fired) = counting_callback();
        sender.set_drain_callback(callback);

        receiver.request_drain();
        assert!(sender.drain());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        receiver.clear_drain();
        assert!(!sender.drain());
    }

    #[tokio::test]
    async fn test_close_ends_receiver() {
        let connection = MemoryConnection::new("test", 4).unwrap();
        let mut incoming = connection.incoming().unwrap();
        let sender = connection.open_sender("telemetry/myTenant").unwrap();
        let mut receiver = incoming.recv().await.unwrap();

        sender.send(TelemetryMessage::new("last")).unwrap();
        sender.close();

        assert!(!sender.is_open());
        assert_eq!(sender.credit(), 0);
        assert!(sender.send(TelemetryMessage::new("late")).is_err());
        assert_eq!(receiver.recv().await.unwrap().payload, "last");
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_sender() {
        let connection = MemoryConnection::new("test", 4).unwrap();
        let mut incoming = connection.incoming().unwrap();
        let sender = connection.open_sender("telemetry/myTenant").unwrap();
        drop(incoming.recv().await.unwrap());

        assert!(!sender.is_open());
        assert!(matches!(
            sender.send(TelemetryMessage::new("x")),
            Err(BridgeError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_factory_registers_callback_and_refuses_closed_connection() {
        let connection = MemoryConnection::new("test", 3).unwrap();
        let mut incoming = connection.incoming().unwrap();
        let factory = MemorySenderFactory::new(connection.clone());
        let (callback, fired) = counting_callback();

        let sender = factory
            .create_sender(connection.clone(), "telemetry/myTenant", callback)
            .await
            .unwrap();
        let receiver = incoming.recv().await.unwrap();
        assert_eq!(receiver.address(), "telemetry/myTenant");
        assert_eq!(sender.credit(), 3);

        receiver.request_drain();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        connection.close();
        let (callback, _) = counting_callback();
        let result = factory
            .create_sender(connection.clone(), "telemetry/myTenant", callback)
            .await;
        assert!(matches!(result, Err(BridgeError::SenderCreationFailed { .. })));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(MemoryConnection::new("test", 0).is_err());
    }
}
