//! Point-to-point in-process bus for upstream flow-control channels
//!
//! Each address has at most one consumer (the upstream link handler for that
//! client). `send` is fire-and-forget; `request` waits until the consumer
//! acknowledges the message or the timeout elapses.

use crate::{BridgeError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Message delivered to an address consumer
#[derive(Debug)]
pub struct BusMessage {
    pub address: String,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<()>>,
}

impl BusMessage {
    /// Whether the sender is waiting for an acknowledgement
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Acknowledge delivery; no-op for fire-and-forget messages
    pub fn ack(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(());
        }
    }
}

/// In-memory point-to-point bus
#[derive(Debug, Default)]
pub struct LocalBus {
    consumers: DashMap<String, mpsc::UnboundedSender<BusMessage>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the consumer of `address`, replacing any previous consumer
    pub fn subscribe(&self, address: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.consumers.insert(address.to_string(), tx).is_some() {
            debug!("Replaced consumer on {}", address);
        }
        rx
    }

    pub fn unsubscribe(&self, address: &str) {
        self.consumers.remove(address);
    }

    pub fn has_consumer(&self, address: &str) -> bool {
        self.consumers
            .get(address)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver without waiting for the consumer
    pub fn send(&self, address: &str, payload: Bytes) -> Result<()> {
        self.deliver(address, payload, None)
    }

    /// Deliver and wait for the consumer's acknowledgement
    pub async fn request(&self, address: &str, payload: Bytes, timeout: Duration) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.deliver(address, payload, Some(reply_tx))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::ChannelClosed(format!(
                "consumer on {} dropped the request without acknowledging",
                address
            ))),
            Err(_) => Err(BridgeError::AckTimeout {
                address: address.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn deliver(
        &self,
        address: &str,
        payload: Bytes,
        reply: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let tx = self
            .consumers
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BridgeError::NoHandler {
                address: address.to_string(),
            })?;

        let message = BusMessage {
            address: address.to_string(),
            payload,
            reply,
        };
        if tx.send(message).is_err() {
            self.consumers.remove_if(address, |_, tx| tx.is_closed());
            return Err(BridgeError::NoHandler {
                address: address.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_consumer() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("flow.c1");

        bus.send("flow.c1", Bytes::from_static(b"ping")).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.address, "flow.c1");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        assert!(!msg.expects_reply());
    }

    #[tokio::test]
    async fn test_request_waits_for_ack() {
        let bus = std::sync::Arc::new(LocalBus::new());
        let mut rx = bus.subscribe("flow.c1");

        tokio::spawn(async move {
            let mut msg = rx.recv().await.unwrap();
            assert!(msg.expects_reply());
            msg.ack();
        });

        let result = bus
            .request("flow.c1", Bytes::from_static(b"drain"), Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("flow.c1");

        let result = bus
            .request("flow.c1", Bytes::from_static(b"drain"), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(BridgeError::AckTimeout { timeout_ms: 20, .. })));
        // Consumer still got the message
        assert!(rx.recv().await.unwrap().expects_reply());
    }

    #[tokio::test]
    async fn test_dropped_request_is_reported() {
        let bus = std::sync::Arc::new(LocalBus::new());
        let mut rx = bus.subscribe("flow.c1");

        tokio::spawn(async move {
            drop(rx.recv().await);
        });

        let result = bus
            .request("flow.c1", Bytes::from_static(b"drain"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(BridgeError::ChannelClosed(_))));
    }

    #[test]
    fn test_missing_consumer() {
        let bus = LocalBus::new();
        let result = bus.send("flow.nobody", Bytes::new());
        assert!(matches!(result, Err(BridgeError::NoHandler { .. })));

        let rx = bus.subscribe("flow.gone");
        assert!(bus.has_consumer("flow.gone"));
        drop(rx);
        assert!(!bus.has_consumer("flow.gone"));
        assert!(bus.send("flow.gone", Bytes::new()).is_err());

        bus.subscribe("flow.c2");
        bus.unsubscribe("flow.c2");
        assert!(!bus.has_consumer("flow.c2"));
    }
}
