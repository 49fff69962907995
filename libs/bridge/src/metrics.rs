//! Counters for monitoring bridge behaviour

use std::sync::atomic::{AtomicU64, Ordering};

/// Bridge-wide counters, shared by every client lane
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    pub attach_attempts: AtomicU64,
    pub attach_failures: AtomicU64,
    pub active_links: AtomicU64,
    pub links_closed: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub flow_control_sent: AtomicU64,
    pub drain_requests: AtomicU64,
    pub error_notices_sent: AtomicU64,
    pub notify_failures: AtomicU64,
}

/// Point-in-time copy of [`BridgeMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub attach_attempts: u64,
    pub attach_failures: u64,
    pub active_links: u64,
    pub links_closed: u64,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
    pub flow_control_sent: u64,
    pub drain_requests: u64,
    pub error_notices_sent: u64,
    pub notify_failures: u64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attach_attempt(&self) {
        self.attach_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attach_failure(&self) {
        self.attach_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_opened(&self) {
        self.active_links.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_closed(&self) {
        self.links_closed.fetch_add(1, Ordering::Relaxed);
        // Never wrap below zero
        let _ = self
            .active_links
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_control(&self, drain: bool) {
        self.flow_control_sent.fetch_add(1, Ordering::Relaxed);
        if drain {
            self.drain_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error_notice(&self) {
        self.error_notices_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notify_failure(&self) {
        self.notify_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attach_attempts: self.attach_attempts.load(Ordering::Relaxed),
            attach_failures: self.attach_failures.load(Ordering::Relaxed),
            active_links: self.active_links.load(Ordering::Relaxed),
            links_closed: self.links_closed.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            flow_control_sent: self.flow_control_sent.load(Ordering::Relaxed),
            drain_requests: self.drain_requests.load(Ordering::Relaxed),
            error_notices_sent: self.error_notices_sent.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Share of attach attempts the bridge rejected or failed to complete
    ///
    /// Attaches cancelled by upstream before the sender existed are not failures.
    pub fn attach_failure_rate(&self) -> f64 {
        if self.attach_attempts == 0 {
            return 0.0;
        }
        self.attach_failures as f64 / self.attach_attempts as f64
    }
}
