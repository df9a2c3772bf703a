//! `$SYS` broker metrics.
//!
//! Atomic counters updated on the broker hot paths, snapshotted into
//! retained `$SYS/broker/...` messages at the configured `sys_interval`.
//! Wildcards never match the `$SYS` tree, so only explicit `$SYS/...`
//! subscribers receive these.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;

use crate::types::Message;

/// `$SYS` topic constants.
pub mod topics {
    pub const VERSION: &str = "$SYS/broker/version";
    pub const UPTIME: &str = "$SYS/broker/uptime";

    pub const CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const CLIENTS_MAXIMUM: &str = "$SYS/broker/clients/maximum";

    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
    pub const MESSAGES_DROPPED: &str = "$SYS/broker/messages/dropped";

    pub const SUBSCRIPTIONS_COUNT: &str = "$SYS/broker/subscriptions/count";
    pub const RETAINED_COUNT: &str = "$SYS/broker/retained messages/count";
}

/// Global broker metrics. Incremented by handlers on the hot path,
/// read by the `$SYS` publisher task.
pub struct BrokerMetrics {
    started_at: Instant,

    /// All MQTT packets received from clients.
    pub messages_received: AtomicU64,
    /// All MQTT packets sent to clients.
    pub messages_sent: AtomicU64,
    /// QoS 0 deliveries dropped on full queues.
    pub messages_dropped: AtomicU64,
    /// Connections accepted over the broker lifetime.
    pub connections_total: AtomicU64,
    /// Peak concurrently connected clients.
    pub clients_maximum: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            clients_maximum: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new connection and update the connected peak.
    pub fn connection_opened(&self, connected_now: u64) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.clients_maximum
            .fetch_max(connected_now, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Build the retained `$SYS` messages for one publish round.
    /// Gauge values the metrics struct cannot see are passed in.
    pub fn snapshot(
        &self,
        clients_total: u64,
        clients_connected: u64,
        subscriptions: u64,
        retained: u64,
    ) -> Vec<Message> {
        let gauge = |topic: &str, value: u64| {
            Message::new(topic, Bytes::from(value.to_string())).with_retain(true)
        };

        vec![
            Message::new(
                topics::VERSION,
                Bytes::from_static(concat!("mqtt3 ", env!("CARGO_PKG_VERSION")).as_bytes()),
            )
            .with_retain(true),
            gauge(topics::UPTIME, self.uptime_secs()),
            gauge(topics::CLIENTS_TOTAL, clients_total),
            gauge(topics::CLIENTS_CONNECTED, clients_connected),
            gauge(
                topics::CLIENTS_MAXIMUM,
                self.clients_maximum.load(Ordering::Relaxed),
            ),
            gauge(
                topics::MESSAGES_RECEIVED,
                self.messages_received.load(Ordering::Relaxed),
            ),
            gauge(
                topics::MESSAGES_SENT,
                self.messages_sent.load(Ordering::Relaxed),
            ),
            gauge(
                topics::MESSAGES_DROPPED,
                self.messages_dropped.load(Ordering::Relaxed),
            ),
            gauge(topics::SUBSCRIPTIONS_COUNT, subscriptions),
            gauge(topics::RETAINED_COUNT, retained),
        ]
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = BrokerMetrics::new();
        metrics.message_received();
        metrics.message_received();
        metrics.message_sent();
        metrics.connection_opened(3);
        metrics.connection_opened(1);

        assert_eq!(metrics.messages_received.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 2);
        // Peak is kept, not overwritten.
        assert_eq!(metrics.clients_maximum.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_snapshot_is_retained() {
        let metrics = BrokerMetrics::new();
        let snapshot = metrics.snapshot(4, 2, 7, 1);
        assert!(!snapshot.is_empty());
        for msg in &snapshot {
            assert!(msg.retain);
            assert!(msg.topic.starts_with("$SYS/broker/"));
        }
        let connected = snapshot
            .iter()
            .find(|m| m.topic == topics::CLIENTS_CONNECTED)
            .unwrap();
        assert_eq!(connected.payload.as_ref(), b"2");
    }
}
