//! Broker-wide counters backing the stats endpoint.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Lock-free counters updated by the dispatcher and protocol handler.
#[derive(Debug, Default)]
pub struct BrokerCounters {
    messages_processed: AtomicU64,
    errors: AtomicU64,
    queue_depth: AtomicUsize,
}

impl BrokerCounters {
    /// One queue entry finished processing.
    pub fn record_processed(&self) {
        let _ = self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery, protocol, or internal failure.
    pub fn record_error(&self) {
        let _ = self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` failures at once.
    pub fn record_errors(&self, n: u64) {
        if n > 0 {
            let _ = self.errors.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn enqueued(&self) -> usize {
        self.queue_depth.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dequeued(&self) -> usize {
        self.queue_depth.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Entries processed by the drain loop.
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Failures recorded so far.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Entries accepted but not yet processed.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }
}

/// Point-in-time broker statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    /// Live connections.
    pub active_connections: usize,
    /// Connections ever registered.
    pub total_connections: u64,
    /// Events processed by the drain loop.
    pub messages_processed: u64,
    /// Delivery, protocol, and internal failures.
    pub errors_count: u64,
    /// Events accepted but not yet processed.
    pub queue_depth: usize,
    /// Channels currently accepting subscriptions.
    pub channels_active: usize,
}
