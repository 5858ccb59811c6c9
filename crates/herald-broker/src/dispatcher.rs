//! Event queue and fan-out.
//!
//! `publish` validates and enqueues; a single drain task processes entries
//! one at a time in FIFO order. For each entry the drain records the publish
//! on the channel, appends to retention, snapshots the subscriber set, and
//! queues the serialized event for every subscriber whose filter matches.
//! A failure while processing one entry is logged and counted; the loop
//! continues with the next entry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelRegistry, Priority, validate_channel_name};
use crate::clock::SharedClock;
use crate::connection::{ConnectionRegistry, Outbound};
use crate::errors::{BrokerError, Result};
use crate::event::Event;
use crate::filter;
use crate::ids::EventId;
use crate::metrics as names;
use crate::protocol::ServerMessage;
use crate::retention::RetentionStore;
use crate::stats::BrokerCounters;

/// Outcome of processing one queue entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers skipped by their filter.
    pub filtered: usize,
    /// Subscribers whose send failed (closed, unknown, or buffer full).
    pub failed: usize,
    /// Events evicted from the channel's history by this append.
    pub evicted: usize,
}

/// FIFO event queue with a single consumer.
pub struct Dispatcher {
    /// `None` once closed.
    sender: Mutex<Option<mpsc::UnboundedSender<Arc<Event>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Arc<Event>>>>,
    next_id: AtomicU64,
    channels: Arc<ChannelRegistry>,
    connections: Arc<ConnectionRegistry>,
    retention: Arc<RetentionStore>,
    counters: Arc<BrokerCounters>,
    clock: SharedClock,
    max_payload_bytes: usize,
    idle: Notify,
}

impl Dispatcher {
    /// Create a dispatcher. Nothing is processed until [`run`](Self::run).
    pub fn new(
        channels: Arc<ChannelRegistry>,
        connections: Arc<ConnectionRegistry>,
        retention: Arc<RetentionStore>,
        counters: Arc<BrokerCounters>,
        clock: SharedClock,
        max_payload_bytes: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            next_id: AtomicU64::new(1),
            channels,
            connections,
            retention,
            counters,
            clock,
            max_payload_bytes,
            idle: Notify::new(),
        }
    }

    /// Validate and enqueue an event. Returns as soon as it is queued.
    ///
    /// Creates the channel if it is unknown. Priority defaults to the
    /// channel's configured priority (`medium` for lazily created channels).
    pub fn publish(
        &self,
        channel: &str,
        payload: Value,
        priority: Option<Priority>,
        publisher: Option<String>,
    ) -> Result<EventId> {
        validate_channel_name(channel)?;
        let size = serde_json::to_vec(&payload)?.len();
        if size > self.max_payload_bytes {
            return Err(BrokerError::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }
        // IDs are assigned under the sender lock so queue order matches ID order.
        let sender = self.sender.lock();
        let tx = sender.as_ref().ok_or(BrokerError::DispatcherStopped)?;
        // The channel exists once the publish is accepted, before the drain
        // reaches the event.
        let info = self.channels.ensure_channel(channel)?;
        let priority = priority.unwrap_or(info.priority);
        let id = EventId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = Arc::new(Event {
            id,
            channel: channel.to_owned(),
            payload,
            publisher,
            priority,
            timestamp: self.clock.now(),
        });
        let depth = self.counters.enqueued();
        if tx.send(event).is_err() {
            let _ = self.counters.dequeued();
            return Err(BrokerError::DispatcherStopped);
        }
        drop(sender);

        counter!(names::EVENTS_PUBLISHED_TOTAL).increment(1);
        record_depth(depth);
        debug!(event_id = %id, channel, ?priority, size, "event queued");
        Ok(id)
    }

    /// Take the queue's receiving end. Only one drain task may exist.
    pub fn take_receiver(&self) -> Result<mpsc::UnboundedReceiver<Arc<Event>>> {
        self.receiver.lock().take().ok_or(BrokerError::AlreadyRunning)
    }

    /// Stop accepting events. Entries already queued are still drained, after
    /// which [`run`](Self::run) returns.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!(pending = self.counters.queue_depth(), "dispatcher closed");
        }
    }

    /// Whether `publish` still accepts events.
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Drain loop. Runs until the queue is closed and empty.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Arc<Event>>) {
        info!("dispatcher started");
        while let Some(event) = rx.recv().await {
            self.process_entry(&event);
        }
        info!(processed = self.counters.messages_processed(), "dispatcher stopped");
    }

    /// Wait until every event queued so far has been processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.counters.queue_depth() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Events accepted but not yet processed.
    pub fn queue_depth(&self) -> usize {
        self.counters.queue_depth()
    }

    fn process_entry(&self, event: &Arc<Event>) {
        match catch_unwind(AssertUnwindSafe(|| self.fan_out(event))) {
            Ok(Ok(report)) => {
                debug!(
                    event_id = %event.id,
                    channel = %event.channel,
                    delivered = report.delivered,
                    filtered = report.filtered,
                    failed = report.failed,
                    "event dispatched"
                );
            }
            Ok(Err(e)) => {
                error!(event_id = %event.id, channel = %event.channel, error = %e, "event processing failed");
                self.counters.record_error();
                counter!(names::DRAIN_FAILURES_TOTAL).increment(1);
            }
            Err(_) => {
                error!(event_id = %event.id, channel = %event.channel, "event processing panicked");
                self.counters.record_error();
                counter!(names::DRAIN_FAILURES_TOTAL).increment(1);
            }
        }

        self.counters.record_processed();
        counter!(names::EVENTS_PROCESSED_TOTAL).increment(1);
        let depth = self.counters.dequeued();
        record_depth(depth);
        if depth == 0 {
            self.idle.notify_waiters();
        }
    }

    fn fan_out(&self, event: &Arc<Event>) -> Result<FanOutReport> {
        let policy = self.channels.record_publish(&event.channel)?;
        let evicted = self.retention.append(policy, Arc::clone(event));
        if evicted > 0 {
            counter!(names::RETENTION_EVICTIONS_TOTAL).increment(evicted as u64);
        }

        let subscribers = self.channels.subscribers_of(&event.channel);
        let mut report = FanOutReport {
            evicted,
            ..FanOutReport::default()
        };
        if subscribers.is_empty() {
            return Ok(report);
        }

        let message = ServerMessage::Event {
            channel: event.channel.clone(),
            event: Arc::clone(event),
            timestamp: self.clock.now(),
        };
        let frame: Arc<str> = serde_json::to_string(&message)?.into();

        for subscriber in &subscribers {
            if !filter::matches(&event.payload, subscriber.filter.as_ref()) {
                report.filtered += 1;
                continue;
            }
            if self
                .connections
                .send(&subscriber.connection_id, Outbound::Text(Arc::clone(&frame)))
            {
                report.delivered += 1;
            } else {
                report.failed += 1;
                warn!(
                    conn_id = %subscriber.connection_id,
                    event_id = %event.id,
                    "delivery failed"
                );
            }
        }

        counter!(names::EVENTS_DELIVERED_TOTAL).increment(report.delivered as u64);
        if report.failed > 0 {
            counter!(names::DELIVERY_FAILURES_TOTAL).increment(report.failed as u64);
            self.counters.record_errors(report.failed as u64);
        }
        Ok(report)
    }

    #[cfg(test)]
    fn enqueue_unchecked(&self, event: Event) {
        let sender = self.sender.lock();
        let _ = self.counters.enqueued();
        if let Some(tx) = sender.as_ref() {
            let _ = tx.send(Arc::new(event));
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}
