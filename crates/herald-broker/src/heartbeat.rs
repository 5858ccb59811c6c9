//! Heartbeat ping/pong liveness monitoring.
//!
//! Every interval each connection advances one step: an `Alive` connection
//! is probed and becomes `AwaitingPong`; a connection still `AwaitingPong`
//! from the previous sweep is declared dead and removed from every registry.
//! Any inbound traffic (pong or otherwise) resets a connection to `Alive`.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelRegistry;
use crate::connection::{ConnectionRegistry, Liveness, Outbound};
use crate::ids::ConnectionId;
use crate::metrics as names;

/// Result of one heartbeat sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections sent a probe.
    pub probed: usize,
    /// Connections declared dead and removed.
    pub evicted: Vec<ConnectionId>,
}

/// Periodically probes connections and evicts the unresponsive ones.
pub struct HeartbeatMonitor {
    connections: Arc<ConnectionRegistry>,
    channels: Arc<ChannelRegistry>,
    interval: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor sweeping every `interval`.
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        channels: Arc<ChannelRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            connections,
            channels,
            interval,
        }
    }

    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Advance every connection's liveness by one step.
    pub fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.connections.snapshot() {
            match conn.advance_liveness() {
                Liveness::AwaitingPong => {
                    report.probed += 1;
                    if !conn.send(Outbound::Ping) {
                        debug!(conn_id = %conn.id(), "heartbeat probe not queued");
                    }
                }
                Liveness::Dead => {
                    if self.channels.disconnect(conn.id()).is_some() {
                        warn!(
                            conn_id = %conn.id(),
                            last_activity = %conn.last_activity(),
                            "connection missed heartbeat, evicting"
                        );
                        counter!(names::HEARTBEAT_EVICTIONS_TOTAL).increment(1);
                        report.evicted.push(conn.id().clone());
                    }
                }
                Liveness::Alive => {}
            }
        }
        report
    }

    /// Sweep every interval until cancelled. The first sweep happens one
    /// interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "heartbeat monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick();
                    if !report.evicted.is_empty() {
                        info!(
                            probed = report.probed,
                            evicted = report.evicted.len(),
                            "heartbeat sweep"
                        );
                    }
                }
                () = cancel.cancelled() => {
                    info!("heartbeat monitor stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::connection::Connection;
    use crate::retention::RetentionPolicy;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Fixture {
        connections: Arc<ConnectionRegistry>,
        channels: Arc<ChannelRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock: SharedClock = Arc::new(ManualClock::starting_now());
            let connections = Arc::new(ConnectionRegistry::new(clock.clone()));
            let defaults = RetentionPolicy {
                window: Duration::from_secs(60),
                max_events: 10,
            };
            let channels = Arc::new(ChannelRegistry::new(connections.clone(), defaults, clock));
            Self {
                connections,
                channels,
            }
        }

        fn monitor(&self, interval: Duration) -> HeartbeatMonitor {
            HeartbeatMonitor::new(self.connections.clone(), self.channels.clone(), interval)
        }

        fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel(16);
            (self.connections.register(tx, HashMap::new()), rx)
        }
    }

    #[test]
    fn first_tick_probes_alive_connections() {
        let f = Fixture::new();
        let (conn, mut rx) = f.connect();
        let report = f.monitor(Duration::from_secs(30)).tick();
        assert_eq!(report.probed, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(conn.liveness(), Liveness::AwaitingPong);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
    }

    #[test]
    fn unanswered_probe_evicts_on_next_tick() {
        let f = Fixture::new();
        let (conn, _rx) = f.connect();
        let _ = f.channels.subscribe(conn.id(), "c", None).unwrap();
        let monitor = f.monitor(Duration::from_secs(30));

        let _ = monitor.tick();
        let report = monitor.tick();
        assert_eq!(report.evicted, vec![conn.id().clone()]);
        assert!(conn.is_closed());
        assert!(conn.closed_token().is_cancelled());
        assert_eq!(f.connections.active_count(), 0);
        assert!(f.channels.subscribers_of("c").is_empty());
    }

    #[test]
    fn activity_between_ticks_keeps_connection() {
        let f = Fixture::new();
        let (conn, _rx) = f.connect();
        let monitor = f.monitor(Duration::from_secs(30));

        for _ in 0..5 {
            let report = monitor.tick();
            assert!(report.evicted.is_empty());
            assert!(f.connections.mark_activity(conn.id()));
        }
        assert_eq!(f.connections.active_count(), 1);
        assert_eq!(conn.liveness(), Liveness::Alive);
    }

    #[test]
    fn only_silent_connections_are_evicted() {
        let f = Fixture::new();
        let (chatty, _rx1) = f.connect();
        let (silent, _rx2) = f.connect();
        let monitor = f.monitor(Duration::from_secs(30));

        let _ = monitor.tick();
        let _ = f.connections.mark_activity(chatty.id());
        let report = monitor.tick();

        assert_eq!(report.evicted, vec![silent.id().clone()]);
        assert!(f.connections.get(chatty.id()).is_some());
    }

    #[test]
    fn full_buffer_still_counts_as_probed() {
        let f = Fixture::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn = f.connections.register(tx, HashMap::new());
        assert!(conn.send(Outbound::Ping));
        let report = f.monitor(Duration::from_secs(30)).tick();
        assert_eq!(report.probed, 1);
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_evicts_silent_connection_after_two_intervals() {
        let f = Fixture::new();
        let (conn, _rx) = f.connect();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.monitor(Duration::from_millis(100)).run(cancel.clone()));

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(conn.liveness(), Liveness::AwaitingPong);
        assert!(!conn.is_closed());

        time::sleep(Duration::from_millis(100)).await;
        assert!(conn.is_closed());
        assert_eq!(f.connections.active_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_responsive_connection() {
        let f = Fixture::new();
        let (conn, mut rx) = f.connect();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.monitor(Duration::from_millis(100)).run(cancel.clone()));

        for _ in 0..10 {
            time::sleep(Duration::from_millis(50)).await;
            while rx.try_recv().is_ok() {
                let _ = f.connections.mark_activity(conn.id());
            }
        }
        assert!(!conn.is_closed());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let f = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        f.monitor(Duration::from_secs(60)).run(cancel).await;
    }
}
