//! Observability sink for the realtime pipeline.
//!
//! Every path that deliberately drops data (backpressure, failed publish,
//! failed snapshot write, malformed bus message) bumps a counter here as well
//! as logging, so "never blocks, never crashes" stays diagnosable.
//!
//! Counters are atomics: the hot path never takes a lock. Read them through
//! [`HubStats::snapshot`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_broadcast: u64,
    pub outbound_dropped: u64,
    pub saves_dropped: u64,
    pub snapshots_written: u64,
    pub snapshot_write_failures: u64,
    pub bus_publish_failures: u64,
    pub bus_publish_dropped: u64,
    pub bus_resubscribes: u64,
    pub bus_delivered: u64,
    pub bus_malformed: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub rooms_created: u64,
    pub rooms_evicted: u64,
}

impl StatsSnapshot {
    pub fn active_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }
}

/// One-line summary for periodic log output.
impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections={} frames_in={} frames_out={} dropped(out/save/publish)={}/{}/{} \
             snapshots={} snapshot_failures={} bus(delivered/failed/malformed/resubscribes)={}/{}/{}/{} \
             rooms(created/evicted)={}/{}",
            self.active_connections(),
            self.frames_received,
            self.frames_broadcast,
            self.outbound_dropped,
            self.saves_dropped,
            self.bus_publish_dropped,
            self.snapshots_written,
            self.snapshot_write_failures,
            self.bus_delivered,
            self.bus_publish_failures,
            self.bus_malformed,
            self.bus_resubscribes,
            self.rooms_created,
            self.rooms_evicted,
        )
    }
}

/// Lock-free counters, one set per hub.
#[derive(Debug, Default)]
pub struct HubStats {
    frames_received: AtomicU64,
    frames_broadcast: AtomicU64,
    outbound_dropped: AtomicU64,
    saves_dropped: AtomicU64,
    snapshots_written: AtomicU64,
    snapshot_write_failures: AtomicU64,
    bus_publish_failures: AtomicU64,
    bus_publish_dropped: AtomicU64,
    bus_resubscribes: AtomicU64,
    bus_delivered: AtomicU64,
    bus_malformed: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    rooms_created: AtomicU64,
    rooms_evicted: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl HubStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        frame_received => frames_received,
        frame_broadcast => frames_broadcast,
        outbound_dropped => outbound_dropped,
        save_dropped => saves_dropped,
        snapshot_written => snapshots_written,
        snapshot_write_failed => snapshot_write_failures,
        bus_publish_failed => bus_publish_failures,
        bus_publish_dropped => bus_publish_dropped,
        bus_resubscribed => bus_resubscribes,
        bus_delivered => bus_delivered,
        bus_malformed => bus_malformed,
        connection_opened => connections_opened,
        connection_closed => connections_closed,
        room_created => rooms_created,
    }

    pub fn rooms_evicted(&self, n: u64) {
        self.rooms_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            saves_dropped: self.saves_dropped.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            snapshot_write_failures: self.snapshot_write_failures.load(Ordering::Relaxed),
            bus_publish_failures: self.bus_publish_failures.load(Ordering::Relaxed),
            bus_publish_dropped: self.bus_publish_dropped.load(Ordering::Relaxed),
            bus_resubscribes: self.bus_resubscribes.load(Ordering::Relaxed),
            bus_delivered: self.bus_delivered.load(Ordering::Relaxed),
            bus_malformed: self.bus_malformed.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_evicted: self.rooms_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(HubStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_counters_increment() {
        let stats = HubStats::new();
        stats.frame_received();
        stats.frame_received();
        stats.outbound_dropped();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.rooms_evicted(3);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.outbound_dropped, 1);
        assert_eq!(snap.active_connections(), 1);
        assert_eq!(snap.rooms_evicted, 3);
    }

    #[test]
    fn test_display_summarises_counters() {
        let stats = HubStats::new();
        stats.connection_opened();
        stats.frame_received();
        stats.bus_publish_dropped();
        stats.bus_resubscribed();
        stats.bus_resubscribed();

        let line = stats.snapshot().to_string();
        assert!(line.starts_with("connections=1 frames_in=1 "));
        assert!(line.contains("dropped(out/save/publish)=0/0/1"));
        assert!(line.contains("bus(delivered/failed/malformed/resubscribes)=0/0/0/2"));
        assert!(!line.contains('\n'));
    }
}
