#![forbid(unsafe_code)]

// Process metrics - lock-free counters with Prometheus text rendering

use crate::media::worker_pool::WorkerPool;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

/// Server-wide counters. Cloning shares the same underlying atomics.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    events_received_total: AtomicU64,
    events_sent_total: AtomicU64,
    media_commands_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
}

/// Decrements the active-connections gauge when the connection ends.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn inc_events_received(&self) {
        self.inner.events_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_sent(&self) {
        self.inner.events_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_media_commands(&self) {
        self.inner.media_commands_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    /// Renders all counters plus live gauges in Prometheus text format.
    pub fn render_prometheus(&self, rooms: usize, participants: usize, pool: &WorkerPool) -> String {
        let mut out = String::with_capacity(2048);

        let counters = [
            ("sfu_connections_total", "Total socket connections accepted",
             self.inner.connections_total.load(Relaxed)),
            ("sfu_events_received_total", "Total inbound socket events",
             self.inner.events_received_total.load(Relaxed)),
            ("sfu_events_sent_total", "Total outbound socket events",
             self.inner.events_sent_total.load(Relaxed)),
            ("sfu_media_commands_total", "Total media commands dispatched",
             self.inner.media_commands_total.load(Relaxed)),
            ("sfu_errors_total", "Total command and framing errors",
             self.inner.errors_total.load(Relaxed)),
            ("sfu_rooms_created_total", "Total rooms created",
             self.inner.rooms_created_total.load(Relaxed)),
            ("sfu_joins_total", "Total participants joined",
             self.inner.joins_total.load(Relaxed)),
            ("sfu_leaves_total", "Total participants removed",
             self.inner.leaves_total.load(Relaxed)),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let gauges = [
            ("sfu_connections_active", "Currently open sockets",
             self.inner.connections_active.load(Relaxed)),
            ("sfu_rooms_active", "Currently live rooms", rooms as u64),
            ("sfu_participants_active", "Currently admitted participants", participants as u64),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        let _ = writeln!(out, "# HELP sfu_worker_participants Participants per pool slot");
        let _ = writeln!(out, "# TYPE sfu_worker_participants gauge");
        let _ = writeln!(out, "# HELP sfu_worker_rooms Rooms per pool slot");
        let _ = writeln!(out, "# TYPE sfu_worker_rooms gauge");
        for (worker_id, slot) in pool.stats() {
            let _ = writeln!(
                out,
                "sfu_worker_participants{{worker=\"{}\",index=\"{}\"}} {}",
                worker_id, slot.worker_index, slot.participant_count
            );
            let _ = writeln!(
                out,
                "sfu_worker_rooms{{worker=\"{}\",index=\"{}\"}} {}",
                worker_id, slot.worker_index, slot.room_count
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_gauge_follows_guard_lifetime() {
        let metrics = ServerMetrics::new();
        let guard = metrics.connection_active_guard();
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 1);
        drop(guard);
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 0);
    }

    #[test]
    fn counters_are_shared_across_clones() {
        let metrics = ServerMetrics::new();
        let clone = metrics.clone();
        clone.inc_media_commands();
        assert_eq!(metrics.inner.media_commands_total.load(Relaxed), 1);
    }
}
