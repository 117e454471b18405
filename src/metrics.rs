#![forbid(unsafe_code)]

// Server metrics — lock-free AtomicU64 counters and a Prometheus-compatible
// histogram, rendered on demand by the /metrics handler.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (microseconds internally).
const BUCKET_BOUNDS_US: [u64; 8] = [
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    100_000,   // 100ms
    250_000,   // 250ms
    1_000_000, // 1s
    5_000_000, // 5s
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let labels = ["0.001", "0.005", "0.01", "0.025", "0.1", "0.25", "1", "5"];
        for (i, label) in labels.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_expired_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    uploads_total: AtomicU64,
    voice_joins_total: AtomicU64,
    chat_dropped_total: AtomicU64,

    connections_active: AtomicU64,

    message_handling: Histogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                rooms_expired_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                uploads_total: AtomicU64::new(0),
                voice_joins_total: AtomicU64::new(0),
                chat_dropped_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_expired(&self) {
        self.inner.rooms_expired_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_uploads(&self) {
        self.inner.uploads_total.fetch_add(1, Relaxed);
    }

    pub fn inc_voice_joins(&self) {
        self.inner.voice_joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_dropped(&self) {
        self.inner.chat_dropped_total.fetch_add(1, Relaxed);
    }

    /// Increments connections_active and returns an RAII guard that
    /// decrements on drop, so the gauge stays correct even if the
    /// connection handler panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `members_active` are read from the RoomManager on
    /// demand.
    pub fn render_prometheus(&self, rooms_active: usize, members_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        render_counter(&mut out, "ephemchat_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_messages_received_total", "Total messages received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_messages_sent_total", "Total messages sent to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_errors_total", "Total request errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_rooms_expired_total", "Total rooms deleted after the empty grace window", i.rooms_expired_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_uploads_total", "Total media uploads stored", i.uploads_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_voice_joins_total", "Total voice session joins", i.voice_joins_total.load(Relaxed));
        render_counter(&mut out, "ephemchat_chat_dropped_total", "Chat messages dropped by the flood guard", i.chat_dropped_total.load(Relaxed));

        render_gauge(&mut out, "ephemchat_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "ephemchat_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "ephemchat_members_active", "Currently active room members", members_active as u64);

        i.message_handling.render(
            "ephemchat_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_guard_decrements_on_drop() {
        let metrics = ServerMetrics::new();
        {
            let _g1 = metrics.connection_active_guard();
            let _g2 = metrics.connection_active_guard();
            assert_eq!(metrics.inner.connections_active.load(Relaxed), 2);
        }
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 0);
    }

    #[test]
    fn render_includes_all_families() {
        let metrics = ServerMetrics::new();
        metrics.inc_rooms_created();
        metrics.observe_message_handling(Duration::from_millis(3));
        let out = metrics.render_prometheus(1, 2);
        assert!(out.contains("ephemchat_rooms_created_total 1"));
        assert!(out.contains("ephemchat_rooms_active 1"));
        assert!(out.contains("ephemchat_members_active 2"));
        assert!(out.contains("ephemchat_message_handling_seconds_count 1"));
    }
}
