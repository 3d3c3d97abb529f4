#![forbid(unsafe_code)]

// Server metrics: lock-free counters, one latency histogram, Prometheus text output.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Request latency buckets: upper bound in microseconds and its `le` label.
/// Signaling requests are dominated by one or two engine round trips.
const LATENCY_BUCKETS: [(u64, &str); 10] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (2_500, "0.0025"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (1_000_000, "1"),
];

/// Latency histogram. Each observation lands in exactly one slot; the
/// cumulative `le` series is built at render time.
struct LatencyHistogram {
    /// One slot per bucket plus a trailing overflow slot
    slots: [AtomicU64; LATENCY_BUCKETS.len() + 1],
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|&(bound, _)| us <= bound)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.slots[slot].fetch_add(1, Relaxed);
        self.sum_us.fetch_add(us, Relaxed);
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        header(out, name, "histogram", help);
        let mut cumulative = 0;
        for (slot, (_, label)) in self.slots.iter().zip(LATENCY_BUCKETS) {
            cumulative += slot.load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {cumulative}");
        }
        cumulative += self.slots[LATENCY_BUCKETS.len()].load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let sum_seconds = self.sum_us.load(Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{name}_sum {sum_seconds:.6}");
        let _ = writeln!(out, "{name}_count {cumulative}");
    }
}

/// Monotonic counters, in exposition order
#[derive(Clone, Copy)]
enum Counter {
    Connections,
    MessagesReceived,
    Errors,
    RoomsCreated,
    RoomsClosed,
    Joins,
    Leaves,
    ProducersCreated,
    ConsumersCreated,
}

const COUNTERS: [(Counter, &str, &str); 9] = [
    (Counter::Connections, "mediaroom_connections_total", "Total WebSocket connections"),
    (Counter::MessagesReceived, "mediaroom_messages_received_total", "Total messages received from clients"),
    (Counter::Errors, "mediaroom_errors_total", "Total failed requests"),
    (Counter::RoomsCreated, "mediaroom_rooms_created_total", "Total rooms created"),
    (Counter::RoomsClosed, "mediaroom_rooms_closed_total", "Total rooms closed"),
    (Counter::Joins, "mediaroom_joins_total", "Total room joins"),
    (Counter::Leaves, "mediaroom_leaves_total", "Total room leaves"),
    (Counter::ProducersCreated, "mediaroom_producers_created_total", "Total producers created"),
    (Counter::ConsumersCreated, "mediaroom_consumers_created_total", "Total consumers created"),
];

/// Server-wide metrics, cheap to clone and share between handlers.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; COUNTERS.len()],
    connections_active: AtomicU64,
    request_handling: LatencyHistogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                request_handling: LatencyHistogram::new(),
            }),
        }
    }

    fn bump(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn inc_connections_total(&self) {
        self.bump(Counter::Connections);
    }

    pub fn inc_messages_received(&self) {
        self.bump(Counter::MessagesReceived);
    }

    pub fn inc_errors(&self) {
        self.bump(Counter::Errors);
    }

    pub fn inc_rooms_created(&self) {
        self.bump(Counter::RoomsCreated);
    }

    pub fn inc_rooms_closed(&self) {
        self.bump(Counter::RoomsClosed);
    }

    pub fn inc_joins(&self) {
        self.bump(Counter::Joins);
    }

    pub fn inc_leaves(&self) {
        self.bump(Counter::Leaves);
    }

    pub fn inc_producers_created(&self) {
        self.bump(Counter::ProducersCreated);
    }

    pub fn inc_consumers_created(&self) {
        self.bump(Counter::ConsumersCreated);
    }

    /// Counts an open WebSocket until the returned guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// Prometheus text exposition. Room and peer gauges are sampled by the
    /// caller from the registry.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for (counter, name, help) in COUNTERS {
            let value = self.inner.counters[counter as usize].load(Relaxed);
            sample(&mut out, name, "counter", help, value);
        }

        let gauges = [
            ("mediaroom_connections_active", "Open WebSocket connections", self.inner.connections_active.load(Relaxed)),
            ("mediaroom_rooms_active", "Rooms with a live router", rooms_active as u64),
            ("mediaroom_peers_active", "Peers joined to a room", peers_active as u64),
        ];
        for (name, help, value) in gauges {
            sample(&mut out, name, "gauge", help, value);
        }

        self.inner.request_handling.render(
            &mut out,
            "mediaroom_request_handling_seconds",
            "Signaling request handling latency in seconds",
        );

        out
    }
}

pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} {kind}");
}

fn sample(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    header(out, name, kind, help);
    let _ = writeln!(out, "{name} {value}");
}
