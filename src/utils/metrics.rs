//! Observability and Metrics
//!
//! Two levels of counters:
//! - [`Metrics`]: messenger-wide totals (datagrams, malformed input, connections)
//! - [`ConnectionStats`]: per-connection traffic, ping, MTU and loss
//!
//! Uses atomic counters so the network thread can update them while the application
//! reads snapshots.
//!
//! Traffic is counted twice: *physical* datagrams that hit the socket and the *logical*
//! packets they carried. A chunk is one physical datagram holding several logical packets.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

/// Messenger-wide metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Connections opened since start
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Datagrams written to the socket
    pub datagrams_sent: AtomicU64,
    /// Datagrams read from the socket
    pub datagrams_received: AtomicU64,
    /// Bytes written to the socket
    pub bytes_sent: AtomicU64,
    /// Bytes read from the socket
    pub bytes_received: AtomicU64,
    /// Datagrams that failed validation or decoding
    pub malformed_datagrams: AtomicU64,
    /// Datagrams dropped because the sender is ignored
    pub ignored_datagrams: AtomicU64,
    /// Packets dropped as already handled
    pub duplicates_dropped: AtomicU64,
    /// Socket send failures
    pub send_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            malformed_datagrams: AtomicU64::new(0),
            ignored_datagrams: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // saturating: a close racing a shutdown must not wrap
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn datagram_sent(&self, byte_count: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn datagram_received(&self, byte_count: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ignored(&self) {
        self.ignored_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
            ignored_datagrams: self.ignored_datagrams.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            datagrams_sent = snapshot.datagrams_sent,
            datagrams_received = snapshot.datagrams_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            malformed_datagrams = snapshot.malformed_datagrams,
            ignored_datagrams = snapshot.ignored_datagrams,
            duplicates_dropped = snapshot.duplicates_dropped,
            send_errors = snapshot.send_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Messenger metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of messenger metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub malformed_datagrams: u64,
    pub ignored_datagrams: u64,
    pub duplicates_dropped: u64,
    pub send_errors: u64,
    pub uptime_seconds: u64,
}

/// Counters used to derive per-second rates.
#[derive(Debug, Clone, Copy, Default)]
struct RateWindow {
    physical_sent: u64,
    physical_received: u64,
    logical_sent: u64,
    logical_received: u64,
}

/// Per-connection statistics.
#[derive(Debug)]
pub struct ConnectionStats {
    physical_sent: AtomicU64,
    physical_received: AtomicU64,
    logical_sent: AtomicU64,
    logical_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Reliable packets resent after the ack deadline passed
    packets_lost: AtomicU64,
    ping_min_us: AtomicU64,
    ping_avg_us: AtomicU64,
    ping_max_us: AtomicU64,
    mtu: AtomicUsize,
    rates: Mutex<(Instant, RateWindow, RateWindow)>,
}

impl ConnectionStats {
    pub fn new(mtu: usize) -> Self {
        Self {
            physical_sent: AtomicU64::new(0),
            physical_received: AtomicU64::new(0),
            logical_sent: AtomicU64::new(0),
            logical_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            ping_min_us: AtomicU64::new(u64::MAX),
            ping_avg_us: AtomicU64::new(0),
            ping_max_us: AtomicU64::new(0),
            mtu: AtomicUsize::new(mtu),
            rates: Mutex::new((Instant::now(), RateWindow::default(), RateWindow::default())),
        }
    }

    pub fn physical_sent(&self, byte_count: usize) {
        self.physical_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn physical_received(&self, byte_count: usize) {
        self.physical_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn logical_sent(&self) {
        self.logical_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn logical_received(&self) {
        self.logical_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_lost(&self, count: u64) {
        self.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Records one round-trip sample into min/max.
    pub fn record_ping(&self, rtt: Duration) {
        let us = rtt.as_micros() as u64;
        self.ping_min_us.fetch_min(us, Ordering::Relaxed);
        self.ping_max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Stores the latest window average.
    pub fn set_average_ping(&self, avg: Duration) {
        self.ping_avg_us
            .store(avg.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn average_ping(&self) -> Duration {
        Duration::from_micros(self.ping_avg_us.load(Ordering::Relaxed))
    }

    /// Rolls the per-second rate window once a second has passed.
    pub fn tick(&self, now: Instant) {
        let mut rates = self.rates.lock();
        if now.saturating_duration_since(rates.0) < Duration::from_secs(1) {
            return;
        }
        let current = RateWindow {
            physical_sent: self.physical_sent.load(Ordering::Relaxed),
            physical_received: self.physical_received.load(Ordering::Relaxed),
            logical_sent: self.logical_sent.load(Ordering::Relaxed),
            logical_received: self.logical_received.load(Ordering::Relaxed),
        };
        let previous = rates.1;
        rates.0 = now;
        rates.1 = current;
        rates.2 = RateWindow {
            physical_sent: current.physical_sent - previous.physical_sent,
            physical_received: current.physical_received - previous.physical_received,
            logical_sent: current.logical_sent - previous.logical_sent,
            logical_received: current.logical_received - previous.logical_received,
        };
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let per_second = self.rates.lock().2;
        let min = self.ping_min_us.load(Ordering::Relaxed);
        StatsSnapshot {
            physical_sent: self.physical_sent.load(Ordering::Relaxed),
            physical_received: self.physical_received.load(Ordering::Relaxed),
            logical_sent: self.logical_sent.load(Ordering::Relaxed),
            logical_received: self.logical_received.load(Ordering::Relaxed),
            physical_sent_per_second: per_second.physical_sent,
            physical_received_per_second: per_second.physical_received,
            logical_sent_per_second: per_second.logical_sent,
            logical_received_per_second: per_second.logical_received,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            ping_min: Duration::from_micros(if min == u64::MAX { 0 } else { min }),
            ping_avg: Duration::from_micros(self.ping_avg_us.load(Ordering::Relaxed)),
            ping_max: Duration::from_micros(self.ping_max_us.load(Ordering::Relaxed)),
            mtu: self.mtu(),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub physical_sent: u64,
    pub physical_received: u64,
    pub logical_sent: u64,
    pub logical_received: u64,
    pub physical_sent_per_second: u64,
    pub physical_received_per_second: u64,
    pub logical_sent_per_second: u64,
    pub logical_received_per_second: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub ping_min: Duration,
    pub ping_avg: Duration,
    pub ping_max: Duration,
    pub mtu: usize,
}
