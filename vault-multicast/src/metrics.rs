//! Per-worker traffic counters

use std::time::Instant;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug)]
struct Counters {
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    errors: u64,
    active_services: usize,
    start_time: DateTime<Utc>,
    started: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            errors: 0,
            active_services: 0,
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }
}

/// Counters owned by a single publisher or listener.
///
/// Written from the worker task and read from any caller; every access
/// goes through one lock and readers only ever get a copy.
#[derive(Debug)]
pub struct Metrics {
    inner: Mutex<Counters>,
}

/// Point-in-time copy of [`Metrics`] with derived rates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub active_services: usize,
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub packets_per_second: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Counters::new()),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        let mut c = self.inner.lock();
        c.packets_sent += 1;
        c.bytes_sent += bytes as u64;
    }

    pub fn record_received(&self, bytes: usize) {
        let mut c = self.inner.lock();
        c.packets_received += 1;
        c.bytes_received += bytes as u64;
    }

    pub fn record_error(&self) {
        self.inner.lock().errors += 1;
    }

    pub fn set_active_services(&self, count: usize) {
        self.inner.lock().active_services = count;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.inner.lock();
        let uptime_seconds = c.started.elapsed().as_secs_f64();
        let packets = (c.packets_sent + c.packets_received) as f64;
        MetricsSnapshot {
            packets_sent: c.packets_sent,
            packets_received: c.packets_received,
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            errors: c.errors,
            active_services: c.active_services,
            start_time: c.start_time,
            uptime_seconds,
            packets_per_second: if uptime_seconds > 0.0 { packets / uptime_seconds } else { 0.0 },
        }
    }

    /// Zero every counter and restart the uptime clock
    pub fn reset(&self) {
        *self.inner.lock() = Counters::new();
        tracing::info!("Metrics reset");
    }
}
