//! Live set of announced services keyed by `addr`

pub mod hash;

use std::collections::HashMap;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shared::protocol::{FIELD_ADDR, FIELD_TYPE};
use shared::ServiceDescriptor;
use crate::config::RegistryConfig;
use crate::error::{DescriptorError, Result};

/// A service as last heard from
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntry {
    pub addr: String,
    /// Latest descriptor, replaced wholesale on every receipt
    pub descriptor: ServiceDescriptor,
    #[serde(skip)]
    pub last_seen: Instant,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub seen_count: u64,
}

impl ServiceEntry {
    pub fn is_alive_at(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < window
    }

    pub fn name(&self) -> &str {
        self.descriptor.name().unwrap_or("Unknown Service")
    }
}

/// What `on_descriptor` did with an accepted descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Discovered,
    Refreshed,
}

pub struct ServiceRegistry {
    liveness_window: Duration,
    type_filter: String,
    entries: Mutex<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            liveness_window: config.liveness_window(),
            type_filter: config.type_filter.clone(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Check required fields and the type filter; returns the addr key
    pub fn validate<'a>(&self, descriptor: &'a ServiceDescriptor) -> std::result::Result<&'a str, DescriptorError> {
        let service_type = required_str(descriptor, FIELD_TYPE)?;
        let addr = required_str(descriptor, FIELD_ADDR)?;

        if !self.type_filter.is_empty() && !service_type.contains(&self.type_filter) {
            return Err(DescriptorError::Filtered {
                service_type: service_type.to_string(),
                filter: self.type_filter.clone(),
            });
        }
        Ok(addr)
    }

    pub fn on_descriptor(&self, descriptor: &ServiceDescriptor) -> std::result::Result<Upsert, DescriptorError> {
        self.on_descriptor_at(descriptor, Instant::now())
    }

    /// Insert or refresh the entry for the descriptor's addr as of `now`.
    ///
    /// A rejected descriptor leaves the registry untouched.
    pub fn on_descriptor_at(
        &self,
        descriptor: &ServiceDescriptor,
        now: Instant,
    ) -> std::result::Result<Upsert, DescriptorError> {
        let addr = self.validate(descriptor)?;
        let wall = Utc::now();

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(addr) {
            entry.descriptor = descriptor.clone();
            entry.last_seen = now;
            entry.last_seen_at = wall;
            entry.seen_count += 1;
            return Ok(Upsert::Refreshed);
        }

        entries.insert(
            addr.to_string(),
            ServiceEntry {
                addr: addr.to_string(),
                descriptor: descriptor.clone(),
                last_seen: now,
                first_seen_at: wall,
                last_seen_at: wall,
                seen_count: 1,
            },
        );
        tracing::info!("Service discovered: {} at {}", descriptor.name().unwrap_or("unknown"), addr);
        Ok(Upsert::Discovered)
    }

    /// Drop every entry not heard from within the liveness window
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<String> {
        let window = self.liveness_window;
        let mut removed = Vec::new();
        self.entries.lock().retain(|addr, entry| {
            let alive = entry.is_alive_at(now, window);
            if !alive {
                removed.push(addr.clone());
            }
            alive
        });

        removed.sort();
        for addr in &removed {
            tracing::info!("Service timeout: {}", addr);
        }
        removed
    }

    /// Forget everything, e.g. for a manual refresh
    pub fn reset(&self) {
        self.entries.lock().clear();
        tracing::info!("Service registry cleared");
    }

    pub fn get(&self, addr: &str) -> Option<ServiceEntry> {
        self.entries.lock().get(addr).cloned()
    }

    /// All entries, ordered by addr
    pub fn snapshot(&self) -> Vec<ServiceEntry> {
        let mut entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.addr.cmp(&b.addr));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count_at(Instant::now())
    }

    pub fn alive_count_at(&self, now: Instant) -> usize {
        let window = self.liveness_window;
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_alive_at(now, window))
            .count()
    }

    /// Content hash for cheap change detection by pollers
    pub fn digest(&self) -> String {
        hash::compute_digest(&self.snapshot())
    }
}

fn required_str<'a>(descriptor: &'a ServiceDescriptor, field: &'static str) -> std::result::Result<&'a str, DescriptorError> {
    match descriptor.get(field) {
        None => Err(DescriptorError::MissingField(field)),
        Some(value) => value.as_str().ok_or(DescriptorError::NotAString(field)),
    }
}
