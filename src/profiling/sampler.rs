//! # Consumption Sampler
//!
//! Lightweight aggregate of direct memory consumption, independent of leak
//! tracking. Toggled at run time with `start`/`stop`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use crate::config::TraceLevel;
use crate::memory::Intention;

/// Consumption counters sampled since the current session started
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionSnapshot {
    pub session: u64,
    pub level: TraceLevel,
    pub total_bytes: i64,
    pub peak_bytes: i64,
    pub allocations: u64,
    pub releases: u64,
    /// Filled only at the `Intention` level
    pub by_intention: Vec<(Intention, i64)>,
}

/// Aggregating sampler of factory allocations
pub struct ConsumptionSampler {
    enabled: AtomicBool,
    level: AtomicU8,
    session: AtomicU64,
    total: AtomicI64,
    peak: AtomicI64,
    allocations: AtomicU64,
    releases: AtomicU64,
    by_intention: [AtomicI64; Intention::COUNT],
}

impl ConsumptionSampler {
    pub fn new(level: TraceLevel) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            level: AtomicU8::new(encode_level(level)),
            session: AtomicU64::new(0),
            total: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            by_intention: Default::default(),
        }
    }

    /// Start a new sampling session, resetting the aggregates
    pub fn start(&self) {
        if self.enabled.load(Ordering::SeqCst) {
            return;
        }

        self.total.store(0, Ordering::SeqCst);
        self.peak.store(0, Ordering::SeqCst);
        self.allocations.store(0, Ordering::SeqCst);
        self.releases.store(0, Ordering::SeqCst);
        for counter in &self.by_intention {
            counter.store(0, Ordering::SeqCst);
        }

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.enabled.store(true, Ordering::SeqCst);
        log::info!("Direct memory tracing started (session {})", session);
    }

    /// Stop sampling and emit the final aggregate
    pub fn stop(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            self.emit();
            log::info!("Direct memory tracing stopped");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_level(&self, level: TraceLevel) {
        self.level.store(encode_level(level), Ordering::SeqCst);
    }

    pub fn level(&self) -> TraceLevel {
        decode_level(self.level.load(Ordering::SeqCst))
    }

    /// Account an allocation; returns the session it was sampled in
    pub fn record_allocation(&self, size: usize, intention: Intention) -> Option<u64> {
        if !self.is_enabled() {
            return None;
        }

        let size = size as i64;
        let total = self.total.fetch_add(size, Ordering::SeqCst) + size;
        self.peak.fetch_max(total, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.by_intention[intention.index()].fetch_add(size, Ordering::SeqCst);

        Some(self.session.load(Ordering::SeqCst))
    }

    /// Account a release of memory sampled in `session`
    pub fn record_release(&self, size: usize, intention: Intention, session: u64) {
        if !self.is_enabled() || session != self.session.load(Ordering::SeqCst) {
            return;
        }

        let size = size as i64;
        self.total.fetch_sub(size, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.by_intention[intention.index()].fetch_sub(size, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ConsumptionSnapshot {
        let level = self.level();
        let by_intention = match level {
            TraceLevel::Total => Vec::new(),
            TraceLevel::Intention => Intention::ALL
                .iter()
                .map(|&intention| {
                    (
                        intention,
                        self.by_intention[intention.index()].load(Ordering::SeqCst),
                    )
                })
                .collect(),
        };

        ConsumptionSnapshot {
            session: self.session.load(Ordering::SeqCst),
            level,
            total_bytes: self.total.load(Ordering::SeqCst),
            peak_bytes: self.peak.load(Ordering::SeqCst),
            allocations: self.allocations.load(Ordering::SeqCst),
            releases: self.releases.load(Ordering::SeqCst),
            by_intention,
        }
    }

    /// Publish the current aggregate as a structured event
    pub fn emit(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "offheap_core::sampler",
            session = snapshot.session,
            total_bytes = snapshot.total_bytes,
            peak_bytes = snapshot.peak_bytes,
            allocations = snapshot.allocations,
            releases = snapshot.releases,
            "direct memory consumption"
        );

        for (intention, bytes) in &snapshot.by_intention {
            tracing::info!(
                target: "offheap_core::sampler",
                session = snapshot.session,
                intention = ?intention,
                bytes = *bytes,
                "direct memory consumption by intention"
            );
        }
    }
}

impl Default for ConsumptionSampler {
    fn default() -> Self {
        Self::new(TraceLevel::Total)
    }
}

fn encode_level(level: TraceLevel) -> u8 {
    match level {
        TraceLevel::Total => 0,
        TraceLevel::Intention => 1,
    }
}

fn decode_level(raw: u8) -> TraceLevel {
    match raw {
        1 => TraceLevel::Intention,
        _ => TraceLevel::Total,
    }
}
