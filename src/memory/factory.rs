//! # Pointer Factory
//!
//! Issues [`Pointer`]s of the configured variant, keeps the factory-level
//! size counter and fans detected leaks out to registered observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use super::allocator::{Intention, PointerAllocator};
use super::pointer::Pointer;
use super::tracker::AllocationRecord;
use crate::config::TraceLevel;
use crate::error::Result;
use crate::profiling::metrics::{bytes_to_gb, MB};
use crate::profiling::{ConsumptionSampler, LeakEvent, LeakObserver};

/// Factory of direct memory pointers
pub struct PointerFactory {
    allocator: Arc<PointerAllocator>,
    safe_mode: bool,
    strict: bool,
    /// Bytes held by live tracked pointers
    size: AtomicU64,
    sampler: ConsumptionSampler,
    observers: RwLock<Vec<Arc<dyn LeakObserver>>>,
    leak_sequence: AtomicU64,
}

impl PointerFactory {
    pub fn new(
        allocator: Arc<PointerAllocator>,
        safe_mode: bool,
        strict: bool,
        trace_level: TraceLevel,
    ) -> Arc<Self> {
        if !safe_mode {
            log::warn!("Direct memory safe mode is off, pointer accesses are not bounds-checked");
        }

        Arc::new(Self {
            allocator,
            safe_mode,
            strict,
            size: AtomicU64::new(0),
            sampler: ConsumptionSampler::new(trace_level),
            observers: RwLock::new(Vec::new()),
            leak_sequence: AtomicU64::new(0),
        })
    }

    pub fn allocator(&self) -> &Arc<PointerAllocator> {
        &self.allocator
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    /// Whether new pointers are of the tracked variant
    pub fn is_tracking(&self) -> bool {
        self.allocator.is_tracking()
    }

    /// Allocate a pointer of `size` bytes
    #[track_caller]
    pub fn create_pointer(self: &Arc<Self>, size: usize) -> Result<Pointer> {
        self.create_pointer_for(size, Intention::Unspecified)
    }

    /// Allocate a pointer of `size` bytes tagged with an intention
    #[track_caller]
    pub fn create_pointer_for(self: &Arc<Self>, size: usize, intention: Intention) -> Result<Pointer> {
        let block = self.allocator.allocate_for(size, intention)?;
        let tracked = block.site().is_some();
        if tracked {
            self.size.fetch_add(size as u64, Ordering::SeqCst);
        }

        let session = self.sampler.record_allocation(size, intention);
        Ok(Pointer::new(block, Arc::clone(self), tracked, session))
    }

    /// Allocate a pointer holding a copy of `bytes`
    #[track_caller]
    pub fn create_pointer_from(self: &Arc<Self>, bytes: &[u8]) -> Result<Pointer> {
        let mut pointer = self.create_pointer(bytes.len())?;
        if let Err(e) = pointer.set_bytes(0, bytes, 0, bytes.len()) {
            let _ = pointer.free();
            return Err(e);
        }
        Ok(pointer)
    }

    /// Account memory of a freed tracked pointer
    pub(crate) fn on_memory_freed(&self, size: usize) {
        self.size.fetch_sub(size as u64, Ordering::SeqCst);
    }

    pub(crate) fn sampler_release(&self, size: usize, intention: Intention, session: Option<u64>) {
        if let Some(session) = session {
            self.sampler.record_release(size, intention, session);
        }
    }

    /// Bytes held by live tracked pointers
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn size_kb(&self) -> u64 {
        self.size() / 1024
    }

    pub fn size_mb(&self) -> u64 {
        self.size() / MB
    }

    pub fn size_gb(&self) -> f64 {
        bytes_to_gb(self.size())
    }

    pub fn sampler(&self) -> &ConsumptionSampler {
        &self.sampler
    }

    pub fn start_tracing(&self) {
        self.sampler.start();
    }

    pub fn stop_tracing(&self) {
        self.sampler.stop();
    }

    pub fn set_trace_level(&self, level: TraceLevel) {
        self.sampler.set_level(level);
    }

    /// Register an observer of leak events
    pub fn register_observer(&self, observer: Arc<dyn LeakObserver>) {
        self.observers.write().push(observer);
    }

    /// Publish a leak to every registered observer
    pub fn notify_leak(&self, record: &AllocationRecord) -> LeakEvent {
        let event = LeakEvent {
            sequence: self.leak_sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            size: record.id.size(),
            intention: record.intention,
            site: Arc::clone(&record.site),
        };

        for observer in self.observers.read().iter() {
            observer.on_leak(&event);
        }

        event
    }

    /// Run a leak check and notify observers of each detected leak
    pub fn check_for_leaks(&self) -> Vec<LeakEvent> {
        let events: Vec<LeakEvent> = self
            .allocator
            .check_for_leaks()
            .iter()
            .map(|record| self.notify_leak(record))
            .collect();

        if self.strict && !events.is_empty() {
            panic!("{} direct memory leak(s) detected, first: {}", events.len(), events[0]);
        }

        events
    }
}
