//! # Memory Management Module
//!
//! Off-heap memory management for the page cache.
//!
//! [`DirectMemory`] wires the layers together once at startup and is then
//! passed by reference to every user:
//!
//! - **Backend**: raw allocate/free and typed get/set in a configured byte order
//! - **Allocator**: global counters plus the leak registry in tracking mode
//! - **Factory**: [`Pointer`]s, factory-level counters, leak observers
//! - **Pool**: reusable page-sized buffers

pub mod allocator;
pub mod backend;
pub mod factory;
pub mod pointer;
pub mod pool;
pub mod tracker;

use std::sync::Arc;

pub use allocator::{Intention, MemoryBlock, PointerAllocator};
pub use backend::{
    select_backend, AccessPolicy, Address, BackendKind, FastBackend, MemoryBackend,
    PortableBackend,
};
pub use factory::PointerFactory;
pub use pointer::{Pointer, PointerKind};
pub use pool::{BufferPool, PageBuffer};
pub use tracker::{AllocationRecord, AllocationSite, BlockId};

use crate::config::DirectMemoryConfig;
use crate::error::Result;
use crate::profiling::{format_bytes, DirectMemoryMetrics, LeakEvent};

/// State of the memory layer at verification time
///
/// The three signals are kept apart: only `leaks` are confirmed leaks.
/// Outstanding bytes may belong to blocks freed later in an orderly shutdown.
#[derive(Debug, Clone)]
pub struct StateReport {
    /// Bytes the allocator believes are still allocated
    pub outstanding_bytes: u64,
    pub outstanding_blocks: u64,
    /// Tracked blocks still registered, with their allocation sites
    pub unreleased: Vec<AllocationRecord>,
    /// Leaks detected by this verification pass
    pub leaks: Vec<LeakEvent>,
}

impl StateReport {
    /// Nothing outstanding and no leak detected
    pub fn is_clean(&self) -> bool {
        self.outstanding_bytes == 0 && self.unreleased.is_empty() && self.leaks.is_empty()
    }
}

/// Direct memory context
pub struct DirectMemory {
    config: DirectMemoryConfig,
    backend: Arc<dyn MemoryBackend>,
    allocator: Arc<PointerAllocator>,
    factory: Arc<PointerFactory>,
    pool: BufferPool,
}

impl DirectMemory {
    /// Build the memory layer from a validated configuration
    pub fn new(config: DirectMemoryConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let backend = select_backend(&config);
        let allocator = Arc::new(PointerAllocator::new(
            Arc::clone(&backend),
            config.track_mode,
            config.strict_tracking,
        ));
        let factory = PointerFactory::new(
            Arc::clone(&allocator),
            config.safe_mode,
            config.strict_tracking,
            config.trace_level,
        );
        let pool = BufferPool::from_config(Arc::clone(&backend), &config);

        if config.tracing_enabled {
            factory.start_tracing();
        }

        log::info!(
            "Direct memory ready: {:?} backend, {} pages, safe mode {}, tracking {}",
            backend.kind(),
            format_bytes(config.page_size() as u64),
            config.safe_mode,
            config.track_mode
        );

        Ok(Arc::new(Self {
            config,
            backend,
            allocator,
            factory,
            pool,
        }))
    }

    pub fn config(&self) -> &DirectMemoryConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub fn allocator(&self) -> &Arc<PointerAllocator> {
        &self.allocator
    }

    pub fn factory(&self) -> &Arc<PointerFactory> {
        &self.factory
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Allocate a pointer through the factory
    #[track_caller]
    pub fn create_pointer(&self, size: usize) -> Result<Pointer> {
        self.factory.create_pointer(size)
    }

    /// Snapshot of the operational counters
    pub fn metrics(&self) -> DirectMemoryMetrics {
        let sampler = self.factory.sampler();

        DirectMemoryMetrics {
            backend: self.backend.kind(),
            safe_mode: self.factory.safe_mode(),
            tracking: self.allocator.is_tracking(),
            buffer_size: self.pool.buffer_size(),
            buffers_in_pool: self.pool.buffers_in_pool(),
            allocated_buffer_count: self.pool.allocated_buffer_count(),
            preallocated_buffer_count: self.pool.preallocated_buffer_count(),
            overflow_buffer_count: self.pool.overflow_buffer_count(),
            pool_allocated_memory: self.pool.allocated_memory(),
            pool_allocated_memory_mb: self.pool.allocated_memory_mb(),
            pool_allocated_memory_gb: self.pool.allocated_memory_gb(),
            pre_allocation_limit: self.pool.pre_allocation_limit(),
            max_pages_per_area: self.pool.max_pages_per_area(),
            allocated_bytes: self.allocator.memory_consumption(),
            allocated_blocks: self.allocator.outstanding_blocks(),
            leaks_detected: self.allocator.leaked_count(),
            factory_bytes: self.factory.size(),
            factory_mb: self.factory.size_mb(),
            factory_gb: self.factory.size_gb(),
            tracing: sampler.is_enabled().then(|| sampler.snapshot()),
        }
    }

    /// Run a leak check, notifying registered observers
    pub fn check_for_leaks(&self) -> Vec<LeakEvent> {
        self.factory.check_for_leaks()
    }

    /// Report outstanding memory and run a leak check
    pub fn verify_state(&self) -> StateReport {
        let leaks = self.check_for_leaks();
        let unreleased = self.allocator.tracked_records();
        let outstanding_bytes = self.allocator.memory_consumption();
        let outstanding_blocks = self.allocator.outstanding_blocks();

        for record in &unreleased {
            log::warn!(
                "DIRECT-TRACK: {} bytes not released yet, allocated from {}",
                record.id.size(),
                record.site.location()
            );
        }

        if outstanding_bytes > 0 {
            log::warn!(
                "{} of direct memory in {} blocks still allocated",
                format_bytes(outstanding_bytes),
                outstanding_blocks
            );
        } else {
            log::debug!("Direct memory verified, nothing outstanding");
        }

        StateReport {
            outstanding_bytes,
            outstanding_blocks,
            unreleased,
            leaks,
        }
    }

    /// Drain the buffer pool, stop tracing and verify state
    pub fn shutdown(&self) -> StateReport {
        log::info!("Direct memory shutting down...");

        let dropped = self.pool.clear();
        log::debug!("Released {} pooled buffers", dropped);

        self.factory.stop_tracing();

        let report = self.verify_state();
        log::info!("Direct memory shutdown complete");
        report
    }
}

impl std::fmt::Debug for DirectMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectMemory")
            .field("backend", &self.backend.kind())
            .field("allocator", &self.allocator)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSelection;
    use crate::error::MemoryError;

    fn tracked() -> Arc<DirectMemory> {
        DirectMemory::new(DirectMemoryConfig {
            track_mode: true,
            strict_tracking: false,
            page_size_kb: 4,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = DirectMemory::new(DirectMemoryConfig {
            page_size_kb: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(MemoryError::InvalidConfig(_))));
    }

    #[test]
    fn test_portable_backend_requested() {
        let memory = DirectMemory::new(DirectMemoryConfig {
            backend: BackendSelection::Portable,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(memory.metrics().backend, BackendKind::Portable);
    }

    #[test]
    fn test_clean_shutdown() {
        let memory = tracked();
        let mut pointer = memory.create_pointer(128).unwrap();
        let buffer = memory.pool().acquire(true).unwrap();
        memory.pool().release(buffer);

        pointer.free().unwrap();
        let report = memory.shutdown();

        assert!(report.is_clean());
        assert_eq!(memory.pool().buffers_in_pool(), 0);
        assert_eq!(memory.metrics().pool_allocated_memory, 0);
    }

    #[test]
    fn test_outstanding_is_not_a_leak() {
        let memory = tracked();
        let mut pointer = memory.create_pointer(64).unwrap();

        let report = memory.verify_state();
        assert_eq!(report.outstanding_bytes, 64);
        assert_eq!(report.unreleased.len(), 1);
        assert!(report.leaks.is_empty());

        pointer.free().unwrap();
        assert!(memory.verify_state().is_clean());
    }

    #[test]
    fn test_dropped_pointer_is_a_leak() {
        let memory = tracked();
        drop(memory.create_pointer(32).unwrap());

        let report = memory.verify_state();
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.outstanding_bytes, 32);
        assert!(report.unreleased.is_empty());
        assert_eq!(memory.metrics().leaks_detected, 1);
    }

    #[test]
    fn test_metrics_snapshot() {
        let memory = DirectMemory::new(DirectMemoryConfig {
            tracing_enabled: true,
            ..Default::default()
        })
        .unwrap();
        let mut pointer = memory.create_pointer(1000).unwrap();

        let metrics = memory.metrics();
        assert_eq!(metrics.buffer_size, 64 * 1024);
        assert_eq!(metrics.allocated_bytes, 1000);
        assert_eq!(metrics.factory_bytes, 0);
        assert_eq!(metrics.tracing.as_ref().map(|t| t.total_bytes), Some(1000));

        pointer.free().unwrap();
        assert_eq!(memory.metrics().allocated_bytes, 0);
    }
}
