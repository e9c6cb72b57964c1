//! # Offheap Core - Direct Memory Layer
//!
//! Off-heap memory for a database page cache.
//!
//! ## Modules
//!
//! - **Backend**: fast in-process and portable native allocators with
//!   configurable byte order
//! - **Allocator**: global consumption counters and leak tracking
//! - **Pointer**: bounds-checked access to allocated blocks
//! - **Buffer Pool**: lock-free reuse of page-sized buffers
//! - **Profiling**: metrics snapshots, consumption sampling, leak events
//!
//! ## Usage
//!
//! ```no_run
//! use offheap_core::{DirectMemory, DirectMemoryConfig};
//!
//! let memory = DirectMemory::new(DirectMemoryConfig::default())?;
//! let mut pointer = memory.create_pointer(64)?;
//! pointer.set_long(0, 42)?;
//! assert_eq!(pointer.get_long(0)?, 42);
//! pointer.free()?;
//! # Ok::<(), offheap_core::MemoryError>(())
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod profiling;

// Re-exports
pub use config::{BackendSelection, ByteOrder, DirectMemoryConfig, TraceLevel};
pub use error::{MemoryError, Result};
pub use memory::{
    BufferPool, DirectMemory, Intention, PageBuffer, Pointer, PointerAllocator, PointerFactory,
    PointerKind, StateReport,
};
pub use profiling::{DirectMemoryMetrics, LeakCollector, LeakEvent, LeakObserver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "offheap_core";

/// Initialize logging
///
/// Installs a fmt subscriber unless the host already installed one.
pub fn init_logging() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .try_init();
}
