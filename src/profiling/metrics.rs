//! # Direct Memory Metrics
//!
//! Pull side of the operational counters.

use serde::Serialize;

use super::sampler::ConsumptionSnapshot;
use crate::memory::backend::BackendKind;

/// Read-only snapshot of the operational counters
#[derive(Debug, Clone, Serialize)]
pub struct DirectMemoryMetrics {
    pub backend: BackendKind,
    pub safe_mode: bool,
    pub tracking: bool,

    /// Pool buffer size in bytes
    pub buffer_size: usize,
    pub buffers_in_pool: usize,
    /// Allocation position: fresh buffers created by the pool
    pub allocated_buffer_count: u64,
    pub preallocated_buffer_count: u64,
    pub overflow_buffer_count: u64,
    pub pool_allocated_memory: u64,
    pub pool_allocated_memory_mb: u64,
    pub pool_allocated_memory_gb: f64,
    /// Pages which may be carved from preallocated areas
    pub pre_allocation_limit: u64,
    pub max_pages_per_area: usize,

    /// Allocator ground truth
    pub allocated_bytes: u64,
    pub allocated_blocks: u64,
    pub leaks_detected: u64,

    /// Tracked pointers issued by the factory
    pub factory_bytes: u64,
    pub factory_mb: u64,
    pub factory_gb: f64,

    pub tracing: Option<ConsumptionSnapshot>,
}

impl DirectMemoryMetrics {
    /// Serialize for an external monitoring facility
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("Backend:          {:?}\n", self.backend));
        s.push_str(&format!("Allocated:        {}\n", format_bytes(self.allocated_bytes)));
        s.push_str(&format!("Blocks:           {}\n", self.allocated_blocks));
        s.push_str(&format!("Factory:          {}\n", format_bytes(self.factory_bytes)));
        s.push_str(&format!("Leaks detected:   {}\n", self.leaks_detected));
        s.push_str("\nBuffer pool:\n");
        s.push_str(&format!("  Buffer size:    {}\n", format_bytes(self.buffer_size as u64)));
        s.push_str(&format!("  In pool:        {}\n", self.buffers_in_pool));
        s.push_str(&format!("  Allocated:      {}\n", self.allocated_buffer_count));
        s.push_str(&format!("  Preallocated:   {}\n", self.preallocated_buffer_count));
        s.push_str(&format!("  Overflow:       {}\n", self.overflow_buffer_count));
        s.push_str(&format!("  Memory:         {}\n", format_bytes(self.pool_allocated_memory)));

        if let Some(tracing) = &self.tracing {
            s.push_str(&format!(
                "\nTracing (session {}): {} (peak: {})\n",
                tracing.session,
                format_bytes(tracing.total_bytes.max(0) as u64),
                format_bytes(tracing.peak_bytes.max(0) as u64)
            ));
            for (intention, bytes) in &tracing.by_intention {
                s.push_str(&format!(
                    "  {:?}: {}\n",
                    intention,
                    format_bytes((*bytes).max(0) as u64)
                ));
            }
        }

        s
    }
}

pub(crate) const MB: u64 = 1024 * 1024;
pub(crate) const GB: u64 = MB * 1024;

/// Bytes in GB, rounded up to two decimals
pub fn bytes_to_gb(bytes: u64) -> f64 {
    ((bytes as f64 * 100.0) / GB as f64).ceil() / 100.0
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
