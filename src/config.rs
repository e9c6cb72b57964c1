//! # Direct Memory Configuration
//!
//! Configuration parsed from host-provided JSON.

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Backend selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendSelection {
    /// Fast backend unless the platform rules it out
    Auto,
    Fast,
    Portable,
}

impl Default for BackendSelection {
    fn default() -> Self {
        BackendSelection::Auto
    }
}

/// Byte order of multi-byte values stored in direct memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ByteOrder {
    Native,
    BigEndian,
    LittleEndian,
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::Native
    }
}

impl ByteOrder {
    /// Resolve `Native` to the concrete order of the running target
    pub fn resolve(self) -> ByteOrder {
        match self {
            ByteOrder::Native if cfg!(target_endian = "big") => ByteOrder::BigEndian,
            ByteOrder::Native => ByteOrder::LittleEndian,
            other => other,
        }
    }

    /// Whether values in this order can be copied as native words
    pub fn is_native(self) -> bool {
        self.resolve() == ByteOrder::Native.resolve()
    }
}

/// Aggregation level of the consumption sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceLevel {
    /// Only the grand total
    Total,
    /// Total plus bytes per allocation intention
    Intention,
}

impl Default for TraceLevel {
    fn default() -> Self {
        TraceLevel::Total
    }
}

/// Direct memory configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirectMemoryConfig {
    /// Size of a pool page in KB
    pub page_size_kb: u32,

    /// Register allocations for leak detection
    pub track_mode: bool,

    /// Bounds-check every pointer access
    pub safe_mode: bool,

    /// Backend selection policy
    pub backend: BackendSelection,

    /// Force the byte-by-byte access path
    pub only_aligned_access: bool,

    /// Byte order of multi-byte values
    pub byte_order: ByteOrder,

    /// Carve pool pages from large preallocated areas
    pub preallocate: bool,

    /// Maximum size in bytes of a single preallocated area
    pub memory_chunk_size: usize,

    /// Bytes of pages which may be carved from preallocated areas
    pub pre_allocation_limit: u64,

    /// Maximum amount of pages kept in the pool free list
    pub pool_limit: usize,

    /// Panic on double free or detected leak in tracking mode; on in debug builds
    pub strict_tracking: bool,

    /// Sampler aggregation level
    pub trace_level: TraceLevel,

    /// Start the consumption sampler at startup
    pub tracing_enabled: bool,
}

impl Default for DirectMemoryConfig {
    fn default() -> Self {
        Self {
            page_size_kb: 64,
            track_mode: false,
            safe_mode: true,
            backend: BackendSelection::Auto,
            only_aligned_access: false,
            byte_order: ByteOrder::Native,
            preallocate: false,
            memory_chunk_size: i32::MAX as usize,
            pre_allocation_limit: 0,
            pool_limit: usize::MAX,
            strict_tracking: cfg!(debug_assertions),
            trace_level: TraceLevel::Total,
            tracing_enabled: false,
        }
    }
}

impl DirectMemoryConfig {
    /// Parse config from bytes (JSON)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            log::warn!("Empty direct memory config data, using defaults");
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_slice(data)
            .map_err(|e| MemoryError::InvalidConfig(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Reject settings the memory layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size_kb == 0 {
            return Err(MemoryError::InvalidConfig(
                "page size must be at least 1 KB".to_string(),
            ));
        }
        if self.pool_limit == 0 {
            return Err(MemoryError::InvalidConfig(
                "pool limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size_kb as usize * 1024
    }
}
