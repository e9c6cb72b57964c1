//! # Profiling
//!
//! Operational metrics, consumption sampling and leak notifications of the
//! direct memory layer.

pub mod leaks;
pub mod metrics;
pub mod sampler;

pub use leaks::*;
pub use metrics::*;
pub use sampler::*;
