//! Memory component of a CPI stack from sampled reuse profiles: StatStack
//! cache miss ratios interpolated over analysis windows, and the MLP and bus
//! queuing that scale DRAM misses into cycles.

pub mod config;
pub mod diag;
pub mod error;
pub mod metadata;
pub mod mlp;
pub mod pipeline;
pub mod pool;
pub mod records;
pub mod statstack;
pub mod trace;
