//! Lineprof - report aggregation core for a line-level sampling profiler
//!
//! This library turns raw per-source-line execution counters (CPU time split
//! by native/interpreted, GPU time, allocation volume, copy bandwidth) into a
//! structured profiling report. Sampling and memory-allocation interposition
//! are external collaborators that populate the [`statistics::ProfileStats`]
//! store; this crate corrects noisy counters, normalizes them into zero-safe
//! percentages and rates, merges child-process statistics, and assembles a
//! nested report with stable ordering.

pub mod call_site;
pub mod error;
pub mod line_report;
pub mod report;
pub mod running_stats;
pub mod source_cache;
pub mod statistics;
