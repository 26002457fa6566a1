//! Per-line derivation of report metrics
//!
//! Builds one line's record from the raw counters in the statistics store:
//! clamps subtraction noise, normalizes against the global totals (every
//! division site names its zero fallback), sums allocation counters across
//! every byte index recorded for the line, and scales attributed CPU
//! percentages by the observed utilization.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::running_stats::FootprintSample;
use crate::source_cache::SourceCache;
use crate::statistics::ProfileStats;

/// Decides whether a (file, line) pair is eligible for display.
///
/// Implemented by the surrounding application; independent of whether the
/// line's computed metrics are all zero.
pub trait IsReportable {
    fn is_reportable(&self, file: &str, line: u32) -> bool;
}

impl<F> IsReportable for F
where
    F: Fn(&str, u32) -> bool,
{
    fn is_reportable(&self, file: &str, line: u32) -> bool {
        self(file, line)
    }
}

/// Derived metrics for one source line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineReport {
    /// 1-based line number
    pub lineno: u32,
    /// Raw source text, including the trailing newline
    pub line: String,
    /// CPU time in native code, percent of total (utilization-adjusted)
    pub n_cpu_percent_c: f64,
    /// CPU time in the interpreter, percent of total (utilization-adjusted)
    pub n_cpu_percent_python: f64,
    /// Wall time attributed to work outside the interpreter, percent
    pub n_sys_percent: f64,
    /// GPU time, percent of total
    pub n_gpu_percent: f64,
    /// Average allocation size (MB), not net of frees
    pub n_growth_mb: f64,
    /// Total allocated MB across the line's allocation sites
    pub n_malloc_mb: f64,
    /// Fraction of total malloc volume attributed to this line
    pub n_usage_fraction: f64,
    /// Fraction of total malloc volume attributed to the interpreter
    pub n_python_fraction: f64,
    /// memcpy throughput (MB/s)
    pub n_copy_mb_s: f64,
    /// Footprint time series for this line, empty when all-zero
    pub memory_samples: Vec<FootprintSample>,
}

impl LineReport {
    /// True iff any derived metric is non-zero (line number and source text
    /// excluded). An all-zero line is noise even if reportable.
    pub fn has_signal(&self) -> bool {
        self.n_cpu_percent_c != 0.0
            || self.n_cpu_percent_python != 0.0
            || self.n_sys_percent != 0.0
            || self.n_gpu_percent != 0.0
            || self.n_growth_mb != 0.0
            || self.n_malloc_mb != 0.0
            || self.n_usage_fraction != 0.0
            || self.n_python_fraction != 0.0
            || self.n_copy_mb_s != 0.0
            || !self.memory_samples.is_empty()
    }
}

/// Look up a per-line f64 counter, 0.0 when absent
fn per_line(map: &crate::statistics::PerLine<f64>, file: &str, line: u32) -> f64 {
    map.get(file)
        .and_then(|lines| lines.get(&line))
        .copied()
        .unwrap_or(0.0)
}

/// Build the report record for one line, or `None` when the line is not
/// reportable (and printing is not forced).
///
/// Reads the source line lazily through `source`; that read is the only
/// fallible operation here.
#[allow(clippy::too_many_arguments)]
pub fn build_line(
    stats: &ProfileStats,
    source: &mut SourceCache,
    file: &str,
    line: u32,
    reportable: &dyn IsReportable,
    profile_memory: bool,
    force_print: bool,
) -> Result<Option<LineReport>> {
    if !force_print && !reportable.is_reportable(file, line) {
        return Ok(None);
    }

    // Correct for negative native CPU sample counts. These arise from
    // floating-point inaccuracies, since the value is computed by
    // subtraction.
    let n_cpu_samples_c = per_line(&stats.cpu_samples_c, file, line).max(0.0);
    let n_cpu_samples_python = per_line(&stats.cpu_samples_python, file, line);
    let n_gpu_samples = per_line(&stats.gpu_samples, file, line);

    let (mut n_cpu_percent_c, mut n_cpu_percent_python) = if stats.total_cpu_samples > 0.0 {
        (
            n_cpu_samples_c * 100.0 / stats.total_cpu_samples,
            n_cpu_samples_python * 100.0 / stats.total_cpu_samples,
        )
    } else {
        (0.0, 0.0)
    };

    let n_gpu_percent = if stats.total_gpu_samples > 0.0 {
        n_gpu_samples * 100.0 / stats.total_gpu_samples
    } else {
        0.0
    };

    // Accumulate memory counters from every byte index recorded for the line.
    let mut n_malloc_mb = 0.0;
    let mut n_mallocs: u64 = 0;
    let mut n_python_malloc_mb = 0.0;
    let mut n_free_mb = 0.0;
    if let Some(indices) = stats.byte_index_map.get(file).and_then(|m| m.get(&line)) {
        for index in indices {
            let at = |map: &crate::statistics::PerByteIndex<f64>| {
                map.get(file)
                    .and_then(|m| m.get(&line))
                    .and_then(|m| m.get(index))
                    .copied()
                    .unwrap_or(0.0)
            };
            n_malloc_mb += at(&stats.memory_malloc_samples);
            n_python_malloc_mb += at(&stats.memory_python_samples);
            n_free_mb += at(&stats.memory_free_samples);
            n_mallocs += stats
                .memory_malloc_count
                .get(file)
                .and_then(|m| m.get(&line))
                .and_then(|m| m.get(index))
                .copied()
                .unwrap_or(0);
        }
    }
    let _ = n_free_mb; // growth is average allocation size, not net of frees

    let n_usage_fraction = if stats.total_memory_malloc_samples > 0.0 {
        n_malloc_mb / stats.total_memory_malloc_samples
    } else {
        0.0
    };
    // Guarded on the line's own malloc volume (see DESIGN.md) in addition to
    // the zero-total pre-check.
    let n_python_fraction = if n_malloc_mb > 0.0 && stats.total_memory_malloc_samples > 0.0 {
        n_python_malloc_mb / stats.total_memory_malloc_samples
    } else {
        0.0
    };

    let n_growth_mb = if n_mallocs > 0 {
        n_malloc_mb / n_mallocs as f64
    } else {
        0.0
    };

    let utilization = stats
        .cpu_utilization
        .get(file)
        .and_then(|lines| lines.get(&line))
        .map(|u| u.mean())
        .unwrap_or(0.0);

    let n_cpu_percent = n_cpu_percent_c + n_cpu_percent_python;
    let n_sys_percent = n_cpu_percent * (1.0 - utilization);

    // Adjust CPU time by utilization: the reported percentages represent
    // interpreter-attributed time net of idle/blocked time.
    n_cpu_percent_python *= utilization;
    n_cpu_percent_c *= utilization;

    let n_copy_b = per_line(&stats.memcpy_samples, file, line);
    let n_copy_mb_s = if stats.elapsed_time_sec > 0.0 {
        n_copy_b / (1_048_576.0 * stats.elapsed_time_sec)
    } else {
        0.0
    };

    let memory_samples = if profile_memory {
        stats
            .per_line_footprint_samples
            .get(file)
            .and_then(|lines| lines.get(&line))
            .filter(|series| !series.is_all_zero())
            .map(|series| series.samples().to_vec())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let text = source.line(Path::new(file), line)?.to_string();

    Ok(Some(LineReport {
        lineno: line,
        line: text,
        n_cpu_percent_c,
        n_cpu_percent_python,
        n_sys_percent,
        n_gpu_percent,
        n_growth_mb,
        n_malloc_mb,
        n_usage_fraction,
        n_python_fraction,
        n_copy_mb_s,
        memory_samples,
    }))
}
