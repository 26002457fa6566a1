//! Report assembly
//!
//! Orchestrates one aggregation pass over the statistics store: merges
//! child-process stores (parent only), decides whether anything was
//! collected, selects and orders the files worth reporting, and emits the
//! nested report structure line by line. Child processes never emit a
//! report; they persist their store for the parent to merge.

use std::fmt;
use std::path::Path;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::Result;
use crate::line_report::{build_line, IsReportable, LineReport};
use crate::running_stats::FootprintSample;
use crate::source_cache::SourceCache;
use crate::statistics::ProfileStats;

/// Default: skip files responsible for fewer mallocs than this
pub const DEFAULT_MALLOC_THRESHOLD: f64 = 1.0;

/// Default: skip files responsible for less CPU time than this (percent)
pub const DEFAULT_CPU_PERCENT_THRESHOLD: f64 = 1.0;

/// Whether this invocation runs in the top-level process or in a spawned
/// child. Selected once at entry; drives both terminal paths of the
/// aggregation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Top-level process: merges child stores and emits the report
    Parent,
    /// Spawned child: persists its store keyed by `pid` and emits nothing
    Child { pid: u32 },
}

/// Report for one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    /// CPU time attributed to this file, percent of total
    pub percent_cpu_time: f64,
    /// Per-line records, in line order, all-zero lines suppressed
    pub lines: Vec<LineReport>,
}

/// The per-file section of the report.
///
/// Serializes as a JSON mapping keyed by display filename while preserving
/// emission order: descending by per-file CPU samples, ties broken ascending
/// by filename. A plain map type would lose that ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMap(pub Vec<(String, FileReport)>);

impl FileMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Look up a file's report by display name
    pub fn get(&self, name: &str) -> Option<&FileReport> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    /// Display names in emission order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }
}

impl Serialize for FileMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, report) in &self.0 {
            map.serialize_entry(name, report)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FileMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FileMapVisitor;

        impl<'de> Visitor<'de> for FileMapVisitor {
            type Value = FileMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of filename to file report")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<FileMap, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry()? {
                    entries.push(entry);
                }
                Ok(FileMap(entries))
            }
        }

        deserializer.deserialize_map(FileMapVisitor)
    }
}

/// Envelope of a non-empty report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBody {
    /// Total time spent in the profiled program (seconds)
    pub elapsed_time_sec: f64,
    /// Normalized memory growth rate, percent (0 when memory profiling is
    /// disabled or the velocity denominator is 0)
    pub growth_rate: f64,
    /// Global memory footprint time series
    pub samples: Vec<FootprintSample>,
    /// Peak memory footprint (MB)
    pub max_footprint_mb: f64,
    /// Per-file reports in selection order
    pub files: FileMap,
}

/// A completed aggregation pass.
///
/// An empty report is a valid terminal state (nothing collected, nothing
/// survived filtering, or a child-process invocation), distinct from a
/// failure; it serializes as an empty JSON mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileReport {
    Full(ReportBody),
    Empty {},
}

impl ProfileReport {
    /// The empty report
    pub fn empty() -> Self {
        ProfileReport::Empty {}
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ProfileReport::Empty {})
    }

    /// The report body, if anything was reported
    pub fn body(&self) -> Option<&ReportBody> {
        match self {
            ProfileReport::Full(body) => Some(body),
            ProfileReport::Empty {} => None,
        }
    }

    /// Serialize to a pretty-printed JSON string
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Builds the final nested report from a statistics store
#[derive(Debug, Clone)]
pub struct ReportAggregator {
    malloc_threshold: f64,
    cpu_percent_threshold: f64,
    cell_pattern: Regex,
}

impl Default for ReportAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportAggregator {
    /// Create an aggregator with the default reporting thresholds
    pub fn new() -> Self {
        Self::with_thresholds(DEFAULT_MALLOC_THRESHOLD, DEFAULT_CPU_PERCENT_THRESHOLD)
    }

    /// Create an aggregator with explicit reporting thresholds
    pub fn with_thresholds(malloc_threshold: f64, cpu_percent_threshold: f64) -> Self {
        Self {
            malloc_threshold,
            cpu_percent_threshold,
            // Interactive-session pseudo-filenames for notebook cells.
            cell_pattern: Regex::new(r"^<ipython-input-([0-9]+)-.*>$")
                .expect("cell pattern is a valid regex"),
        }
    }

    /// Restore an interactive cell's display name: `<ipython-input-7-x>`
    /// renders as `[7]`. Any other filename passes through unchanged.
    pub fn display_name(&self, file: &str) -> String {
        match self.cell_pattern.captures(file) {
            Some(caps) => format!("[{}]", &caps[1]),
            None => file.to_string(),
        }
    }

    /// CPU time attributed to `file`, percent of total; 0 on a zero total
    fn file_cpu_percent(&self, stats: &ProfileStats, file: &str) -> f64 {
        if stats.total_cpu_samples > 0.0 {
            100.0 * stats.cpu_samples_by_file.get(file).copied().unwrap_or(0.0)
                / stats.total_cpu_samples
        } else {
            0.0
        }
    }

    /// Run one aggregation pass over `stats`.
    ///
    /// `Parent` mode first absorbs any child stores under `aux_dir`;
    /// `Child` mode persists `stats` there instead of reporting. The
    /// returned report is empty when nothing was collected, when no file
    /// clears the reporting thresholds, or for any child invocation.
    pub fn build_report(
        &self,
        stats: &mut ProfileStats,
        mode: ProcessMode,
        reportable: &dyn IsReportable,
        aux_dir: &Path,
        profile_memory: bool,
    ) -> Result<ProfileReport> {
        // Get the children's stats, if any.
        if mode == ProcessMode::Parent {
            stats.merge_from_dir(aux_dir)?;
        }

        if stats.is_empty() {
            return Ok(ProfileReport::empty());
        }

        // Union of every file observed by any sampler.
        let mut all_files: Vec<&String> = stats
            .cpu_samples_python
            .keys()
            .chain(stats.cpu_samples_c.keys())
            .chain(stats.memory_free_samples.keys())
            .chain(stats.memory_malloc_samples.keys())
            .collect();
        all_files.sort();
        all_files.dedup();
        if all_files.is_empty() {
            return Ok(ProfileReport::empty());
        }

        let (growth_rate, samples) = if profile_memory {
            let (num, den) = stats.allocation_velocity;
            let rate = if den > 0.0 { 100.0 * num / den } else { 0.0 };
            (rate, stats.memory_footprint_samples.samples().to_vec())
        } else {
            (0.0, Vec::new())
        };

        // Sort in descending order of CPU samples, then ascending by
        // filename, and drop files that clear neither threshold.
        let mut ordered: Vec<String> = all_files.into_iter().cloned().collect();
        ordered.sort_by(|a, b| {
            let cpu_a = stats.cpu_samples_by_file.get(a).copied().unwrap_or(0.0);
            let cpu_b = stats.cpu_samples_by_file.get(b).copied().unwrap_or(0.0);
            cpu_b
                .partial_cmp(&cpu_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        let report_files: Vec<String> = ordered
            .into_iter()
            .filter(|file| {
                let mallocs = stats
                    .malloc_samples_by_file
                    .get(file)
                    .copied()
                    .unwrap_or(0.0);
                mallocs >= self.malloc_threshold
                    || self.file_cpu_percent(stats, file) >= self.cpu_percent_threshold
            })
            .collect();
        debug!(selected = report_files.len(), "selected files for reporting");

        // Children never emit a report: write the store to disk for the
        // main process to collect.
        if let ProcessMode::Child { pid } = mode {
            stats.persist(pid, aux_dir)?;
            return Ok(ProfileReport::empty());
        }

        if report_files.is_empty() {
            return Ok(ProfileReport::empty());
        }

        let mut source = SourceCache::new();
        let mut files = FileMap::default();
        for file in &report_files {
            let percent_cpu_time = self.file_cpu_percent(stats, file);
            let line_count = source.lines(Path::new(file))?.len() as u32;

            let mut lines = Vec::new();
            for lineno in 1..=line_count {
                let record = build_line(
                    stats,
                    &mut source,
                    file,
                    lineno,
                    reportable,
                    profile_memory,
                    false,
                )?;
                if let Some(record) = record {
                    if record.has_signal() {
                        lines.push(record);
                    }
                }
            }

            files.0.push((
                self.display_name(file),
                FileReport {
                    percent_cpu_time,
                    lines,
                },
            ));
        }

        Ok(ProfileReport::Full(ReportBody {
            elapsed_time_sec: stats.elapsed_time_sec,
            growth_rate,
            samples,
            max_footprint_mb: stats.max_footprint_mb,
            files,
        }))
    }
}

/// Predicate that reports every line. Convenience for callers that do not
/// restrict profiling to a region.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportEverything;

impl IsReportable for ReportEverything {
    fn is_reportable(&self, _file: &str, _line: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_normalizes_cells() {
        let agg = ReportAggregator::new();
        assert_eq!(agg.display_name("<ipython-input-7-abcdef>"), "[7]");
        assert_eq!(agg.display_name("<ipython-input-12-9f8e7d6c>"), "[12]");
    }

    #[test]
    fn test_display_name_passes_ordinary_files() {
        let agg = ReportAggregator::new();
        assert_eq!(agg.display_name("app.py"), "app.py");
        assert_eq!(agg.display_name("<stdin>"), "<stdin>");
    }

    #[test]
    fn test_empty_report_serializes_as_empty_mapping() {
        let report = ProfileReport::empty();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn test_empty_report_round_trips() {
        let json = ProfileReport::empty().to_json().unwrap();
        let back: ProfileReport = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_file_map_preserves_order() {
        let mut files = FileMap::default();
        for name in ["z.py", "a.py", "m.py"] {
            files.0.push((
                name.to_string(),
                FileReport {
                    percent_cpu_time: 0.0,
                    lines: Vec::new(),
                },
            ));
        }
        let json = serde_json::to_string(&files).unwrap();
        let z = json.find("z.py").unwrap();
        let a = json.find("a.py").unwrap();
        let m = json.find("m.py").unwrap();
        assert!(z < a && a < m);
    }
}
