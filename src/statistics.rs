//! The per-run statistics store
//!
//! [`ProfileStats`] holds every counter the sampler and the allocation
//! interposition produce: per-(file, line) CPU/GPU/memcpy counters, memory
//! counters fanned out by allocation-site byte index, per-file aggregates
//! used for pre-filtering, and global totals. The store is populated
//! incrementally by external collaborators over the life of a profiling run;
//! this crate merges it once (parent absorbs children) and then reads it.
//!
//! Child processes never report. They serialize their store to a per-PID
//! MessagePack file under a shared auxiliary directory; the parent decodes
//! and folds every such file into its own store before aggregating.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProfileError, Result};
use crate::running_stats::{FootprintSeries, RunningStats};

/// Filename prefix for persisted per-process stores
const STORE_FILE_PREFIX: &str = "lineprof";

/// Counter keyed by (file, line)
pub type PerLine<T> = HashMap<String, HashMap<u32, T>>;

/// Counter keyed by (file, line, allocation-site byte index)
pub type PerByteIndex<T> = HashMap<String, HashMap<u32, HashMap<u32, T>>>;

/// All counters collected during one profiling run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileStats {
    /// Total time spent in the profiled program (seconds)
    pub elapsed_time_sec: f64,

    /// CPU samples spent in the interpreter, per location
    pub cpu_samples_python: PerLine<f64>,

    /// CPU samples spent in native code / libraries / system calls, per
    /// location. May be transiently negative: it is computed by subtraction
    /// and floating-point noise can undershoot zero.
    pub cpu_samples_c: PerLine<f64>,

    /// GPU samples per location
    pub gpu_samples: PerLine<f64>,

    /// Observed CPU-utilization ratios per location
    pub cpu_utilization: PerLine<RunningStats>,

    /// Running CPU sample count per file, used to prune reporting
    pub cpu_samples_by_file: HashMap<String, f64>,

    /// Running malloc sample count per file, used to prune reporting
    pub malloc_samples_by_file: HashMap<String, f64>,

    /// Allocated MB per allocation site
    pub memory_malloc_samples: PerByteIndex<f64>,

    /// Number of times malloc samples were recorded per allocation site
    pub memory_malloc_count: PerByteIndex<u64>,

    /// Allocated MB attributable to the interpreter, per allocation site
    pub memory_python_samples: PerByteIndex<f64>,

    /// Freed MB per allocation site
    pub memory_free_samples: PerByteIndex<f64>,

    /// Number of times free samples were recorded per allocation site
    pub memory_free_count: PerByteIndex<u64>,

    /// memcpy volume per location (bytes)
    pub memcpy_samples: PerLine<f64>,

    /// Allocation-site byte indices observed per location. This is the
    /// complete key set for the byte-index-keyed maps above; summation
    /// visits every index exactly once.
    pub byte_index_map: PerLine<BTreeSet<u32>>,

    /// Memory footprint time series per location
    pub per_line_footprint_samples: PerLine<FootprintSeries>,

    /// Global memory footprint time series
    pub memory_footprint_samples: FootprintSeries,

    /// How many CPU samples have been collected in total
    pub total_cpu_samples: f64,

    /// How many GPU samples have been collected in total
    pub total_gpu_samples: f64,

    /// Total malloc sample volume (MB)
    pub total_memory_malloc_samples: f64,

    /// Total free sample volume (MB)
    pub total_memory_free_samples: f64,

    /// Peak memory footprint (MB)
    pub max_footprint_mb: f64,

    /// (numerator, denominator) pair the allocation sampler maintains to
    /// derive a normalized memory growth rate
    pub allocation_velocity: (f64, f64),
}

impl ProfileStats {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no CPU, malloc, or free samples were collected at all
    pub fn is_empty(&self) -> bool {
        self.total_cpu_samples == 0.0
            && self.total_memory_malloc_samples == 0.0
            && self.total_memory_free_samples == 0.0
    }

    /// Reset counters at a collection boundary. The footprint peak is
    /// retained; it describes the process, not the collection window.
    pub fn clear(&mut self) {
        let max_footprint_mb = self.max_footprint_mb;
        *self = Self::default();
        self.max_footprint_mb = max_footprint_mb;
    }

    /// Path a store persisted by `pid` would be written to
    fn store_path(aux_dir: &Path, pid: u32) -> PathBuf {
        aux_dir.join(format!(
            "{}-{}-{}",
            STORE_FILE_PREFIX,
            pid,
            std::process::id()
        ))
    }

    /// Serialize this store for the parent process to collect.
    ///
    /// Child-process path: written once after the child has quiesced.
    /// Returns the file the store was written to.
    pub fn persist(&self, pid: u32, aux_dir: &Path) -> Result<PathBuf> {
        let path = Self::store_path(aux_dir, pid);
        let payload = rmp_serde::to_vec(self)?;
        fs::write(&path, payload).map_err(|source| ProfileError::Persist {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "persisted child statistics store");
        Ok(path)
    }

    /// Absorb every child store found under `aux_dir`.
    ///
    /// Consumed files are removed. Empty files are skipped (a child that was
    /// killed mid-write leaves one behind). Returns the number of stores
    /// merged.
    pub fn merge_from_dir(&mut self, aux_dir: &Path) -> Result<usize> {
        if !aux_dir.exists() {
            // No children ever wrote a store.
            return Ok(0);
        }
        let entries = fs::read_dir(aux_dir).map_err(|source| ProfileError::AuxDir {
            path: aux_dir.to_path_buf(),
            source,
        })?;

        let mut merged = 0;
        for entry in entries {
            let entry = entry.map_err(|source| ProfileError::AuxDir {
                path: aux_dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_store = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(STORE_FILE_PREFIX));
            if !is_store {
                continue;
            }
            let payload = fs::read(&path).map_err(|source| ProfileError::AuxDir {
                path: path.clone(),
                source,
            })?;
            if payload.is_empty() {
                continue;
            }
            let child: ProfileStats =
                rmp_serde::from_slice(&payload).map_err(|source| ProfileError::Decode {
                    path: path.clone(),
                    source,
                })?;
            self.merge(&child);
            merged += 1;
            let _ = fs::remove_file(&path);
        }
        debug!(merged, aux_dir = %aux_dir.display(), "merged child statistics stores");
        Ok(merged)
    }

    /// Fold another store into this one
    pub fn merge(&mut self, other: &ProfileStats) {
        self.elapsed_time_sec = self.elapsed_time_sec.max(other.elapsed_time_sec);
        self.max_footprint_mb = self.max_footprint_mb.max(other.max_footprint_mb);

        self.total_cpu_samples += other.total_cpu_samples;
        self.total_gpu_samples += other.total_gpu_samples;
        self.total_memory_malloc_samples += other.total_memory_malloc_samples;
        self.total_memory_free_samples += other.total_memory_free_samples;

        add_per_line(&mut self.cpu_samples_python, &other.cpu_samples_python);
        add_per_line(&mut self.cpu_samples_c, &other.cpu_samples_c);
        add_per_line(&mut self.gpu_samples, &other.gpu_samples);
        add_per_line(&mut self.memcpy_samples, &other.memcpy_samples);

        for (file, lines) in &other.cpu_utilization {
            let dest = self.cpu_utilization.entry(file.clone()).or_default();
            for (line, stats) in lines {
                dest.entry(*line).or_default().merge(stats);
            }
        }

        for (file, lines) in &other.per_line_footprint_samples {
            let dest = self
                .per_line_footprint_samples
                .entry(file.clone())
                .or_default();
            for (line, series) in lines {
                dest.entry(*line).or_default().merge(series);
            }
        }

        add_per_byte_index(&mut self.memory_malloc_samples, &other.memory_malloc_samples);
        add_per_byte_index(&mut self.memory_python_samples, &other.memory_python_samples);
        add_per_byte_index(&mut self.memory_free_samples, &other.memory_free_samples);
        add_counts(&mut self.memory_malloc_count, &other.memory_malloc_count);
        add_counts(&mut self.memory_free_count, &other.memory_free_count);

        for (file, lines) in &other.byte_index_map {
            let dest = self.byte_index_map.entry(file.clone()).or_default();
            for (line, indices) in lines {
                dest.entry(*line).or_default().extend(indices.iter().copied());
            }
        }

        for (file, count) in &other.cpu_samples_by_file {
            *self.cpu_samples_by_file.entry(file.clone()).or_default() += count;
        }
        for (file, count) in &other.malloc_samples_by_file {
            *self.malloc_samples_by_file.entry(file.clone()).or_default() += count;
        }

        self.memory_footprint_samples
            .merge(&other.memory_footprint_samples);
    }
}

fn add_per_line(dest: &mut PerLine<f64>, src: &PerLine<f64>) {
    for (file, lines) in src {
        let dest_lines = dest.entry(file.clone()).or_default();
        for (line, value) in lines {
            *dest_lines.entry(*line).or_default() += value;
        }
    }
}

fn add_per_byte_index(dest: &mut PerByteIndex<f64>, src: &PerByteIndex<f64>) {
    for (file, lines) in src {
        let dest_lines = dest.entry(file.clone()).or_default();
        for (line, indices) in lines {
            let dest_indices = dest_lines.entry(*line).or_default();
            for (index, value) in indices {
                *dest_indices.entry(*index).or_default() += value;
            }
        }
    }
}

fn add_counts(dest: &mut PerByteIndex<u64>, src: &PerByteIndex<u64>) {
    for (file, lines) in src {
        let dest_lines = dest.entry(file.clone()).or_default();
        for (line, indices) in lines {
            let dest_indices = dest_lines.entry(*line).or_default();
            for (index, value) in indices {
                *dest_indices.entry(*index).or_default() += value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_line(file: &str, line: u32, python: f64, native: f64) -> ProfileStats {
        let mut stats = ProfileStats::new();
        stats
            .cpu_samples_python
            .entry(file.to_string())
            .or_default()
            .insert(line, python);
        stats
            .cpu_samples_c
            .entry(file.to_string())
            .or_default()
            .insert(line, native);
        stats.total_cpu_samples = python + native;
        stats
            .cpu_samples_by_file
            .insert(file.to_string(), python + native);
        stats
    }

    #[test]
    fn test_empty_store_is_empty() {
        assert!(ProfileStats::new().is_empty());
    }

    #[test]
    fn test_store_with_free_samples_is_not_empty() {
        let mut stats = ProfileStats::new();
        stats.total_memory_free_samples = 2.0;
        assert!(!stats.is_empty());
    }

    #[test]
    fn test_merge_adds_per_line_counters() {
        let mut parent = store_with_line("app.py", 10, 4.0, 1.0);
        let child = store_with_line("app.py", 10, 6.0, 2.0);
        parent.merge(&child);

        assert_eq!(parent.cpu_samples_python["app.py"][&10], 10.0);
        assert_eq!(parent.cpu_samples_c["app.py"][&10], 3.0);
        assert_eq!(parent.total_cpu_samples, 13.0);
        assert_eq!(parent.cpu_samples_by_file["app.py"], 13.0);
    }

    #[test]
    fn test_merge_takes_max_of_elapsed_and_footprint() {
        let mut parent = ProfileStats::new();
        parent.elapsed_time_sec = 5.0;
        parent.max_footprint_mb = 100.0;
        let mut child = ProfileStats::new();
        child.elapsed_time_sec = 8.0;
        child.max_footprint_mb = 60.0;
        parent.merge(&child);
        assert_eq!(parent.elapsed_time_sec, 8.0);
        assert_eq!(parent.max_footprint_mb, 100.0);
    }

    #[test]
    fn test_merge_unions_byte_indices() {
        let mut parent = ProfileStats::new();
        parent
            .byte_index_map
            .entry("app.py".to_string())
            .or_default()
            .insert(3, BTreeSet::from([2, 4]));
        let mut child = ProfileStats::new();
        child
            .byte_index_map
            .entry("app.py".to_string())
            .or_default()
            .insert(3, BTreeSet::from([4, 8]));
        parent.merge(&child);
        assert_eq!(parent.byte_index_map["app.py"][&3], BTreeSet::from([2, 4, 8]));
    }

    #[test]
    fn test_merge_folds_utilization() {
        let mut parent = ProfileStats::new();
        let mut child = ProfileStats::new();
        let mut util = RunningStats::new();
        util.push(0.5);
        child
            .cpu_utilization
            .entry("app.py".to_string())
            .or_default()
            .insert(1, util);
        parent.merge(&child);
        assert_eq!(parent.cpu_utilization["app.py"][&1].mean(), 0.5);
    }

    #[test]
    fn test_persist_then_merge_round_trip() {
        let aux = TempDir::new().unwrap();
        let child = store_with_line("worker.py", 7, 3.0, 1.0);
        child.persist(42, aux.path()).unwrap();

        let mut parent = store_with_line("main.py", 1, 2.0, 0.0);
        let merged = parent.merge_from_dir(aux.path()).unwrap();
        assert_eq!(merged, 1);
        assert_eq!(parent.total_cpu_samples, 6.0);
        assert_eq!(parent.cpu_samples_python["worker.py"][&7], 3.0);

        // Consumed stores are removed; a second merge finds nothing.
        assert_eq!(parent.merge_from_dir(aux.path()).unwrap(), 0);
    }

    #[test]
    fn test_merge_skips_empty_store_files() {
        let aux = TempDir::new().unwrap();
        fs::write(aux.path().join("lineprof-9-9"), b"").unwrap();
        let mut parent = ProfileStats::new();
        assert_eq!(parent.merge_from_dir(aux.path()).unwrap(), 0);
    }

    #[test]
    fn test_merge_ignores_unrelated_files() {
        let aux = TempDir::new().unwrap();
        fs::write(aux.path().join("notes.txt"), b"not a store").unwrap();
        let mut parent = ProfileStats::new();
        assert_eq!(parent.merge_from_dir(aux.path()).unwrap(), 0);
        // Unrelated files are left alone.
        assert!(aux.path().join("notes.txt").exists());
    }

    #[test]
    fn test_clear_retains_footprint_peak() {
        let mut stats = store_with_line("app.py", 1, 1.0, 0.0);
        stats.max_footprint_mb = 250.0;
        stats.clear();
        assert!(stats.is_empty());
        assert_eq!(stats.max_footprint_mb, 250.0);
        assert!(stats.cpu_samples_python.is_empty());
    }
}
