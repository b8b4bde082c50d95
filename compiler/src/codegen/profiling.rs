//! # Runtime Profiling Infrastructure
//!
//! Provides the counters that decide when to trace and when to bridge.
//! Loop headers are counted by the interpreter; once a header crosses the
//! trace threshold a trace is recorded there. Guard failures are counted per
//! guard by the compilation manager.
//!
//! ## Design
//! - Lock-free atomic counters for minimal runtime overhead
//! - Configurable thresholds for warm/hot detection
//! - Per-loop-header execution tracking keyed by code position
//! - `guard_value` guards count the values they fail with in a small table

use crate::history::DEFAULT_TRACE_LIMIT;
use crate::ir::RuntimeValue;
use crate::resume::CodePosition;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime profiling data collector
#[derive(Clone)]
pub struct ProfileData {
    /// Per-loop-header iteration counters (lock-free atomic)
    loop_counts: Arc<RwLock<FxHashMap<CodePosition, Arc<AtomicU64>>>>,

    /// Configuration for hotness detection
    config: ProfileConfig,
}

/// Configuration for profiling and hotness detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Iterations before a loop header counts as warm
    pub warm_threshold: u64,

    /// Iterations of a loop header before it is traced
    pub trace_threshold: u64,

    /// Failures of one guard before a bridge is compiled for it
    pub bridge_threshold: u64,

    /// Maximum number of recorded operations per trace
    pub trace_limit: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            warm_threshold: 200,
            trace_threshold: 1039,
            bridge_threshold: 200,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }
}

impl ProfileConfig {
    /// Development configuration (low thresholds, everything compiles quickly)
    pub fn development() -> Self {
        Self {
            warm_threshold: 2,
            trace_threshold: 5,
            bridge_threshold: 2,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }

    /// Production configuration (conservative, only truly hot loops are traced)
    pub fn production() -> Self {
        Self {
            warm_threshold: 1000,
            trace_threshold: 5000,
            bridge_threshold: 500,
            trace_limit: DEFAULT_TRACE_LIMIT * 2,
        }
    }
}

impl ProfileData {
    /// Create a new profiling data collector
    pub fn new(config: ProfileConfig) -> Self {
        Self {
            loop_counts: Arc::new(RwLock::new(FxHashMap::default())),
            config,
        }
    }

    /// Record one pass over a loop header; returns the new count
    pub fn record_iteration(&self, header: CodePosition) -> u64 {
        if let Some(counter) = self.loop_counts.read().get(&header) {
            return counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.get_or_create_loop_counter(header)
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Get iteration count for a loop header
    pub fn get_loop_count(&self, header: CodePosition) -> u64 {
        self.loop_counts
            .read()
            .get(&header)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Check if a loop header is hot enough to be traced
    pub fn should_trace(&self, header: CodePosition) -> bool {
        self.get_loop_count(header) >= self.config.trace_threshold
    }

    /// Get the hotness level of a loop header
    pub fn get_hotness(&self, header: CodePosition) -> HotnessLevel {
        let count = self.get_loop_count(header);

        if count >= self.config.trace_threshold {
            HotnessLevel::Hot
        } else if count >= self.config.warm_threshold {
            HotnessLevel::Warm
        } else {
            HotnessLevel::Cold
        }
    }

    /// Get all hot loop headers (sorted by iteration count, descending)
    pub fn get_hot_loops(&self) -> Vec<(CodePosition, u64)> {
        let counts = self.loop_counts.read();
        let mut hot: Vec<_> = counts
            .iter()
            .map(|(header, counter)| (*header, counter.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count >= self.config.trace_threshold)
            .collect();

        hot.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hot
    }

    /// Start counting a loop header from zero again (tracing it was abandoned)
    pub fn reset_loop(&self, header: CodePosition) {
        if let Some(counter) = self.loop_counts.read().get(&header) {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Reset all profiling counters (useful for testing)
    pub fn reset(&self) {
        self.loop_counts.write().clear();
    }

    /// Get a loop header's counter reference for direct instrumentation
    pub fn get_or_create_loop_counter(&self, header: CodePosition) -> Arc<AtomicU64> {
        self.loop_counts
            .write()
            .entry(header)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Get profiling statistics summary
    pub fn get_statistics(&self) -> ProfileStatistics {
        let counts = self.loop_counts.read();

        let total_loops = counts.len();
        let hot_loops = counts
            .values()
            .filter(|c| c.load(Ordering::Relaxed) >= self.config.trace_threshold)
            .count();
        let warm_loops = counts
            .values()
            .filter(|c| {
                let count = c.load(Ordering::Relaxed);
                count >= self.config.warm_threshold && count < self.config.trace_threshold
            })
            .count();

        ProfileStatistics {
            total_loops,
            hot_loops,
            warm_loops,
            cold_loops: total_loops - hot_loops - warm_loops,
            total_iterations: counts.values().map(|c| c.load(Ordering::Relaxed)).sum(),
        }
    }

    /// Get the profiling configuration
    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }
}

/// Hotness level classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HotnessLevel {
    Cold, // Below warm threshold
    Warm, // Counting towards the trace threshold
    Hot,  // Traced (or about to be)
}

/// Profiling statistics summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileStatistics {
    pub total_loops: usize,
    pub hot_loops: usize,
    pub warm_loops: usize,
    pub cold_loops: usize,
    pub total_iterations: u64,
}

impl ProfileStatistics {
    /// Format as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Profile: {} loops ({} hot, {} warm, {} cold), {} total iterations",
            self.total_loops,
            self.hot_loops,
            self.warm_loops,
            self.cold_loops,
            self.total_iterations
        )
    }
}

/// Failure counts of a `guard_value` guard, one per failing value.
///
/// The table has room for [`GuardValueCounters::CAPACITY`] values. A new
/// value arriving at a full table replaces the entry with the lowest count;
/// among equal counts the entry inserted first goes.
#[derive(Debug, Clone, Default)]
pub struct GuardValueCounters {
    /// In insertion order
    entries: SmallVec<[(RuntimeValue, u64); 5]>,
}

impl GuardValueCounters {
    pub const CAPACITY: usize = 5;

    pub fn new() -> Self {
        Self::default()
    }

    /// Count one failure with `value`; returns the value's count
    pub fn record(&mut self, value: RuntimeValue) -> u64 {
        if let Some(entry) = self.entries.iter_mut().find(|(v, _)| v.same_as(&value)) {
            entry.1 += 1;
            return entry.1;
        }
        if self.entries.len() == Self::CAPACITY {
            let mut victim = 0;
            for (i, (_, count)) in self.entries.iter().enumerate() {
                if *count < self.entries[victim].1 {
                    victim = i;
                }
            }
            self.entries.remove(victim);
        }
        self.entries.push((value, 1));
        1
    }

    pub fn count(&self, value: &RuntimeValue) -> u64 {
        self.entries
            .iter()
            .find(|(v, _)| v.same_as(value))
            .map_or(0, |(_, c)| *c)
    }

    /// Entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = (RuntimeValue, u64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pc: u32) -> CodePosition {
        CodePosition::new(1, pc)
    }

    #[test]
    fn test_profile_data_basic() {
        let profile = ProfileData::new(ProfileConfig {
            warm_threshold: 3,
            trace_threshold: 10,
            ..ProfileConfig::default()
        });

        let loop_header = header(42);

        // Initially cold (0 iterations)
        assert_eq!(profile.get_hotness(loop_header), HotnessLevel::Cold);
        assert_eq!(profile.get_loop_count(loop_header), 0);

        // Execute 3 times -> warm
        for _ in 0..3 {
            profile.record_iteration(loop_header);
        }
        assert_eq!(profile.get_hotness(loop_header), HotnessLevel::Warm);
        assert!(!profile.should_trace(loop_header));

        // 7 more (10 total) -> hot, ready to trace
        let mut last = 0;
        for _ in 0..7 {
            last = profile.record_iteration(loop_header);
        }
        assert_eq!(last, 10);
        assert_eq!(profile.get_hotness(loop_header), HotnessLevel::Hot);
        assert!(profile.should_trace(loop_header));

        profile.reset_loop(loop_header);
        assert_eq!(profile.get_loop_count(loop_header), 0);
    }

    #[test]
    fn test_hot_loops_and_statistics() {
        let profile = ProfileData::new(ProfileConfig {
            warm_threshold: 5,
            trace_threshold: 10,
            ..ProfileConfig::default()
        });

        for _ in 0..3 {
            profile.record_iteration(header(1));
        }
        for _ in 0..7 {
            profile.record_iteration(header(2));
        }
        for _ in 0..15 {
            profile.record_iteration(header(3));
        }

        assert_eq!(profile.get_hot_loops(), vec![(header(3), 15)]);

        let stats = profile.get_statistics();
        assert_eq!(stats.total_loops, 3);
        assert_eq!(stats.hot_loops, 1);
        assert_eq!(stats.warm_loops, 1);
        assert_eq!(stats.cold_loops, 1);
        assert_eq!(stats.total_iterations, 25);
    }

    #[test]
    fn test_atomic_counter_instrumentation() {
        let profile = ProfileData::new(ProfileConfig::default());
        let counter = profile.get_or_create_loop_counter(header(99));

        for _ in 0..100 {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        assert_eq!(profile.get_loop_count(header(99)), 100);
    }

    #[test]
    fn test_guard_value_counters_evict_minimum_earliest_first() {
        let mut counters = GuardValueCounters::new();
        for v in 100..105 {
            counters.record(RuntimeValue::Int(v));
        }
        assert_eq!(counters.len(), GuardValueCounters::CAPACITY);

        // all counts tie at 1: the earliest inserted value goes
        counters.record(RuntimeValue::Int(105));
        assert_eq!(counters.count(&RuntimeValue::Int(100)), 0);
        assert_eq!(counters.count(&RuntimeValue::Int(105)), 1);

        // 101 is now the earliest of the minimum; bump it so 102 goes next
        assert_eq!(counters.record(RuntimeValue::Int(101)), 2);
        counters.record(RuntimeValue::Int(106));
        assert_eq!(counters.count(&RuntimeValue::Int(102)), 0);
        assert_eq!(counters.count(&RuntimeValue::Int(101)), 2);

        let values: Vec<i64> = counters.entries().filter_map(|(v, _)| v.as_int()).collect();
        assert_eq!(values, vec![101, 103, 104, 105, 106]);
    }
}
