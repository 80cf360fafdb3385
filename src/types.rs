// ========================================================================================
//
//                        CORE DATA TYPES FOR THE XMLTALLY ENGINE
//
// ========================================================================================
//
// This module is the canonical dictionary for the data structures shared across the
// architectural boundaries of the crate (`reader`, `pipeline`, `count`, `main`).
// Centralizing them keeps the dependency graph one-way: the processing modules depend
// on these types, never on each other's internals.

use std::error::Error;
use std::fmt;
use std::io;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ========================================================================================
//                                RESULTS AND ACCUMULATORS
// ========================================================================================

/// The fixed-shape count tuple produced by successfully processing one fragment.
///
/// The three categories are the entity kinds of a graph-fragment record: standalone
/// nodes, control relations, and pathway containers. The aggregation machinery only
/// relies on `AddAssign`, so the totals are independent of completion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub nodes: u64,
    pub controls: u64,
    pub pathways: u64,
}

impl RecordCounts {
    pub const fn new(nodes: u64, controls: u64, pathways: u64) -> Self {
        Self {
            nodes,
            controls,
            pathways,
        }
    }
}

impl AddAssign for RecordCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.nodes += rhs.nodes;
        self.controls += rhs.controls;
        self.pathways += rhs.pathways;
    }
}

impl Add for RecordCounts {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl fmt::Display for RecordCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} controls, {} pathways",
            self.nodes, self.controls, self.pathways
        )
    }
}

/// The running aggregate over all harvested tasks.
///
/// This is deliberately a plain struct with no interior mutability: the dispatcher's
/// harvest step is the only writer, so merges are serialized by construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningTotals {
    pub counts: RecordCounts,
    pub succeeded: u64,
    pub failed: u64,
}

impl RunningTotals {
    /// Merges the counts of one completed task.
    pub fn record_success(&mut self, counts: RecordCounts) {
        self.counts += counts;
        self.succeeded += 1;
    }

    /// Records one failed task. Failed tasks contribute nothing to `counts`.
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }
}

/// A point-in-time progress report, emitted every `progress_cadence` fragments read.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub fragments_read: u64,
    pub elapsed: Duration,
    pub totals: RunningTotals,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read {} fragments in {:.2?}; processed {}",
            self.fragments_read, self.elapsed, self.totals.counts
        )
    }
}

/// The final report of one pipeline run.
///
/// At run end `fragments_read == succeeded + failed` always holds: every fragment
/// that was read became exactly one task, and every task reached a terminal state.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub fragments_read: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub counts: RecordCounts,
    pub elapsed: Duration,
}

// ========================================================================================
//                                     CONFIGURATION
// ========================================================================================

/// The full tuning surface of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Element name that delimits one record in the input document.
    pub tag_name: String,
    /// Number of worker threads. Defaults to the machine's logical CPU count.
    pub pool_size: usize,
    /// In-flight window as a multiple of `pool_size`. Two gives workers enough
    /// slack to never starve while keeping pending fragment strings from piling
    /// up when the reader outpaces the pool.
    pub window_multiplier: usize,
    /// Fragments read between progress log lines.
    pub progress_cadence: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tag_name: "resnet".to_string(),
            pool_size: num_cpus::get().max(1),
            window_multiplier: 2,
            progress_cadence: 5000,
        }
    }
}

impl PipelineConfig {
    /// The hard cap on concurrently outstanding tasks.
    pub fn window(&self) -> usize {
        (self.pool_size * self.window_multiplier).max(1)
    }
}

// ========================================================================================
//                                  PROCESSOR CONTRACT
// ========================================================================================

/// The contract a record-processing collaborator must satisfy.
///
/// Implementations are invoked concurrently with distinct fragments from multiple
/// worker threads; the pipeline treats them as opaque and only observes eventual
/// completion or failure. Blanket-implemented for closures and `fn` items so callers
/// can pass plain functions.
pub trait FragmentProcessor: Sync {
    fn process(
        &self,
        fragment: &str,
        config: &PipelineConfig,
    ) -> Result<RecordCounts, ProcessingError>;
}

impl<F> FragmentProcessor for F
where
    F: Fn(&str, &PipelineConfig) -> Result<RecordCounts, ProcessingError> + Sync,
{
    fn process(
        &self,
        fragment: &str,
        config: &PipelineConfig,
    ) -> Result<RecordCounts, ProcessingError> {
        self(fragment, config)
    }
}

// ========================================================================================
//                                      ERROR TYPES
// ========================================================================================

/// The error a `FragmentProcessor` returns for an unprocessable fragment.
///
/// Caught per task by the dispatcher: logged, counted, and never propagated past it.
#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct ProcessingError {
    /// Human-readable description of what was being processed.
    pub context: String,
    #[source]
    pub source: Box<dyn Error + Send + Sync>,
}

impl ProcessingError {
    pub fn new(
        context: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// Fatal setup errors. These abort before any task is submitted and propagate to
/// the caller, unlike per-task processing failures which are absorbed by the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open input file '{path}'")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_sum_componentwise() {
        let mut acc = RecordCounts::default();
        acc += RecordCounts::new(1, 2, 3);
        acc += RecordCounts::new(10, 0, 1);
        assert_eq!(acc, RecordCounts::new(11, 2, 4));
        assert_eq!(
            RecordCounts::new(1, 1, 1) + RecordCounts::new(2, 2, 2),
            RecordCounts::new(3, 3, 3)
        );
    }

    #[test]
    fn totals_track_successes_and_failures_separately() {
        let mut totals = RunningTotals::default();
        totals.record_success(RecordCounts::new(5, 1, 0));
        totals.record_failure();
        totals.record_success(RecordCounts::new(1, 1, 1));
        assert_eq!(totals.succeeded, 2);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.counts, RecordCounts::new(6, 2, 1));
    }

    #[test]
    fn window_is_pool_times_multiplier_with_floor_of_one() {
        let mut config = PipelineConfig {
            pool_size: 4,
            window_multiplier: 2,
            ..PipelineConfig::default()
        };
        assert_eq!(config.window(), 8);
        config.window_multiplier = 0;
        assert_eq!(config.window(), 1);
    }
}
