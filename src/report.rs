//! Per-shard results and the aggregated run report

use crate::error::{Error, Result};
use crate::placement::ResourceId;
use crate::shard::ShardId;
use std::fmt;
use std::time::{Duration, Instant};

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// How the run time is derived from per-shard timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum TimingMode {
    /// Slowest shard's own `end - start`
    #[default]
    PerShard,
    /// Latest end minus earliest start over all shards
    WallClock,
}

/// What one shard sends back at the end of its run
#[derive(Debug, Clone)]
pub struct ShardReport {
    /// Shard index
    pub shard: ShardId,
    /// Resource the shard ran on
    pub resource: ResourceId,
    /// Earliest start of any first-iteration interior block
    pub start: Instant,
    /// Time after the drain round
    pub end: Instant,
    /// Accumulated validation error, `None` when checking was skipped
    pub error: Option<f64>,
}

impl ShardReport {
    /// `end - start`
    pub fn elapsed(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Aggregated result of a whole epoch
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct RunReport {
    /// Number of shards that reported
    pub shards: usize,
    /// Iterations each shard ran
    pub iterations: usize,
    /// Floating-point operations per iteration
    pub flops: f64,
    /// Run time in seconds
    pub max_time: f64,
    /// `max_time / iterations`
    pub avg_time: f64,
    /// Sum of all shard errors, `None` in timing-only mode
    pub total_error: Option<f64>,
}

impl RunReport {
    /// Aggregate shard reports
    ///
    /// Errors are only summed if every shard checked its tile.
    pub fn from_shards(
        reports: &[ShardReport],
        iterations: usize,
        flops: f64,
        timing: TimingMode,
    ) -> Self {
        let max_time = match timing {
            TimingMode::PerShard => reports
                .iter()
                .map(|r| r.elapsed().as_secs_f64())
                .fold(0.0, f64::max),
            TimingMode::WallClock => {
                let start = reports.iter().map(|r| r.start).min();
                let end = reports.iter().map(|r| r.end).max();
                match (start, end) {
                    (Some(start), Some(end)) => end.saturating_duration_since(start).as_secs_f64(),
                    _ => 0.0,
                }
            }
        };
        let total_error = reports
            .iter()
            .map(|r| r.error)
            .sum::<Option<f64>>()
            .filter(|_| !reports.is_empty());

        Self {
            shards: reports.len(),
            iterations,
            flops,
            max_time,
            avg_time: max_time / iterations.max(1) as f64,
            total_error,
        }
    }

    /// Throughput in MFlop/s
    pub fn rate(&self) -> f64 {
        if self.avg_time > 0.0 {
            1.0e-6 * self.flops / self.avg_time
        } else {
            0.0
        }
    }

    /// Whether validation ran and stayed under `threshold`
    pub fn is_valid(&self, threshold: f64) -> bool {
        self.total_error.is_some_and(|e| e < threshold)
    }

    /// Fail if validation ran and reached `threshold`
    ///
    /// A run that skipped validation passes.
    pub fn verdict(&self, threshold: f64) -> Result<()> {
        match self.total_error {
            Some(error) if error.is_nan() || error >= threshold => {
                Err(Error::ValidationFailed { error, threshold })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rate (MFlops/s): {:.6}  Avg time (s): {:.6}",
            self.rate(),
            self.avg_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(shard: usize, start_ms: u64, end_ms: u64, error: Option<f64>) -> ShardReport {
        let origin = Instant::now();
        ShardReport {
            shard,
            resource: ResourceId(shard),
            start: origin + Duration::from_millis(start_ms),
            end: origin + Duration::from_millis(end_ms),
            error,
        }
    }

    #[test]
    fn test_per_shard_timing() {
        let reports = [report(0, 0, 400, Some(0.0)), report(1, 100, 300, Some(0.0))];
        let run = RunReport::from_shards(&reports, 4, 1.0e6, TimingMode::PerShard);
        assert!((run.max_time - 0.4).abs() < 1e-9);
        assert!((run.avg_time - 0.1).abs() < 1e-9);
        assert!((run.rate() - 10.0).abs() < 1e-6);
        assert_eq!(run.total_error, Some(0.0));
        run.verdict(1e-8).unwrap();
    }

    #[test]
    fn test_wall_clock_timing_spans_all_shards() {
        let origin = Instant::now();
        let reports = [
            ShardReport {
                shard: 0,
                resource: ResourceId(0),
                start: origin,
                end: origin + Duration::from_millis(100),
                error: None,
            },
            ShardReport {
                shard: 1,
                resource: ResourceId(1),
                start: origin + Duration::from_millis(50),
                end: origin + Duration::from_millis(250),
                error: None,
            },
        ];
        let run = RunReport::from_shards(&reports, 1, 1.0, TimingMode::WallClock);
        assert!((run.max_time - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_error_sum_and_verdict() {
        let reports = [report(0, 0, 1, Some(0.25)), report(1, 0, 1, Some(0.5))];
        let run = RunReport::from_shards(&reports, 1, 1.0, TimingMode::PerShard);
        assert_eq!(run.total_error, Some(0.75));
        assert!(!run.is_valid(1e-8));
        match run.verdict(1e-8) {
            Err(Error::ValidationFailed { error, .. }) => assert_eq!(error, 0.75),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_skipped_validation_passes() {
        let reports = [report(0, 0, 1, None), report(1, 0, 1, Some(0.0))];
        let run = RunReport::from_shards(&reports, 1, 1.0, TimingMode::PerShard);
        assert_eq!(run.total_error, None);
        assert!(!run.is_valid(1e-8));
        run.verdict(1e-8).unwrap();
    }

    #[test]
    fn test_nan_error_fails() {
        let reports = [report(0, 0, 1, Some(f64::NAN))];
        let run = RunReport::from_shards(&reports, 1, 1.0, TimingMode::PerShard);
        assert!(run.verdict(1e-8).is_err());
    }

    #[test]
    fn test_display_line() {
        let reports = [report(0, 0, 1000, Some(0.0))];
        let run = RunReport::from_shards(&reports, 1, 2.0e6, TimingMode::PerShard);
        assert_eq!(run.to_string(), "Rate (MFlops/s): 2.000000  Avg time (s): 1.000000");
    }
}
