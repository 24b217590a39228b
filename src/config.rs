//! Run configuration
//!
//! Counts are kept signed so that nonsensical command-line values reach
//! [`StencilConfig::validate`] and are reported as configuration errors
//! instead of failing to parse.

use crate::error::{Error, Result};
use crate::geometry::Coord;
use crate::partition::GridSpec;
use crate::report::TimingMode;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Default stencil radius
pub const DEFAULT_RADIUS: Coord = 2;

/// Stencil run configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct StencilConfig {
    /// Work-blocks per shard
    pub threads: i64,

    /// Iterations to run
    pub iterations: i64,

    /// Grid extent `n`
    pub dimension: Coord,

    /// Stencil radius `R`
    pub radius: Coord,

    /// Nodes (address spaces) the shards are spread over
    pub nodes: i64,

    /// Shards per node
    pub numa_nodes: i64,

    /// Pin shard and work-block threads to cores
    pub pin_threads: bool,

    /// Skip the validation pass
    pub timing_only: bool,

    /// How the reported time is measured
    pub timing: TimingMode,
}

impl Default for StencilConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            iterations: 1,
            dimension: 0,
            radius: DEFAULT_RADIUS,
            nodes: 1,
            numa_nodes: 1,
            pin_threads: false,
            timing_only: false,
            timing: TimingMode::PerShard,
        }
    }
}

impl StencilConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the work-blocks per shard
    pub fn with_threads(mut self, threads: i64) -> Self {
        self.threads = threads;
        self
    }

    /// Set the iteration count
    pub fn with_iterations(mut self, iterations: i64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the grid extent
    pub fn with_dimension(mut self, dimension: Coord) -> Self {
        self.dimension = dimension;
        self
    }

    /// Set the stencil radius
    pub fn with_radius(mut self, radius: Coord) -> Self {
        self.radius = radius;
        self
    }

    /// Set the node count
    pub fn with_nodes(mut self, nodes: i64) -> Self {
        self.nodes = nodes;
        self
    }

    /// Set the shards per node
    pub fn with_numa_nodes(mut self, numa_nodes: i64) -> Self {
        self.numa_nodes = numa_nodes;
        self
    }

    /// Enable core pinning
    pub fn with_pinning(mut self, pin: bool) -> Self {
        self.pin_threads = pin;
        self
    }

    /// Skip validation
    pub fn with_timing_only(mut self, timing_only: bool) -> Self {
        self.timing_only = timing_only;
        self
    }

    /// Set the timing mode
    pub fn with_timing(mut self, timing: TimingMode) -> Self {
        self.timing = timing;
        self
    }

    /// Total shard count, `nodes × numa_nodes`
    pub fn ranks(&self) -> i64 {
        self.nodes.saturating_mul(self.numa_nodes)
    }

    /// Check every parameter and derive the grid decomposition
    pub fn validate(&self) -> Result<GridSpec> {
        self.check_counts()?;
        GridSpec::for_ranks(self.dimension, self.radius, self.ranks())
    }

    /// Check the counts that do not depend on the tile grid
    ///
    /// These are the checks that run before the configuration is echoed;
    /// divisibility and radius checks follow in [`StencilConfig::validate`].
    pub fn check_counts(&self) -> Result<()> {
        if self.threads <= 0 {
            return Err(Error::InvalidConfig(format!(
                "Number of THREADS must be > 0 : {}",
                self.threads
            )));
        }
        if self.iterations < 1 {
            return Err(Error::InvalidConfig(format!(
                "iterations must be >= 1 : {}",
                self.iterations
            )));
        }
        if self.dimension <= 0 {
            return Err(Error::InvalidConfig(format!(
                "Matrix Order must be greater than 0 : {}",
                self.dimension
            )));
        }
        if self.numa_nodes < 1 {
            return Err(Error::InvalidConfig(format!(
                "Number of NUMA nodes must be >= 1 : {}",
                self.numa_nodes
            )));
        }
        if self.nodes < 1 {
            return Err(Error::InvalidConfig(format!(
                "Number of nodes must be >= 1 : {}",
                self.nodes
            )));
        }
        Ok(())
    }
}
