//! Error types for the SPMD stencil runtime

use thiserror::Error;

/// Result type alias for stencil runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while configuring or running the stencil
///
/// Configuration errors are raised before any shard launches. Partition and
/// placement errors indicate a broken decomposition or mapping invariant and
/// are never retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent grid/CLI parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A partition produced overlapping, out-of-bounds or incomplete pieces
    #[error("Partitioning error: {0}")]
    Partition(String),

    /// The placement policy could not produce a consistent assignment
    #[error("Placement error: {0}")]
    Placement(String),

    /// Accumulated validation error reached the threshold
    #[error("Squared error {error} exceeds threshold {threshold:e}")]
    ValidationFailed {
        /// Accumulated error over all tiles
        error: f64,
        /// Acceptance threshold
        threshold: f64,
    },

    /// A shard thread panicked
    #[error("Shard panicked: {0}")]
    ShardPanicked(String),

    /// A shard thread could not be spawned
    #[error("Failed to spawn shard thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A work-block thread pool could not be built
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The epoch lost contact with a shard before it reported
    #[error("Shard report channel closed: {0}")]
    Disconnected(String),
}

impl From<flume::RecvError> for Error {
    fn from(err: flume::RecvError) -> Self {
        Error::Disconnected(err.to_string())
    }
}

impl Error {
    /// Whether this error belongs to the configuration class
    pub fn is_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
