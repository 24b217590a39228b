//! # SPMD Stencil Runtime
//!
//! A small halo-exchange SPMD runtime that applies a fixed-radius star
//! stencil to an `n × n` grid split into `Px × Py` tiles. Every tile is run
//! by its own shard, and every shard runs its work-blocks in parallel.
//!
//! ## Key Features
//!
//! - **Pure partitioning**: tiles, halos, nine sectors and balanced row-bands
//!   are plain data computed from the grid parameters
//! - **Phase barriers**: counting barriers with a monotonically advancing
//!   phase, advanced with compare-and-swap
//! - **Ghost exchange**: one staging buffer and one full/empty barrier pair
//!   per directed link between neighboring tiles
//! - **Placement**: deterministic shard, helper and work-block placement over
//!   an immutable topology, with memory agreement across co-scheduled shards
//! - **CPU affinity**: optional pinning of shard and work-block threads
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   edge strip    ┌──────────────┐
//! │   Shard A    │ ──────────────> │ GhostBuffer  │
//! │ (tile 0, 0)  │   full / empty  │  (on B side) │
//! └──────────────┘ <────────────── └──────────────┘
//!        │                                │ ghost cells
//!        ▼                                ▼
//! ┌──────────────┐                 ┌──────────────┐
//! │ work-blocks  │                 │   Shard B    │
//! │  (rayon)     │                 │ (tile 1, 0)  │
//! └──────────────┘                 └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use spmd_stencil::prelude::*;
//!
//! let config = StencilConfig::new()
//!     .with_threads(4)
//!     .with_iterations(10)
//!     .with_dimension(1024)
//!     .with_numa_nodes(4);
//! let report = Epoch::new(config)?.run()?;
//! report.verdict(EPSILON)?;
//! println!("{report}");
//! # Ok::<(), spmd_stencil::Error>(())
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod barrier;
pub mod config;
pub mod epoch;
pub mod error;
pub mod exchange;
pub mod geometry;
pub mod partition;
pub mod placement;
pub mod report;
pub mod shard;
pub mod spmd;
pub mod stencil;
pub mod substrate;

// Re-exports
pub use barrier::{BarrierHandle, PhaseBarrier};
pub use config::StencilConfig;
pub use epoch::Epoch;
pub use error::{Error, Result};
pub use exchange::{build_exchange, ExchangePorts, GhostBuffer, InputPort, OutputPort};
pub use geometry::{Coord, Point, Rect};
pub use partition::{
    balanced_split, describe_sectors, tile_grid, GhostDirection, GridSpec, Sector, Tile, TileId,
};
pub use placement::{PlacementPolicy, Topology};
pub use report::{RunReport, ShardReport, TimingMode};
pub use spmd::{run_shard, ShardPlan, TileLayout};
pub use substrate::{InlineSubstrate, PoolSubstrate, RegionForest, Substrate};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::barrier::{BarrierHandle, PhaseBarrier};
    pub use crate::config::StencilConfig;
    pub use crate::epoch::Epoch;
    pub use crate::error::{Error, Result};
    pub use crate::geometry::Rect;
    pub use crate::partition::{GhostDirection, GridSpec, Sector};
    pub use crate::report::{RunReport, TimingMode};
    pub use crate::stencil::EPSILON;
}
