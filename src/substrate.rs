//! Execution substrate consumed by the SPMD coordinator
//!
//! The coordinator only needs two launch shapes: an index launch over a batch
//! of disjoint work-blocks and a single task on a dedicated helper. Both are
//! behind the [`Substrate`] trait so the driver can run on pinned rayon pools
//! in production and inline in tests.
//!
//! Regions and their partitions live in a [`RegionForest`], a handle-indexed
//! arena that validates every partition it is asked to create.

use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::partition::check_tiling;
use crate::shard::pin_current_thread;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Launch interface of the host execution substrate
pub trait Substrate: Send + Sync {
    /// Run `body(i, item)` for every item and wait for all of them
    ///
    /// Results are returned in item order.
    fn launch_parallel<T, R, F>(&self, items: Vec<T>, body: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync;

    /// Run `body` once on the substrate's helper and wait for it
    fn launch_single<R, F>(&self, body: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send;

    /// Number of work-blocks that can run at once; index launches are split
    /// into at most this many blocks
    fn parallelism(&self) -> usize;
}

/// Runs everything on the calling thread
#[derive(Debug, Clone, Copy)]
pub struct InlineSubstrate {
    parallelism: usize,
}

impl InlineSubstrate {
    /// Create a substrate that reports `parallelism` but runs sequentially
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }
}

impl Default for InlineSubstrate {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Substrate for InlineSubstrate {
    fn launch_parallel<T, R, F>(&self, items: Vec<T>, body: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync,
    {
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| body(i, item))
            .collect()
    }

    fn launch_single<R, F>(&self, body: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        body()
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }
}

/// Build the single-threaded helper pool of one node
pub fn helper_pool(name: &str, core: Option<usize>) -> Result<Arc<ThreadPool>> {
    let label = name.to_string();
    let pool = ThreadPoolBuilder::new()
        .num_threads(1)
        .thread_name(move |_| label.clone())
        .start_handler(move |_| {
            if let Some(core) = core {
                pin_current_thread(core);
            }
        })
        .build()?;
    Ok(Arc::new(pool))
}

/// A shard's work-block pool plus the shared helper of its node
#[derive(Debug)]
pub struct PoolSubstrate {
    pool: ThreadPool,
    helper: Arc<ThreadPool>,
}

impl PoolSubstrate {
    /// Build a pool with one thread per entry of `cores`
    ///
    /// Thread `i` is pinned to `cores[i]` when it is `Some`.
    pub fn build(name: &str, cores: Vec<Option<usize>>, helper: Arc<ThreadPool>) -> Result<Self> {
        if cores.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "work-block pool '{name}' needs at least one thread"
            )));
        }
        let label = name.to_string();
        let threads = cores.len();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{label}-block-{i}"))
            .start_handler(move |i| {
                if let Some(Some(core)) = cores.get(i) {
                    pin_current_thread(*core);
                }
            })
            .build()?;
        debug!(pool = name, threads, "work-block pool ready");
        Ok(Self { pool, helper })
    }
}

impl Substrate for PoolSubstrate {
    fn launch_parallel<T, R, F>(&self, items: Vec<T>, body: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync,
    {
        self.pool.install(|| {
            items
                .into_par_iter()
                .enumerate()
                .map(|(i, item)| body(i, item))
                .collect()
        })
    }

    fn launch_single<R, F>(&self, body: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.helper.install(body)
    }

    fn parallelism(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Handle of a region in a [`RegionForest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionHandle(usize);

/// Handle of a partition in a [`RegionForest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionHandle(usize);

/// Color naming one subregion of a partition
pub type Color = usize;

#[derive(Debug)]
struct RegionNode {
    rect: Rect,
    parent: Option<PartitionHandle>,
}

#[derive(Debug)]
struct PartitionNode {
    parent: RegionHandle,
    complete: bool,
    children: BTreeMap<Color, RegionHandle>,
}

/// Arena of regions and their partitions
#[derive(Debug, Default)]
pub struct RegionForest {
    regions: Vec<RegionNode>,
    partitions: Vec<PartitionNode>,
}

impl RegionForest {
    /// Create an empty forest
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root region
    pub fn create_region(&mut self, rect: Rect) -> RegionHandle {
        self.regions.push(RegionNode { rect, parent: None });
        RegionHandle(self.regions.len() - 1)
    }

    /// Partition `parent` by an explicit coloring
    ///
    /// Subregions must stay inside the parent and be pairwise disjoint;
    /// a `complete` partition must also cover it exactly.
    pub fn create_partition(
        &mut self,
        parent: RegionHandle,
        coloring: impl IntoIterator<Item = (Color, Rect)>,
        complete: bool,
    ) -> Result<PartitionHandle> {
        let parent_rect = self.region(parent)?.rect;
        let coloring: Vec<(Color, Rect)> = coloring.into_iter().collect();
        let rects: Vec<Rect> = coloring.iter().map(|(_, r)| *r).collect();
        check_tiling(parent_rect, &rects, complete)?;
        for (i, (color, _)) in coloring.iter().enumerate() {
            if coloring[..i].iter().any(|(c, _)| c == color) {
                return Err(Error::Partition(format!(
                    "color {color} used twice in partition of {parent_rect}"
                )));
            }
        }

        let handle = PartitionHandle(self.partitions.len());
        let mut children = BTreeMap::new();
        for (color, rect) in coloring {
            self.regions.push(RegionNode {
                rect,
                parent: Some(handle),
            });
            children.insert(color, RegionHandle(self.regions.len() - 1));
        }
        self.partitions.push(PartitionNode {
            parent,
            complete,
            children,
        });
        Ok(handle)
    }

    /// Subregion of `partition` with `color`, if that color exists
    pub fn subregion(&self, partition: PartitionHandle, color: Color) -> Option<RegionHandle> {
        self.partitions.get(partition.0)?.children.get(&color).copied()
    }

    /// All `(color, subregion)` pairs of a partition in color order
    pub fn subregions(&self, partition: PartitionHandle) -> Vec<(Color, RegionHandle)> {
        self.partitions
            .get(partition.0)
            .map(|p| p.children.iter().map(|(c, r)| (*c, *r)).collect())
            .unwrap_or_default()
    }

    /// Bounds of a region
    pub fn rect(&self, region: RegionHandle) -> Result<Rect> {
        Ok(self.region(region)?.rect)
    }

    /// Region a partition was created from
    pub fn parent_of(&self, partition: PartitionHandle) -> Option<RegionHandle> {
        self.partitions.get(partition.0).map(|p| p.parent)
    }

    /// Partition a region was carved out of, if any
    pub fn partition_of(&self, region: RegionHandle) -> Option<PartitionHandle> {
        self.regions.get(region.0)?.parent
    }

    /// Whether a partition covers its parent exactly
    pub fn is_complete(&self, partition: PartitionHandle) -> bool {
        self.partitions.get(partition.0).is_some_and(|p| p.complete)
    }

    fn region(&self, region: RegionHandle) -> Result<&RegionNode> {
        self.regions
            .get(region.0)
            .ok_or_else(|| Error::Partition(format!("unknown region {}", region.0)))
    }
}
