//! SPMD shard coordinator
//!
//! Drives one tile through the run:
//!
//! ```text
//!   init ─ open ports ─ arrive(start)
//!   for k in 0..iterations:
//!       [k = 0: wait(start)]
//!       interior blocks        (parallel, previous IN only)
//!       push edges ─ pull ghosts
//!       boundary sectors       (helper)
//!       increment private IN   (parallel)
//!       advance ports
//!   drain ─ end time ─ check   (parallel)
//! ```

use crate::barrier::BarrierHandle;
use crate::error::{Error, Result};
use crate::exchange::ExchangePorts;
use crate::geometry::Rect;
use crate::partition::{balanced_split, Sector, Tile};
use crate::placement::ResourceId;
use crate::report::ShardReport;
use crate::stencil::{
    check_block, increment_block, initialize_block, split_row_bands, TileField, Weights,
};
use crate::substrate::{Color, PartitionHandle, RegionForest, RegionHandle, Substrate};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Color of the private box in the halo partition; ghost strips use their
/// direction index.
const PRIVATE_COLOR: Color = 4;

/// Regions one shard computes on, carved out of its local region forest
#[derive(Debug)]
pub struct TileLayout {
    forest: RegionForest,
    halo: RegionHandle,
    private: RegionHandle,
    interior: RegionHandle,
    boundary: Vec<(Sector, RegionHandle)>,
    interior_blocks: Vec<RegionHandle>,
    private_blocks: Vec<RegionHandle>,
}

impl TileLayout {
    /// Build the halo, sector and work-block partitions of `tile`
    ///
    /// Interior and private row-bands each use `threads` blocks, or one per
    /// row if there are fewer rows than that.
    pub fn build(tile: &Tile, threads: usize) -> Result<Self> {
        let mut forest = RegionForest::new();
        let halo = forest.create_region(tile.halo_box());

        let (ghosts, private_box) = tile.halo_pieces();
        let coloring = ghosts
            .into_iter()
            .map(|(dir, rect)| (dir.index(), rect))
            .chain(std::iter::once((PRIVATE_COLOR, private_box)));
        let halo_part = forest.create_partition(halo, coloring, false)?;
        let private = subregion(&forest, halo_part, PRIVATE_COLOR)?;

        let sectors = tile.sectors();
        let sector_part = forest.create_partition(
            private,
            sectors.iter().map(|&(s, r)| (s as Color, r)),
            true,
        )?;
        let interior = subregion(&forest, sector_part, Sector::Interior as Color)?;
        let boundary = sectors
            .iter()
            .filter(|(s, _)| *s != Sector::Interior)
            .map(|&(s, _)| Ok((s, subregion(&forest, sector_part, s as Color)?)))
            .collect::<Result<Vec<_>>>()?;

        let interior_blocks = row_blocks(&mut forest, interior, threads)?;
        let private_blocks = row_blocks(&mut forest, private, threads)?;

        Ok(Self {
            forest,
            halo,
            private,
            interior,
            boundary,
            interior_blocks,
            private_blocks,
        })
    }

    fn rect(&self, region: RegionHandle) -> Result<Rect> {
        self.forest.rect(region)
    }

    fn rects(&self, regions: &[RegionHandle]) -> Result<Vec<Rect>> {
        regions.iter().map(|&r| self.rect(r)).collect()
    }

    /// Halo-extended box the tile's fields cover
    pub fn halo_box(&self) -> Result<Rect> {
        self.rect(self.halo)
    }

    /// The tile's private box
    pub fn private_box(&self) -> Result<Rect> {
        self.rect(self.private)
    }

    /// The interior sector
    pub fn interior_box(&self) -> Result<Rect> {
        self.rect(self.interior)
    }

    /// Existing perimeter sectors
    pub fn boundary_sectors(&self) -> Result<Vec<(Sector, Rect)>> {
        self.boundary
            .iter()
            .map(|&(s, r)| Ok((s, self.rect(r)?)))
            .collect()
    }

    /// Row-bands of the interior sector
    pub fn interior_blocks(&self) -> Result<Vec<Rect>> {
        self.rects(&self.interior_blocks)
    }

    /// Row-bands of the private box
    pub fn private_blocks(&self) -> Result<Vec<Rect>> {
        self.rects(&self.private_blocks)
    }
}

fn subregion(
    forest: &RegionForest,
    partition: PartitionHandle,
    color: Color,
) -> Result<RegionHandle> {
    forest
        .subregion(partition, color)
        .ok_or_else(|| Error::Partition(format!("partition has no subregion with color {color}")))
}

fn row_blocks(
    forest: &mut RegionForest,
    region: RegionHandle,
    threads: usize,
) -> Result<Vec<RegionHandle>> {
    let rect = forest.rect(region)?;
    let workers = threads.min(rect.height() as usize).max(1);
    if workers < threads {
        debug!(%rect, threads, workers, "fewer rows than work-blocks");
    }
    let blocks = balanced_split(rect, workers)?;
    let part = forest.create_partition(region, blocks.into_iter().enumerate(), true)?;
    Ok(forest.subregions(part).into_iter().map(|(_, r)| r).collect())
}

/// Everything one shard needs besides its ports and substrate
#[derive(Debug, Clone)]
pub struct ShardPlan {
    /// The tile this shard owns
    pub tile: Tile,
    /// Resource the shard was placed on
    pub resource: ResourceId,
    /// Iterations to run
    pub iterations: usize,
    /// Skip the check pass
    pub timing_only: bool,
    /// Phase 0 of the all-shards-started barrier
    pub startup: BarrierHandle,
}

/// Run one shard to completion
pub fn run_shard<S: Substrate>(
    plan: ShardPlan,
    mut ports: ExchangePorts,
    substrate: &S,
) -> Result<ShardReport> {
    let tile = plan.tile;
    let shard = tile.index();
    let spec = *tile.spec();
    let (n, radius) = (spec.n(), spec.radius());
    let weights = Weights::star(radius);

    let layout = TileLayout::build(&tile, substrate.parallelism())?;
    let field_box = layout.halo_box()?;
    let interior_blocks = layout.interior_blocks()?;
    let private_blocks = layout.private_blocks()?;
    let boundary = layout.boundary_sectors()?;
    for (sector, _) in &boundary {
        for dep in sector.ghost_dependencies() {
            if !ports.has_input(*dep) {
                return Err(Error::Partition(format!(
                    "shard {shard}: sector {sector:?} reads a {dep:?} ghost strip with no producer"
                )));
            }
        }
    }
    let (private_box, interior_box) = (layout.private_box()?, layout.interior_box()?);
    debug!(
        shard,
        private = %private_box,
        interior = %interior_box,
        sectors = boundary.len(),
        blocks = interior_blocks.len(),
        "tile layout"
    );

    let mut field = TileField::new(field_box);
    {
        let (input, output) = field.fields_mut();
        let ins = split_row_bands(input, field_box, &private_blocks)?;
        let outs = split_row_bands(output, field_box, &private_blocks)?;
        let pairs: Vec<_> = ins.into_iter().zip(outs).collect();
        substrate.launch_parallel(pairs, |_, (mut i, mut o)| {
            initialize_block(field_box, &mut i, &mut o)
        });
    }

    ports.open();
    plan.startup.arrive();

    let mut start: Option<Instant> = None;
    for k in 0..plan.iterations {
        if k == 0 {
            plan.startup.wait();
        }

        {
            let (input, output) = field.split_mut();
            let bands = split_row_bands(output, field_box, &interior_blocks)?;
            let starts = substrate.launch_parallel(bands, |_, band| {
                let began = Instant::now();
                weights.apply(field_box, input, band.rows, band.first_row, band.block, n);
                began
            });
            if k == 0 {
                start = starts.into_iter().min();
            }
        }

        ports.push_all(&field);
        ports.pull_all(&mut field);

        substrate.launch_single(|| {
            let (input, output) = field.split_mut();
            for (_, rect) in &boundary {
                weights.apply(field_box, input, output, field_box.lo.y, *rect, n);
            }
        });

        {
            let (input, _) = field.fields_mut();
            let bands = split_row_bands(input, field_box, &private_blocks)?;
            substrate.launch_parallel(bands, |_, mut band| increment_block(field_box, &mut band));
        }

        ports.advance();
        trace!(shard, iteration = k, "iteration done");
    }

    let drain = plan.startup.advance();
    drain.arrive();
    drain.wait();
    let end = Instant::now();

    let error = if plan.timing_only {
        None
    } else {
        let output = field.output();
        let errors = substrate.launch_parallel(private_blocks, |_, block| {
            check_block(field_box, output, block, n, radius, plan.iterations)
        });
        Some(errors.into_iter().sum())
    };

    info!(shard, resource = %plan.resource, ?error, "shard finished");
    Ok(ShardReport {
        shard,
        resource: plan.resource,
        start: start.unwrap_or(end),
        end,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::PhaseBarrier;
    use crate::exchange::build_exchange;
    use crate::partition::{check_tiling, GridSpec, TileId};
    use crate::placement::MemoryId;
    use crate::stencil::EPSILON;
    use crate::substrate::InlineSubstrate;
    use std::thread;

    #[test]
    fn test_layout_partitions_tile() {
        let spec = GridSpec::new(18, 2, 3, 2).unwrap();
        let tile = spec.tile(TileId::new(1, 0)).unwrap();
        let layout = TileLayout::build(&tile, 4).unwrap();

        assert_eq!(layout.halo_box().unwrap(), tile.halo_box());
        assert_eq!(layout.private_box().unwrap(), tile.private_box());
        assert_eq!(layout.interior_box().unwrap(), tile.interior_box());

        let mut pieces: Vec<Rect> = layout
            .boundary_sectors()
            .unwrap()
            .iter()
            .map(|(_, r)| *r)
            .collect();
        pieces.push(layout.interior_box().unwrap());
        check_tiling(tile.private_box(), &pieces, true).unwrap();

        let blocks = layout.private_blocks().unwrap();
        assert_eq!(blocks.len(), 4);
        check_tiling(tile.private_box(), &blocks, true).unwrap();
    }

    #[test]
    fn test_layout_clamps_blocks_to_rows() {
        let spec = GridSpec::new(8, 1, 2, 2).unwrap();
        let tile = spec.tile(TileId::new(0, 0)).unwrap();
        let layout = TileLayout::build(&tile, 16).unwrap();
        // Interior of a corner tile is 3 rows, the private box 4.
        assert_eq!(layout.interior_blocks().unwrap().len(), 3);
        assert_eq!(layout.private_blocks().unwrap().len(), 4);
    }

    fn run_grid(spec: GridSpec, iterations: usize, threads: usize) -> Vec<ShardReport> {
        let ports = build_exchange(&spec, |_| MemoryId(0)).unwrap();
        let startup = PhaseBarrier::create("start", spec.num_tiles() as u32);
        thread::scope(|s| {
            let handles: Vec<_> = spec
                .tiles()
                .zip(ports)
                .map(|(tile, ports)| {
                    let plan = ShardPlan {
                        tile,
                        resource: ResourceId(tile.index()),
                        iterations,
                        timing_only: false,
                        startup: startup.clone(),
                    };
                    s.spawn(move || run_shard(plan, ports, &InlineSubstrate::new(threads)))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        })
    }

    #[test]
    fn test_single_tile_converges() {
        let spec = GridSpec::new(9, 2, 1, 1).unwrap();
        let reports = run_grid(spec, 3, 2);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.unwrap() < EPSILON);
        assert!(reports[0].end >= reports[0].start);
    }

    #[test]
    fn test_tiled_grid_converges() {
        let spec = GridSpec::new(12, 1, 2, 3).unwrap();
        let reports = run_grid(spec, 4, 3);
        assert_eq!(reports.len(), 6);
        let total: f64 = reports.iter().filter_map(|r| r.error).sum();
        assert!(total < EPSILON, "total error {total}");
    }

    #[test]
    fn test_more_blocks_than_rows_converges() {
        let spec = GridSpec::new(8, 1, 2, 2).unwrap();
        let reports = run_grid(spec, 2, 64);
        let total: f64 = reports.iter().filter_map(|r| r.error).sum();
        assert!(total < EPSILON, "total error {total}");
    }

    #[test]
    fn test_timing_only_skips_check() {
        let spec = GridSpec::new(9, 2, 1, 1).unwrap();
        let ports = build_exchange(&spec, |_| MemoryId(0)).unwrap();
        let plan = ShardPlan {
            tile: spec.tile(TileId::new(0, 0)).unwrap(),
            resource: ResourceId(0),
            iterations: 2,
            timing_only: true,
            startup: PhaseBarrier::create("start", 1),
        };
        let ports = ports.into_iter().next().unwrap();
        let report = run_shard(plan, ports, &InlineSubstrate::default()).unwrap();
        assert_eq!(report.error, None);
    }
}
