//! Property-based tests for partitioning, barriers, placement and exchange

use proptest::prelude::*;
use spmd_stencil::barrier::PhaseBarrier;
use spmd_stencil::exchange::build_exchange;
use spmd_stencil::partition::{balanced_sizes, balanced_split, check_tiling, GridSpec, Sector};
use spmd_stencil::placement::{MemoryId, PlacementPolicy, Topology};
use spmd_stencil::stencil::TileField;
use spmd_stencil::{Coord, Epoch, Rect, StencilConfig};
use std::collections::HashSet;
use std::thread;

/// A grid with `tiles_x × tiles_y` tiles of `w × h` cells each
fn grid() -> impl Strategy<Value = GridSpec> {
    (1i64..5, 1i64..5, 1i64..4, 1i64..8, 1i64..8).prop_filter_map(
        "grid must admit a non-empty interior",
        |(tx, ty, r, extra_w, extra_h)| {
            let n = tx * ty * (2 * r + extra_w.max(extra_h));
            GridSpec::new(n, r, tx, ty).ok()
        },
    )
}

fn cell_value(seed: u64, x: Coord, y: Coord) -> f64 {
    let h = seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add((x as u64) << 32)
        .wrapping_add(y as u64);
    (h % 100_003) as f64
}

proptest! {
    /// Sectors of every tile cover its private box exactly, and each
    /// perimeter sector only reads ghost strips that exist.
    #[test]
    fn sectors_tile_private_box(spec in grid()) {
        for tile in spec.tiles() {
            let sectors = tile.sectors();
            let rects: Vec<Rect> = sectors.iter().map(|(_, r)| *r).collect();
            prop_assert!(check_tiling(tile.private_box(), &rects, true).is_ok());
            prop_assert_eq!(sectors.last().map(|(s, _)| *s), Some(Sector::Interior));
            for (sector, _) in &sectors {
                for dep in sector.ghost_dependencies() {
                    prop_assert!(tile.has_neighbor(*dep));
                }
            }
        }
    }

    /// Balanced splits sum to the extent, differ by at most one row and are
    /// laid out contiguously in increasing order.
    #[test]
    fn balanced_split_is_even(size in 1i64..400, workers_seed in 0usize..400) {
        let workers = workers_seed % size as usize + 1;
        let sizes = balanced_sizes(size, workers).unwrap();
        prop_assert_eq!(sizes.iter().sum::<Coord>(), size);
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        prop_assert!(max - min <= 1);

        let rect = Rect::from_coords(3, 7, 9, 7 + size - 1);
        let blocks = balanced_split(rect, workers).unwrap();
        let mut next = rect.lo.y;
        for (block, rows) in blocks.iter().zip(&sizes) {
            prop_assert_eq!(block.lo.y, next);
            prop_assert_eq!(block.height(), *rows);
            next = block.hi.y + 1;
        }
        prop_assert_eq!(next, rect.hi.y + 1);
    }

    /// Placement is a pure function of topology and shard count.
    #[test]
    fn placement_is_deterministic(nodes in 1usize..4, per_node in 1usize..8, seed in 0usize..8) {
        let shards_per_node = seed % per_node + 1;
        let topology = Topology::uniform(nodes, per_node).unwrap();
        let policy = PlacementPolicy::new(&topology);
        let first = policy.assign_shards(nodes * shards_per_node).unwrap();
        let second = PlacementPolicy::new(&topology).assign_shards(nodes * shards_per_node).unwrap();
        prop_assert_eq!(&first, &second);

        let distinct: HashSet<_> = first.iter().collect();
        prop_assert_eq!(distinct.len(), first.len());
        for (i, resource) in first.iter().enumerate() {
            prop_assert_eq!(topology.resource(*resource).node.0, i / shards_per_node);
        }
    }

    /// Mapping a whole epoch is deterministic, and both ends of every ghost
    /// link resolve the consumer's region to the consumer's own memory.
    #[test]
    fn epoch_mapping_agrees_on_link_memory(
        nodes in 1usize..4,
        shards_per_node in 1usize..5,
        spare in 0usize..3,
    ) {
        let ranks = (nodes * shards_per_node) as i64;
        let config = StencilConfig::new()
            .with_threads(2)
            .with_iterations(1)
            .with_dimension(ranks * 6)
            .with_radius(1)
            .with_nodes(nodes as i64)
            .with_numa_nodes(shards_per_node as i64);
        let topology = Topology::uniform(nodes, shards_per_node + spare).unwrap();
        let epoch = Epoch::with_topology(config, topology.clone()).unwrap();

        let tasks = epoch.tasks();
        let policy = PlacementPolicy::new(&topology);
        let first = policy.map_epoch(&tasks).unwrap();
        prop_assert_eq!(&first, &policy.map_epoch(&tasks).unwrap());
        let mapping = epoch.map_shards().unwrap();

        for task in &tasks {
            let own = topology.memory_of(mapping.target(task.index));
            prop_assert_eq!(mapping.memory(task.index, 0), own);
            for (slot, region) in task.regions.iter().enumerate().skip(1) {
                let owner = topology.memory_of(mapping.target(region.0));
                prop_assert_eq!(mapping.memory(task.index, slot), owner);
                prop_assert_eq!(mapping.memory(region.0, 0), owner);
            }
        }
    }

    /// After one exchange round every ghost cell holds the neighbor's value.
    #[test]
    fn ghosts_match_neighbor_edges(spec in grid(), seed in any::<u64>()) {
        let mut ports = build_exchange(&spec, |_| MemoryId(0)).unwrap();
        let tiles: Vec<_> = spec.tiles().collect();
        let mut fields: Vec<TileField> = tiles
            .iter()
            .map(|tile| {
                let halo = tile.halo_box();
                let private = tile.private_box();
                let mut field = TileField::new(halo);
                for y in halo.lo.y..=halo.hi.y {
                    let row = field.input_row_mut(y, halo.lo.x, halo.hi.x);
                    for (x, cell) in (halo.lo.x..).zip(row.iter_mut()) {
                        let owned = private.contains_point(spmd_stencil::Point::new(x, y));
                        *cell = if owned { cell_value(seed, x, y) } else { -1.0 };
                    }
                }
                field
            })
            .collect();

        for p in &mut ports {
            p.open();
        }
        for (p, field) in ports.iter().zip(&fields) {
            p.push_all(field);
        }
        for (p, field) in ports.iter().zip(fields.iter_mut()) {
            p.pull_all(field);
        }

        for (tile, field) in tiles.iter().zip(&fields) {
            let (ghosts, _) = tile.halo_pieces();
            for (_, strip) in ghosts {
                for pt in strip.points() {
                    prop_assert_eq!(field.input_at(pt.x, pt.y), cell_value(seed, pt.x, pt.y));
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every completed round advances the phase by exactly one, whatever the
    /// interleaving of arrivals.
    #[test]
    fn barrier_phase_advances_by_one(threshold in 1u32..6, rounds in 1u64..25) {
        let h0 = PhaseBarrier::create("prop", threshold);
        let observed: Vec<Vec<u64>> = thread::scope(|s| {
            let workers: Vec<_> = (0..threshold)
                .map(|_| {
                    let mut h = h0.clone();
                    s.spawn(move || {
                        let mut seen = Vec::new();
                        for _ in 0..rounds {
                            h.arrive();
                            h.wait();
                            seen.push(h.barrier().phase());
                            h = h.advance();
                        }
                        seen
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for seen in observed {
            prop_assert_eq!(seen, (1..=rounds).collect::<Vec<_>>());
        }
        prop_assert_eq!(h0.barrier().phase(), rounds);
        prop_assert_eq!(h0.barrier().arrivals(), 0);
    }
}
