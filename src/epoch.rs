//! Co-scheduled launch of every shard
//!
//! An [`Epoch`] owns the validated grid and the machine topology. Running it
//! maps all shards at once, wires the ghost links into the memories the
//! mapping chose, starts one thread per shard and gathers their reports.

use crate::barrier::{PhaseBarrier, MAX_THRESHOLD};
use crate::config::StencilConfig;
use crate::error::{Error, Result};
use crate::exchange::{build_exchange, GhostDirection};
use crate::partition::GridSpec;
use crate::placement::{
    EpochMapping, LogicalRegion, NodeId, PlacementPolicy, TaskInstance, Topology,
};
use crate::report::{RunReport, ShardReport};
use crate::shard::{spawn, ShardConfig, ShardHandle, ShardOutcome};
use crate::spmd::{run_shard, ShardPlan};
use crate::stencil::flops_per_iteration;
use crate::substrate::{helper_pool, PoolSubstrate};
use tracing::{debug, error, info};

/// Name of the co-scheduled shard task
pub const SHARD_TASK: &str = "spmd";

/// One run of the stencil over all shards
#[derive(Debug, Clone)]
pub struct Epoch {
    config: StencilConfig,
    spec: GridSpec,
    topology: Topology,
}

impl Epoch {
    /// Validate `config` and discover the local machine
    pub fn new(config: StencilConfig) -> Result<Self> {
        let spec = config.validate()?;
        let nodes = config.nodes as usize;
        let topology = Topology::discover(nodes, spec.num_tiles() / nodes)?;
        Self::assemble(config, spec, topology)
    }

    /// Validate `config` and run on an explicit topology
    pub fn with_topology(config: StencilConfig, topology: Topology) -> Result<Self> {
        let spec = config.validate()?;
        Self::assemble(config, spec, topology)
    }

    fn assemble(config: StencilConfig, spec: GridSpec, topology: Topology) -> Result<Self> {
        if topology.num_nodes() != config.nodes as usize {
            return Err(Error::Placement(format!(
                "topology has {} nodes, configuration asks for {}",
                topology.num_nodes(),
                config.nodes
            )));
        }
        Ok(Self {
            config,
            spec,
            topology,
        })
    }

    /// The validated grid
    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    /// The topology shards are placed on
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The configuration the epoch was built from
    pub fn config(&self) -> &StencilConfig {
        &self.config
    }

    /// Work-block threads each shard's pool gets
    ///
    /// Row-bands never outnumber a tile's rows, so threads beyond the tile
    /// height would have no block to run.
    pub fn blocks_per_shard(&self) -> usize {
        let rows = self.spec.tile_height() as usize;
        (self.config.threads as usize).min(rows).max(1)
    }

    /// One task per tile referencing its own region first, then each
    /// neighbor's region in ghost-direction order
    pub fn tasks(&self) -> Vec<TaskInstance> {
        self.spec
            .tiles()
            .map(|tile| {
                let own = LogicalRegion(tile.index());
                let neighbors = GhostDirection::ALL
                    .iter()
                    .filter_map(|&dir| tile.neighbor(dir))
                    .map(|id| LogicalRegion(self.spec.linear_index(id)));
                TaskInstance {
                    index: tile.index(),
                    name: SHARD_TASK.to_string(),
                    regions: std::iter::once(own).chain(neighbors).collect(),
                }
            })
            .collect()
    }

    /// Place every shard and check that both ends of each ghost link agree
    /// on the buffer's memory
    pub fn map_shards(&self) -> Result<EpochMapping> {
        let tasks = self.tasks();
        let mapping = PlacementPolicy::new(&self.topology).map_epoch(&tasks)?;

        for task in &tasks {
            for (slot, region) in task.regions.iter().enumerate().skip(1) {
                let producer_view = mapping.memory(task.index, slot);
                let consumer_view = mapping.memory(region.0, 0);
                if producer_view != consumer_view {
                    return Err(Error::Placement(format!(
                        "shard {} maps region {} to {producer_view}, its owner uses {consumer_view}",
                        task.index, region.0
                    )));
                }
            }
        }
        Ok(mapping)
    }

    /// Run every shard to completion and aggregate their reports
    ///
    /// Returns on the first shard failure; shards still blocked on a barrier
    /// are left behind.
    pub fn run(&self) -> Result<RunReport> {
        let total = self.spec.num_tiles();
        if total > MAX_THRESHOLD as usize {
            return Err(Error::InvalidConfig(format!(
                "{total} shards exceed the barrier limit of {MAX_THRESHOLD}"
            )));
        }
        let iterations = self.config.iterations as usize;
        let threads = self.blocks_per_shard();
        let pin = self.config.pin_threads;

        let mapping = self.map_shards()?;
        let policy = PlacementPolicy::new(&self.topology);
        let ports = build_exchange(&self.spec, |tile| mapping.memory(tile, 0))?;

        let helpers = (0..self.topology.num_nodes())
            .map(|node| {
                let resource = policy.helper_resource(NodeId(node))?;
                let core = self.topology.resource(resource).core.filter(|_| pin);
                debug!(node, %resource, ?core, "helper placed");
                helper_pool(&format!("node{node}-helper"), core)
            })
            .collect::<Result<Vec<_>>>()?;

        let startup = PhaseBarrier::create("startup", total as u32);
        let (tx, rx) = flume::unbounded::<ShardOutcome<ShardReport>>();
        info!(
            shards = total,
            tiles_x = self.spec.tiles_x(),
            tiles_y = self.spec.tiles_y(),
            iterations,
            threads,
            "launching epoch"
        );

        let mut handles: Vec<ShardHandle> = Vec::with_capacity(total);
        for (tile, ports) in self.spec.tiles().zip(ports) {
            let index = tile.index();
            let target = mapping.target(index);
            let resource = self.topology.resource(target);
            let block_cores: Vec<Option<usize>> = policy
                .slice_targets(target, threads)
                .into_iter()
                .map(|r| self.topology.resource(r).core.filter(|_| pin))
                .collect();
            let helper = helpers[resource.node.0].clone();

            let mut shard_config = ShardConfig::new().with_name(format!("shard-{index}"));
            if let Some(core) = resource.core.filter(|_| pin) {
                shard_config = shard_config.with_cpu_affinity(core);
            }
            let plan = ShardPlan {
                tile,
                resource: target,
                iterations,
                timing_only: self.config.timing_only,
                startup: startup.clone(),
            };

            handles.push(spawn(index, shard_config, tx.clone(), move || {
                let name = format!("shard-{index}");
                let substrate = PoolSubstrate::build(&name, block_cores, helper)?;
                run_shard(plan, ports, &substrate)
            })?);
        }
        drop(tx);

        let mut reports = Vec::with_capacity(total);
        for _ in 0..total {
            let (shard, outcome) = rx.recv()?;
            match outcome {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(shard, %err, "shard failed");
                    return Err(err);
                }
            }
        }
        for handle in handles {
            handle.join()?;
        }
        reports.sort_by_key(|r| r.shard);

        let flops = flops_per_iteration(self.spec.n(), self.spec.radius());
        let report = RunReport::from_shards(&reports, iterations, flops, self.config.timing);
        info!(
            max_time = report.max_time,
            avg_time = report.avg_time,
            error = ?report.total_error,
            "epoch finished"
        );
        Ok(report)
    }
}
