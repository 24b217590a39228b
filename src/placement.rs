//! Placement of shards and their regions onto execution resources
//!
//! The [`Topology`] is discovered once and never changes. The
//! [`PlacementPolicy`] borrows it and answers every mapping question
//! deterministically: which resource runs a shard, which resource runs the
//! per-node helper, where the work-blocks of an index launch go, and which
//! memory each region of a co-scheduled group lives in.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Node (address space) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct NodeId(pub usize);

/// Execution resource identifier, unique across all nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct ResourceId(pub usize);

/// Memory identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct MemoryId(pub usize);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sysmem{}", self.0)
    }
}

/// One execution resource
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Resource {
    /// Identifier
    pub id: ResourceId,
    /// Node the resource belongs to
    pub node: NodeId,
    /// Node-local system memory used for everything this resource maps
    pub memory: MemoryId,
    /// OS core the resource is pinned to, if known
    pub core: Option<usize>,
}

/// Immutable machine description: resources grouped by node
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Topology {
    resources: Vec<Resource>,
    nodes: Vec<Vec<ResourceId>>,
}

impl Topology {
    /// Build a topology from `(node, core)` pairs
    ///
    /// Resources are numbered in the given order and grouped by node; each
    /// node gets one system memory.
    pub fn from_resources(entries: impl IntoIterator<Item = (usize, Option<usize>)>) -> Result<Self> {
        let mut resources = Vec::new();
        let mut by_node: BTreeMap<usize, Vec<ResourceId>> = BTreeMap::new();
        for (i, (node, core)) in entries.into_iter().enumerate() {
            let id = ResourceId(i);
            resources.push(Resource {
                id,
                node: NodeId(node),
                memory: MemoryId(node),
                core,
            });
            by_node.entry(node).or_default().push(id);
        }

        let num_nodes = by_node.keys().next_back().map_or(0, |&max| max + 1);
        if num_nodes == 0 || by_node.len() != num_nodes {
            return Err(Error::Placement(format!(
                "node ids must be dense and non-empty, got {:?}",
                by_node.keys().collect::<Vec<_>>()
            )));
        }
        let nodes = by_node.into_values().collect();
        Ok(Self { resources, nodes })
    }

    /// `nodes` nodes with `per_node` resources each and no core binding
    pub fn uniform(nodes: usize, per_node: usize) -> Result<Self> {
        if nodes == 0 || per_node == 0 {
            return Err(Error::Placement(format!(
                "cannot build a {nodes}x{per_node} topology"
            )));
        }
        Self::from_resources((0..nodes).flat_map(|node| (0..per_node).map(move |_| (node, None))))
    }

    /// Discover the local machine, split evenly into `nodes` nodes
    ///
    /// Every node gets at least `min_per_node` resources; when the machine has
    /// fewer cores than that, resources share cores round-robin.
    pub fn discover(nodes: usize, min_per_node: usize) -> Result<Self> {
        if nodes == 0 {
            return Err(Error::Placement("cannot discover zero nodes".to_string()));
        }
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let available = num_cpus::get().max(cores.len()).max(1);
        let per_node = (available / nodes).max(min_per_node).max(1);
        debug!(available, nodes, per_node, "discovered topology");

        Self::from_resources((0..nodes * per_node).map(|i| {
            let core = (!cores.is_empty()).then(|| cores[i % cores.len()].id);
            (i / per_node, core)
        }))
    }

    /// Number of nodes
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Resources of `node`, in discovery order
    pub fn resources_on(&self, node: NodeId) -> &[ResourceId] {
        self.nodes.get(node.0).map_or(&[], Vec::as_slice)
    }

    /// Look up a resource
    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0]
    }

    /// Node-local memory of a resource
    pub fn memory_of(&self, id: ResourceId) -> MemoryId {
        self.resources[id.0].memory
    }
}

/// A logical region that may be referenced by several tasks
///
/// For the stencil this is the halo-extended region of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct LogicalRegion(pub usize);

/// A task instance of a co-scheduled launch and the regions it references
///
/// Slot 0 is the task's primary region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInstance {
    /// Position in the launch
    pub index: usize,
    /// Task name
    pub name: String,
    /// Referenced regions, primary first
    pub regions: Vec<LogicalRegion>,
}

/// Two tasks referencing the same logical region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingConstraint {
    /// First task
    pub t1: usize,
    /// Region slot in the first task
    pub idx1: usize,
    /// Second task
    pub t2: usize,
    /// Region slot in the second task
    pub idx2: usize,
}

/// One constraint per pair of tasks sharing a logical region
///
/// Pairs are emitted in task order, so the result is deterministic.
pub fn coscheduling_constraints(tasks: &[TaskInstance]) -> Vec<MappingConstraint> {
    let mut users: BTreeMap<LogicalRegion, Vec<(usize, usize)>> = BTreeMap::new();
    for (t, task) in tasks.iter().enumerate() {
        for (idx, region) in task.regions.iter().enumerate() {
            users.entry(*region).or_default().push((t, idx));
        }
    }

    let mut constraints = Vec::new();
    for refs in users.values() {
        for (i, &(t1, idx1)) in refs.iter().enumerate() {
            for &(t2, idx2) in &refs[i + 1..] {
                constraints.push(MappingConstraint { t1, idx1, t2, idx2 });
            }
        }
    }
    constraints
}

/// Largest contiguous blocking factor
pub const MAX_BLOCKING_FACTOR: usize = usize::MAX;

/// How one region of one task is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct RegionMapping {
    /// Memory the region instance lives in
    pub memory: MemoryId,
    /// Map without a physical instance
    pub virtual_map: bool,
    /// Allow write-after-read instance reuse
    pub war_optimization: bool,
    /// Use a reduction list instance
    pub reduction_list: bool,
    /// Contiguous blocking factor of the layout
    pub blocking_factor: usize,
}

impl RegionMapping {
    /// Defaults for ordinary tasks: physical, local, fully contiguous
    pub fn local(memory: MemoryId) -> Self {
        Self {
            memory,
            virtual_map: false,
            war_optimization: false,
            reduction_list: false,
            blocking_factor: MAX_BLOCKING_FACTOR,
        }
    }
}

/// Resolved placement of a co-scheduled launch
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct EpochMapping {
    /// Resource of each task
    pub targets: Vec<ResourceId>,
    /// Mapping of each region slot of each task
    pub regions: Vec<Vec<RegionMapping>>,
}

impl EpochMapping {
    /// Resource task `task` runs on
    pub fn target(&self, task: usize) -> ResourceId {
        self.targets[task]
    }

    /// Memory of region slot `idx` of task `task`
    pub fn memory(&self, task: usize, idx: usize) -> MemoryId {
        self.regions[task][idx].memory
    }
}

/// Placement decisions over a fixed topology
#[derive(Debug, Clone, Copy)]
pub struct PlacementPolicy<'t> {
    topology: &'t Topology,
}

impl<'t> PlacementPolicy<'t> {
    /// Create a policy over `topology`
    pub fn new(topology: &'t Topology) -> Self {
        Self { topology }
    }

    /// The topology decisions are made against
    pub fn topology(&self) -> &'t Topology {
        self.topology
    }

    /// Resource of every shard of a `total`-shard launch
    ///
    /// Shards are split into contiguous per-node blocks; shard `i` goes to
    /// resource `i mod shardsPerNode` of node `i / shardsPerNode`.
    pub fn assign_shards(&self, total: usize) -> Result<Vec<ResourceId>> {
        let nodes = self.topology.num_nodes();
        if total == 0 || total % nodes != 0 {
            return Err(Error::Placement(format!(
                "{total} shards do not divide evenly across {nodes} nodes"
            )));
        }
        let per_node = total / nodes;
        (0..total)
            .map(|i| {
                let node = NodeId(i / per_node);
                let procs = self.topology.resources_on(node);
                procs.get(i % per_node).copied().ok_or_else(|| {
                    Error::Placement(format!(
                        "node {} has {} resources for {per_node} shards",
                        node.0,
                        procs.len()
                    ))
                })
            })
            .collect()
    }

    /// Fixed resource for the per-node helper: the node's last resource
    pub fn helper_resource(&self, node: NodeId) -> Result<ResourceId> {
        self.topology
            .resources_on(node)
            .last()
            .copied()
            .ok_or_else(|| Error::Placement(format!("node {} has no resources", node.0)))
    }

    /// Resources for the `volume` work-blocks of an index launch by `target`
    ///
    /// Starts at `target` and strides through the node's resources by
    /// `resources / volume` (at least 1), wrapping to the start of the list.
    pub fn slice_targets(&self, target: ResourceId, volume: usize) -> Vec<ResourceId> {
        let procs = self.topology.resources_on(self.topology.resource(target).node);
        if procs.is_empty() || volume == 0 {
            return Vec::new();
        }
        let stride = (procs.len() / volume).max(1);
        let mut idx = procs.iter().position(|&p| p == target).unwrap_or(0);
        let mut targets = Vec::with_capacity(volume);
        while targets.len() < volume {
            targets.push(procs[idx]);
            idx += stride;
            if idx >= procs.len() {
                idx = 0;
            }
        }
        targets
    }

    /// Default mapping of every region of an ordinary task on `target`
    pub fn map_task(&self, task: &TaskInstance, target: ResourceId) -> Vec<RegionMapping> {
        let memory = self.topology.memory_of(target);
        vec![RegionMapping::local(memory); task.regions.len()]
    }

    /// Map a co-scheduled launch
    ///
    /// Assigns every task a resource, maps its regions locally, then makes
    /// every pair of tasks sharing a region agree on one memory. The task
    /// holding the region in its primary slot decides; constraints where
    /// neither side is primary copy that decision afterwards.
    pub fn map_epoch(&self, tasks: &[TaskInstance]) -> Result<EpochMapping> {
        let targets = self.assign_shards(tasks.len())?;
        let mut regions: Vec<Vec<RegionMapping>> = tasks
            .iter()
            .zip(&targets)
            .map(|(task, &target)| self.map_task(task, target))
            .collect();

        let constraints = coscheduling_constraints(tasks);
        let mut decided: BTreeMap<LogicalRegion, MemoryId> = BTreeMap::new();

        for c in &constraints {
            let owner = if c.idx1 == 0 {
                c.t1
            } else if c.idx2 == 0 {
                c.t2
            } else {
                continue;
            };
            let memory = self.topology.memory_of(targets[owner]);
            regions[c.t1][c.idx1].memory = memory;
            regions[c.t2][c.idx2].memory = memory;
            decided.insert(tasks[c.t1].regions[c.idx1], memory);
        }

        for c in constraints.iter().filter(|c| c.idx1 != 0 && c.idx2 != 0) {
            let region = tasks[c.t1].regions[c.idx1];
            let memory = *decided.get(&region).ok_or_else(|| {
                Error::Placement(format!(
                    "region {} shared by tasks {} and {} has no primary owner",
                    region.0, c.t1, c.t2
                ))
            })?;
            regions[c.t1][c.idx1].memory = memory;
            regions[c.t2][c.idx2].memory = memory;
        }

        for (task, target) in tasks.iter().zip(&targets) {
            debug!(task = %task.name, index = task.index, %target, "mapped shard");
        }
        Ok(EpochMapping { targets, regions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: usize, regions: &[usize]) -> TaskInstance {
        TaskInstance {
            index,
            name: format!("spmd{index}"),
            regions: regions.iter().map(|&r| LogicalRegion(r)).collect(),
        }
    }

    #[test]
    fn test_topology_grouping() {
        let topo = Topology::from_resources([(0, Some(0)), (1, Some(1)), (0, Some(2)), (1, Some(3))])
            .unwrap();
        assert_eq!(topo.num_nodes(), 2);
        assert_eq!(topo.resources_on(NodeId(0)), &[ResourceId(0), ResourceId(2)]);
        assert_eq!(topo.resources_on(NodeId(1)), &[ResourceId(1), ResourceId(3)]);
        assert_eq!(topo.memory_of(ResourceId(3)), MemoryId(1));
        assert!(Topology::from_resources([(1, None)]).is_err());
    }

    #[test]
    fn test_assign_shards_blocks_per_node() {
        let topo = Topology::uniform(2, 3).unwrap();
        let policy = PlacementPolicy::new(&topo);
        let targets = policy.assign_shards(4).unwrap();
        assert_eq!(
            targets,
            vec![ResourceId(0), ResourceId(1), ResourceId(3), ResourceId(4)]
        );
        assert!(policy.assign_shards(3).is_err());
        assert!(policy.assign_shards(8).is_err());
    }

    #[test]
    fn test_helper_is_last_resource() {
        let topo = Topology::uniform(2, 3).unwrap();
        let policy = PlacementPolicy::new(&topo);
        assert_eq!(policy.helper_resource(NodeId(0)).unwrap(), ResourceId(2));
        assert_eq!(policy.helper_resource(NodeId(1)).unwrap(), ResourceId(5));
        assert!(policy.helper_resource(NodeId(2)).is_err());
    }

    #[test]
    fn test_slice_targets_stride_and_wrap() {
        let topo = Topology::uniform(1, 8).unwrap();
        let policy = PlacementPolicy::new(&topo);
        let ids = |v: Vec<ResourceId>| v.into_iter().map(|r| r.0).collect::<Vec<_>>();
        assert_eq!(ids(policy.slice_targets(ResourceId(0), 4)), vec![0, 2, 4, 6]);
        assert_eq!(ids(policy.slice_targets(ResourceId(5), 4)), vec![5, 7, 0, 2]);
        assert_eq!(ids(policy.slice_targets(ResourceId(6), 10)), vec![6, 7, 0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_map_task_defaults() {
        let topo = Topology::uniform(2, 2).unwrap();
        let policy = PlacementPolicy::new(&topo);
        let mappings = policy.map_task(&task(0, &[0, 1]), ResourceId(3));
        assert_eq!(mappings.len(), 2);
        for m in mappings {
            assert_eq!(m.memory, MemoryId(1));
            assert!(!m.virtual_map && !m.war_optimization && !m.reduction_list);
            assert_eq!(m.blocking_factor, MAX_BLOCKING_FACTOR);
        }
    }

    #[test]
    fn test_constraints_pair_every_sharer() {
        let tasks = [task(0, &[0, 1]), task(1, &[1, 0, 2]), task(2, &[2, 1])];
        let constraints = coscheduling_constraints(&tasks);
        assert_eq!(constraints.len(), 1 + 3 + 1);
        assert!(constraints.contains(&MappingConstraint { t1: 0, idx1: 1, t2: 2, idx2: 1 }));
    }

    #[test]
    fn test_epoch_agreement_follows_primary_owner() {
        // Three tiles in a row on three nodes; every tile references its
        // neighbors after its own region.
        let topo = Topology::uniform(3, 1).unwrap();
        let policy = PlacementPolicy::new(&topo);
        let tasks = [task(0, &[0, 1]), task(1, &[1, 0, 2]), task(2, &[2, 1])];
        let mapping = policy.map_epoch(&tasks).unwrap();

        assert_eq!(mapping.memory(0, 1), MemoryId(1));
        assert_eq!(mapping.memory(2, 1), MemoryId(1));
        assert_eq!(mapping.memory(1, 1), MemoryId(0));
        assert_eq!(mapping.memory(1, 2), MemoryId(2));
        for t in 0..3 {
            assert_eq!(mapping.memory(t, 0), MemoryId(t));
        }
    }

    #[test]
    fn test_epoch_without_primary_owner_fails() {
        let topo = Topology::uniform(1, 2).unwrap();
        let policy = PlacementPolicy::new(&topo);
        let tasks = [task(0, &[0, 7]), task(1, &[1, 7])];
        assert!(matches!(policy.map_epoch(&tasks), Err(Error::Placement(_))));
    }

    #[test]
    fn test_map_epoch_is_deterministic() {
        let topo = Topology::uniform(2, 4).unwrap();
        let policy = PlacementPolicy::new(&topo);
        let tasks: Vec<_> = (0..4)
            .map(|i| task(i, &[i, (i + 1) % 4, (i + 3) % 4]))
            .collect();
        assert_eq!(policy.map_epoch(&tasks).unwrap(), policy.map_epoch(&tasks).unwrap());
    }
}
