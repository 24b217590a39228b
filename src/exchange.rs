//! Ghost exchange between neighboring tiles
//!
//! Every directed link `A -> B` owns one [`GhostBuffer`] on `B`'s side and one
//! pair of phase barriers. The producer `A` sees the link as an
//! [`OutputPort`], the consumer `B` as an [`InputPort`]:
//!
//! ```text
//!   A (producer)                       B (consumer)
//!   wait  empty@k                      wait  full@k
//!   copy  edge strip -> buffer         copy  buffer -> ghost cells
//!   arrive full@k                      arrive empty@k+1
//! ```
//!
//! `empty@0` is satisfied by the consumer when it opens its port, so the first
//! push never blocks on a buffer that was never used.

use crate::barrier::{BarrierHandle, PhaseBarrier};
use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::partition::GridSpec;
use crate::placement::MemoryId;
use crate::stencil::TileField;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

pub use crate::partition::GhostDirection;

/// Staging buffer for one ghost strip, owned by the consuming tile
#[derive(Debug)]
pub struct GhostBuffer {
    rect: Rect,
    memory: MemoryId,
    data: Mutex<Vec<f64>>,
}

impl GhostBuffer {
    /// Allocate a zeroed buffer for `rect`, placed in `memory`
    pub fn new(rect: Rect, memory: MemoryId) -> Self {
        Self {
            rect,
            memory,
            data: Mutex::new(vec![0.0; rect.volume() as usize]),
        }
    }

    /// Cells the buffer stages, in global coordinates
    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Memory the buffer was placed in
    pub fn memory(&self) -> MemoryId {
        self.memory
    }

    fn fill_from(&self, field: &TileField) {
        let (lo, hi) = (self.rect.lo, self.rect.hi);
        let width = self.rect.width() as usize;
        let mut data = self.data.lock();
        for (row, y) in data.chunks_exact_mut(width).zip(lo.y..=hi.y) {
            row.copy_from_slice(field.input_row(y, lo.x, hi.x));
        }
    }

    fn drain_into(&self, field: &mut TileField) {
        let (lo, hi) = (self.rect.lo, self.rect.hi);
        let width = self.rect.width() as usize;
        let data = self.data.lock();
        for (row, y) in data.chunks_exact(width).zip(lo.y..=hi.y) {
            field.input_row_mut(y, lo.x, hi.x).copy_from_slice(row);
        }
    }
}

/// The producer's view of a link
#[derive(Debug)]
pub struct OutputPort {
    direction: GhostDirection,
    buffer: Arc<GhostBuffer>,
    full: BarrierHandle,
    empty: BarrierHandle,
}

impl OutputPort {
    /// Direction of the consumer as seen from the producer
    pub fn direction(&self) -> GhostDirection {
        self.direction
    }

    /// Buffer this port writes into
    pub fn buffer(&self) -> &GhostBuffer {
        &self.buffer
    }

    /// Phase of the next push
    pub fn phase(&self) -> u64 {
        self.full.phase()
    }

    /// Copy the producer's edge strip into the neighbor's buffer
    ///
    /// Blocks until the consumer has released the buffer for this phase.
    pub fn push(&self, field: &TileField) {
        self.empty.wait();
        self.buffer.fill_from(field);
        trace!(direction = ?self.direction, phase = self.full.phase(), "ghost pushed");
        self.full.arrive();
    }

    /// Move on to the next iteration's phases
    pub fn advance(&mut self) {
        self.full = self.full.advance();
        self.empty = self.empty.advance();
    }
}

/// The consumer's view of a link
#[derive(Debug)]
pub struct InputPort {
    side: GhostDirection,
    buffer: Arc<GhostBuffer>,
    full: BarrierHandle,
    empty: BarrierHandle,
    open: bool,
}

impl InputPort {
    /// Side of the consumer tile the ghost strip lies on
    pub fn side(&self) -> GhostDirection {
        self.side
    }

    /// Buffer this port reads from
    pub fn buffer(&self) -> &GhostBuffer {
        &self.buffer
    }

    /// Declare the buffer free for the first push
    pub fn open(&mut self) {
        if self.open {
            return;
        }
        self.empty.arrive();
        self.empty = self.empty.advance();
        self.open = true;
    }

    /// Copy the staged strip into the consumer's ghost cells
    ///
    /// Blocks until the producer has filled the buffer for this phase, then
    /// releases the buffer for the next one.
    ///
    /// # Panics
    ///
    /// Panics if the port was never opened.
    pub fn pull(&self, field: &mut TileField) {
        assert!(self.open, "ghost port {:?} pulled before it was opened", self.side);
        self.full.wait();
        self.buffer.drain_into(field);
        trace!(side = ?self.side, phase = self.full.phase(), "ghost pulled");
        self.empty.arrive();
    }

    /// Move on to the next iteration's phases
    pub fn advance(&mut self) {
        self.full = self.full.advance();
        self.empty = self.empty.advance();
    }
}

/// All exchange ports of one tile
#[derive(Debug, Default)]
pub struct ExchangePorts {
    outputs: Vec<OutputPort>,
    inputs: Vec<InputPort>,
}

impl ExchangePorts {
    /// Ports sending to neighbors, in direction order
    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    /// Ports receiving from neighbors, in direction order
    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    /// Whether a ghost strip arrives on `side`
    pub fn has_input(&self, side: GhostDirection) -> bool {
        self.inputs.iter().any(|p| p.side == side)
    }

    /// Open every input port
    pub fn open(&mut self) {
        self.inputs.iter_mut().for_each(InputPort::open);
    }

    /// Push every edge strip
    pub fn push_all(&self, field: &TileField) {
        for port in &self.outputs {
            port.push(field);
        }
    }

    /// Pull every ghost strip
    pub fn pull_all(&self, field: &mut TileField) {
        for port in &self.inputs {
            port.pull(field);
        }
    }

    /// Advance every port to the next iteration
    pub fn advance(&mut self) {
        self.outputs.iter_mut().for_each(OutputPort::advance);
        self.inputs.iter_mut().for_each(InputPort::advance);
    }
}

/// Build every link of the tile grid
///
/// Returns the ports of each tile in shard order. `memory_of(tile)` names the
/// memory the consuming tile's buffers are placed in.
pub fn build_exchange(
    spec: &GridSpec,
    memory_of: impl Fn(usize) -> MemoryId,
) -> Result<Vec<ExchangePorts>> {
    let mut ports: Vec<ExchangePorts> = (0..spec.num_tiles()).map(|_| ExchangePorts::default()).collect();

    for producer in spec.tiles() {
        for direction in GhostDirection::ALL {
            let Some(consumer_id) = producer.neighbor(direction) else {
                continue;
            };
            let consumer = spec.tile(consumer_id)?;
            let side = direction.flip();
            let rect = consumer.ghost_rect(side).ok_or_else(|| {
                Error::Partition(format!(
                    "tile {} has no {side:?} ghost strip facing tile {}",
                    consumer.index(),
                    producer.index()
                ))
            })?;

            let (from, to) = (producer.index(), consumer.index());
            let buffer = Arc::new(GhostBuffer::new(rect, memory_of(to)));
            let full = PhaseBarrier::create(format!("full {from}->{to}"), 1);
            let empty = PhaseBarrier::create(format!("empty {from}->{to}"), 1);
            debug!(from, to, ?direction, %rect, memory = %buffer.memory(), "ghost link");

            ports[from].outputs.push(OutputPort {
                direction,
                buffer: Arc::clone(&buffer),
                full: full.clone(),
                empty: empty.clone(),
            });
            ports[to].inputs.push(InputPort {
                side,
                buffer,
                full,
                empty,
                open: false,
            });
        }
    }

    for p in &mut ports {
        p.inputs.sort_by_key(|port| port.side);
    }
    Ok(ports)
}
