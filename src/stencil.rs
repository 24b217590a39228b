//! Star stencil kernel and per-tile field storage
//!
//! A [`TileField`] holds the `IN` and `OUT` fields of one tile over its halo
//! box in row-major order. Parallel work-blocks operate on disjoint row bands
//! obtained with [`split_row_bands`].

use crate::error::{Error, Result};
use crate::geometry::{Coord, Rect};

/// Coefficient of `x` in the synthetic initial field
pub const COEFX: f64 = 1.0;

/// Coefficient of `y` in the synthetic initial field
pub const COEFY: f64 = 1.0;

/// Validation threshold on the accumulated error
pub const EPSILON: f64 = 1.0e-8;

/// Weights of a radius-`R` star stencil
///
/// Only the two axes carry weight; the weight at offset `k ≠ 0` is
/// `1 / (2kR)`, so the stencil of a linear field `ax + by` is `a + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights {
    radius: Coord,
    values: Vec<f64>,
}

impl Weights {
    /// Build the star weights for `radius`
    pub fn star(radius: Coord) -> Self {
        let side = (2 * radius + 1) as usize;
        let mut values = vec![0.0; side * side];
        for k in (-radius..=radius).filter(|&k| k != 0) {
            let w = 1.0 / (2.0 * k as f64 * radius as f64);
            values[Self::slot(radius, k, 0)] = w;
            values[Self::slot(radius, 0, k)] = w;
        }
        Self { radius, values }
    }

    fn slot(radius: Coord, dx: Coord, dy: Coord) -> usize {
        ((dy + radius) * (2 * radius + 1) + (dx + radius)) as usize
    }

    /// Stencil radius
    pub fn radius(&self) -> Coord {
        self.radius
    }

    /// Weight at offset `(dx, dy)`
    pub fn at(&self, dx: Coord, dy: Coord) -> f64 {
        self.values[Self::slot(self.radius, dx, dy)]
    }

    /// Accumulate the stencil of `input` into `out` over `rect`
    ///
    /// `input` covers `field`; `out` holds whole rows of `field` starting at
    /// row `out_first_row`. Cells within `R` of the global boundary are
    /// skipped.
    pub fn apply(
        &self,
        field: Rect,
        input: &[f64],
        out: &mut [f64],
        out_first_row: Coord,
        rect: Rect,
        n: Coord,
    ) {
        let r = self.radius;
        let stride = field.width();
        let clipped = Rect::from_coords(
            rect.lo.x.max(r),
            rect.lo.y.max(r),
            rect.hi.x.min(n - 1 - r),
            rect.hi.y.min(n - 1 - r),
        );
        if clipped.is_empty() {
            return;
        }
        let at = |x: Coord, y: Coord| ((y - field.lo.y) * stride + (x - field.lo.x)) as usize;

        for y in clipped.lo.y..=clipped.hi.y {
            for x in clipped.lo.x..=clipped.hi.x {
                let mut acc = 0.0;
                for dy in -r..=r {
                    acc += self.at(0, dy) * input[at(x, y + dy)];
                }
                for dx in (-r..0).chain(1..=r) {
                    acc += self.at(dx, 0) * input[at(x + dx, y)];
                }
                out[((y - out_first_row) * stride + (x - field.lo.x)) as usize] += acc;
            }
        }
    }
}

/// Floating-point operations per iteration over the active region
pub fn flops_per_iteration(n: Coord, radius: Coord) -> f64 {
    let stencil_size = 4 * radius + 1;
    let active_points = ((n - 2 * radius) * (n - 2 * radius)) as f64;
    (2 * stencil_size + 1) as f64 * active_points
}

/// Value every checked cell holds after `iterations` steps
pub fn expected_value(iterations: usize) -> f64 {
    iterations as f64 * (COEFX + COEFY)
}

/// `IN` and `OUT` of one tile over its halo box
#[derive(Debug, Clone)]
pub struct TileField {
    rect: Rect,
    input: Vec<f64>,
    output: Vec<f64>,
}

impl TileField {
    /// Allocate zeroed fields over `rect`
    pub fn new(rect: Rect) -> Self {
        let len = rect.volume() as usize;
        Self {
            rect,
            input: vec![0.0; len],
            output: vec![0.0; len],
        }
    }

    /// Box covered by the field
    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Row stride
    pub fn stride(&self) -> usize {
        self.rect.width() as usize
    }

    fn offset(&self, x: Coord, y: Coord) -> usize {
        debug_assert!(self.rect.contains_point(crate::geometry::Point::new(x, y)));
        ((y - self.rect.lo.y) * self.rect.width() + (x - self.rect.lo.x)) as usize
    }

    /// `IN` at a global coordinate
    pub fn input_at(&self, x: Coord, y: Coord) -> f64 {
        self.input[self.offset(x, y)]
    }

    /// `OUT` at a global coordinate
    pub fn output_at(&self, x: Coord, y: Coord) -> f64 {
        self.output[self.offset(x, y)]
    }

    /// Whole `IN` buffer
    pub fn input(&self) -> &[f64] {
        &self.input
    }

    /// Whole `OUT` buffer
    pub fn output(&self) -> &[f64] {
        &self.output
    }

    /// Borrow `IN` for reading and `OUT` for writing at the same time
    pub fn split_mut(&mut self) -> (&[f64], &mut [f64]) {
        (&self.input, &mut self.output)
    }

    /// Borrow both fields mutably
    pub fn fields_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.input, &mut self.output)
    }

    /// Row `y` of `IN` restricted to columns `[lo_x, hi_x]`
    pub fn input_row(&self, y: Coord, lo_x: Coord, hi_x: Coord) -> &[f64] {
        let start = self.offset(lo_x, y);
        &self.input[start..start + (hi_x - lo_x + 1) as usize]
    }

    /// Mutable row `y` of `IN` restricted to columns `[lo_x, hi_x]`
    pub fn input_row_mut(&mut self, y: Coord, lo_x: Coord, hi_x: Coord) -> &mut [f64] {
        let start = self.offset(lo_x, y);
        &mut self.input[start..start + (hi_x - lo_x + 1) as usize]
    }
}

/// A contiguous run of whole field rows handed to one work-block
#[derive(Debug)]
pub struct RowBand<'a> {
    /// Cells the block is responsible for
    pub block: Rect,
    /// First global row held in `rows`
    pub first_row: Coord,
    /// Whole rows `first_row ..= block.hi.y` of the field
    pub rows: &'a mut [f64],
}

/// Split a field buffer into disjoint row bands, one per block
///
/// Blocks must be listed in increasing `y` without sharing rows.
pub fn split_row_bands<'a>(
    data: &'a mut [f64],
    field: Rect,
    blocks: &[Rect],
) -> Result<Vec<RowBand<'a>>> {
    let stride = field.width() as usize;
    let mut rest = data;
    let mut next_row = field.lo.y;
    let mut bands = Vec::with_capacity(blocks.len());

    for block in blocks {
        if block.lo.y < next_row || block.hi.y > field.hi.y || !field.contains(block) {
            return Err(Error::Partition(format!(
                "block {block} is not a fresh row band of {field}"
            )));
        }
        let skip = (block.lo.y - next_row) as usize * stride;
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(skip);
        let (rows, tail) = tail.split_at_mut(block.height() as usize * stride);
        bands.push(RowBand {
            block: *block,
            first_row: block.lo.y,
            rows,
        });
        rest = tail;
        next_row = block.hi.y + 1;
    }
    Ok(bands)
}

/// Write the synthetic linear field into `IN` and clear `OUT` for one block
pub fn initialize_block(field: Rect, input: &mut RowBand<'_>, output: &mut RowBand<'_>) {
    let stride = field.width();
    let block = input.block;
    for y in block.lo.y..=block.hi.y {
        for x in block.lo.x..=block.hi.x {
            let i = ((y - input.first_row) * stride + (x - field.lo.x)) as usize;
            input.rows[i] = COEFY * y as f64 + COEFX * x as f64;
            output.rows[i] = 0.0;
        }
    }
}

/// Add 1 to every `IN` cell of the block
pub fn increment_block(field: Rect, input: &mut RowBand<'_>) {
    let stride = field.width();
    let block = input.block;
    for y in block.lo.y..=block.hi.y {
        let row = ((y - input.first_row) * stride) as usize;
        let lo = row + (block.lo.x - field.lo.x) as usize;
        let hi = row + (block.hi.x - field.lo.x) as usize;
        for value in &mut input.rows[lo..=hi] {
            *value += 1.0;
        }
    }
}

/// Sum of `|OUT - expected|` over the block's cells at least `R` from every
/// global edge
pub fn check_block(
    field: Rect,
    output: &[f64],
    block: Rect,
    n: Coord,
    radius: Coord,
    iterations: usize,
) -> f64 {
    let stride = field.width();
    let norm = expected_value(iterations);
    let mut abserr = 0.0;
    for y in block.lo.y.max(radius)..=block.hi.y.min(n - 1 - radius) {
        for x in block.lo.x.max(radius)..=block.hi.x.min(n - 1 - radius) {
            let value = output[((y - field.lo.y) * stride + (x - field.lo.x)) as usize];
            abserr += (value - norm).abs();
        }
    }
    abserr
}
