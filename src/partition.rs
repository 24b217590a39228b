//! Grid partitioning: tiles, halos, sectors and balanced work-blocks
//!
//! Everything here is a pure function of the grid parameters. The SPMD
//! coordinator consumes the descriptors to build its local partitions and
//! the placement policy uses the tile numbering to assign shards.
//!
//! ```text
//!            UP ghost
//!        ┌──┬────────┬──┐
//!        │LU│   UP   │UR│
//!  LEFT  ├──┼────────┼──┤  RIGHT
//!  ghost │L │INTERIOR│ R│  ghost
//!        ├──┼────────┼──┤
//!        │DL│  DOWN  │RD│
//!        └──┴────────┴──┘
//!           DOWN ghost
//! ```

use crate::error::{Error, Result};
use crate::geometry::{Coord, Rect};
use tracing::debug;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Cardinal direction of a ghost strip or of a neighboring tile
///
/// `Up` is towards smaller `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum GhostDirection {
    /// Towards smaller `x`
    Left = 0,
    /// Towards smaller `y`
    Up = 1,
    /// Towards larger `x`
    Right = 2,
    /// Towards larger `y`
    Down = 3,
}

impl GhostDirection {
    /// All directions in exchange order
    pub const ALL: [GhostDirection; 4] = [
        GhostDirection::Left,
        GhostDirection::Up,
        GhostDirection::Right,
        GhostDirection::Down,
    ];

    /// Position in [`GhostDirection::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Tile-grid offset of the neighbor in this direction
    pub fn offset(self) -> (Coord, Coord) {
        match self {
            GhostDirection::Left => (-1, 0),
            GhostDirection::Up => (0, -1),
            GhostDirection::Right => (1, 0),
            GhostDirection::Down => (0, 1),
        }
    }

    /// The same link seen from the neighbor's side
    pub fn flip(self) -> GhostDirection {
        Self::ALL[(self.index() + 2) % 4]
    }
}

/// One of the nine disjoint regions of a tile's private box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum Sector {
    /// Left edge band
    Left = 0,
    /// Upper-left corner
    LeftUp = 1,
    /// Upper edge band
    Up = 2,
    /// Upper-right corner
    UpRight = 3,
    /// Right edge band
    Right = 4,
    /// Lower-right corner
    RightDown = 5,
    /// Lower edge band
    Down = 6,
    /// Lower-left corner
    DownLeft = 7,
    /// Everything not within `R` of a neighboring tile
    Interior = 8,
}

/// Which slice of an axis a sector covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Low,
    Mid,
    High,
}

impl Sector {
    /// The eight perimeter sectors in compass order
    pub const BOUNDARY: [Sector; 8] = [
        Sector::Left,
        Sector::LeftUp,
        Sector::Up,
        Sector::UpRight,
        Sector::Right,
        Sector::RightDown,
        Sector::Down,
        Sector::DownLeft,
    ];

    /// All nine sectors, perimeter first
    pub const ALL: [Sector; 9] = [
        Sector::Left,
        Sector::LeftUp,
        Sector::Up,
        Sector::UpRight,
        Sector::Right,
        Sector::RightDown,
        Sector::Down,
        Sector::DownLeft,
        Sector::Interior,
    ];

    /// Ghost strips a perimeter sector reads from
    ///
    /// Edge sectors read one strip, corner sectors the two adjacent ones.
    /// The interior reads none.
    pub fn ghost_dependencies(self) -> &'static [GhostDirection] {
        use GhostDirection::*;
        match self {
            Sector::Left => &[Left],
            Sector::LeftUp => &[Left, Up],
            Sector::Up => &[Up],
            Sector::UpRight => &[Up, Right],
            Sector::Right => &[Right],
            Sector::RightDown => &[Right, Down],
            Sector::Down => &[Down],
            Sector::DownLeft => &[Down, Left],
            Sector::Interior => &[],
        }
    }

    /// (x band, y band) covered by the sector
    fn bands(self) -> (Band, Band) {
        use Band::*;
        match self {
            Sector::Left => (Low, Mid),
            Sector::LeftUp => (Low, Low),
            Sector::Up => (Mid, Low),
            Sector::UpRight => (High, Low),
            Sector::Right => (High, Mid),
            Sector::RightDown => (High, High),
            Sector::Down => (Mid, High),
            Sector::DownLeft => (Low, High),
            Sector::Interior => (Mid, Mid),
        }
    }
}

/// Immutable description of the decomposed grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct GridSpec {
    n: Coord,
    radius: Coord,
    tiles_x: Coord,
    tiles_y: Coord,
}

impl GridSpec {
    /// Describe an `n × n` grid split into `tiles_x × tiles_y` tiles
    ///
    /// Fails with a configuration error if the grid does not divide evenly,
    /// the stencil does not fit, or some tile would have an empty interior.
    pub fn new(n: Coord, radius: Coord, tiles_x: Coord, tiles_y: Coord) -> Result<Self> {
        if n <= 0 {
            return Err(Error::InvalidConfig(format!(
                "Matrix Order must be greater than 0 : {n}"
            )));
        }
        if tiles_x <= 0 || tiles_y <= 0 {
            return Err(Error::InvalidConfig(format!(
                "tile grid must be positive: {tiles_x}x{tiles_y}"
            )));
        }
        if n % tiles_x != 0 {
            return Err(Error::InvalidConfig(format!(
                "n%Num_procsx should be zero (n={n}, Num_procsx={tiles_x})"
            )));
        }
        if n % tiles_y != 0 {
            return Err(Error::InvalidConfig(format!(
                "n%Num_procsy should be zero (n={n}, Num_procsy={tiles_y})"
            )));
        }
        if radius < 1 {
            return Err(Error::InvalidConfig(format!(
                "Stencil radius {radius} should be positive"
            )));
        }
        if 2 * radius + 1 > n {
            return Err(Error::InvalidConfig(format!(
                "Stencil radius {radius} exceeds grid size {n}"
            )));
        }

        let spec = Self {
            n,
            radius,
            tiles_x,
            tiles_y,
        };
        for (tiles, extent) in [(tiles_x, spec.tile_width()), (tiles_y, spec.tile_height())] {
            let shrink = radius * (tiles - 1).min(2);
            if extent - shrink < 1 {
                return Err(Error::InvalidConfig(format!(
                    "tile extent {extent} too small for stencil radius {radius} on a {tiles}-tile axis"
                )));
            }
        }
        Ok(spec)
    }

    /// Describe the grid for `ranks` shards using the near-square factoring
    pub fn for_ranks(n: Coord, radius: Coord, ranks: Coord) -> Result<Self> {
        if ranks <= 0 {
            return Err(Error::InvalidConfig(format!(
                "number of shards must be positive: {ranks}"
            )));
        }
        let (tiles_x, tiles_y) = tile_grid(ranks);
        Self::new(n, radius, tiles_x, tiles_y)
    }

    /// Global grid extent
    pub fn n(&self) -> Coord {
        self.n
    }

    /// Stencil radius
    pub fn radius(&self) -> Coord {
        self.radius
    }

    /// Tiles along `x`
    pub fn tiles_x(&self) -> Coord {
        self.tiles_x
    }

    /// Tiles along `y`
    pub fn tiles_y(&self) -> Coord {
        self.tiles_y
    }

    /// Total number of tiles (one shard each)
    pub fn num_tiles(&self) -> usize {
        (self.tiles_x * self.tiles_y) as usize
    }

    /// Private width of every tile
    pub fn tile_width(&self) -> Coord {
        self.n / self.tiles_x
    }

    /// Private height of every tile
    pub fn tile_height(&self) -> Coord {
        self.n / self.tiles_y
    }

    /// The whole grid
    pub fn global_box(&self) -> Rect {
        Rect::from_coords(0, 0, self.n - 1, self.n - 1)
    }

    /// Tile identifier for a linear shard index
    pub fn tile_id(&self, index: usize) -> TileId {
        let index = index as Coord;
        TileId::new(index % self.tiles_x, index / self.tiles_x)
    }

    /// Linear shard index of a tile (row-major over the tile grid)
    pub fn linear_index(&self, id: TileId) -> usize {
        (id.y * self.tiles_x + id.x) as usize
    }

    /// Whether `id` is inside the tile grid
    pub fn contains_tile(&self, id: TileId) -> bool {
        id.x >= 0 && id.y >= 0 && id.x < self.tiles_x && id.y < self.tiles_y
    }

    /// Neighbor of `id` in direction `dir`, if one exists
    pub fn neighbor(&self, id: TileId, dir: GhostDirection) -> Option<TileId> {
        let (dx, dy) = dir.offset();
        let neighbor = TileId::new(id.x + dx, id.y + dy);
        self.contains_tile(neighbor).then_some(neighbor)
    }

    /// Descriptor of one tile
    pub fn tile(&self, id: TileId) -> Result<Tile> {
        if !self.contains_tile(id) {
            return Err(Error::Partition(format!(
                "tile ({}, {}) outside {}x{} tile grid",
                id.x, id.y, self.tiles_x, self.tiles_y
            )));
        }
        Ok(Tile::at(self, id))
    }

    /// All tiles in shard order
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.num_tiles()).map(move |i| Tile::at(self, self.tile_id(i)))
    }
}

/// Near-square factoring of `ranks` into a `Px × Py` tile grid
///
/// `Px` is the largest divisor of `ranks` not exceeding `⌊√(ranks + 1)⌋`.
pub fn tile_grid(ranks: Coord) -> (Coord, Coord) {
    let mut px = ((ranks + 1) as f64).sqrt() as Coord;
    while px > 0 {
        if ranks % px == 0 {
            return (px, ranks / px);
        }
        px -= 1;
    }
    (1, ranks.max(1))
}

/// Integer coordinates of a tile in the tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct TileId {
    /// Column in the tile grid
    pub x: Coord,
    /// Row in the tile grid
    pub y: Coord,
}

impl TileId {
    /// Create a tile id
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }
}

/// A tile: private box plus its halo-extended bounding box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    spec: GridSpec,
    id: TileId,
    private: Rect,
    halo: Rect,
}

impl Tile {
    fn at(spec: &GridSpec, id: TileId) -> Tile {
        let (w, h, r, n) = (spec.tile_width(), spec.tile_height(), spec.radius, spec.n);
        Tile {
            spec: *spec,
            id,
            private: Rect::from_coords(id.x * w, id.y * h, (id.x + 1) * w - 1, (id.y + 1) * h - 1),
            halo: Rect::from_coords(
                (id.x * w - r).max(0),
                (id.y * h - r).max(0),
                ((id.x + 1) * w + r).min(n) - 1,
                ((id.y + 1) * h + r).min(n) - 1,
            ),
        }
    }

    /// Tile coordinates
    pub fn id(&self) -> TileId {
        self.id
    }

    /// Grid this tile belongs to
    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    /// Linear shard index
    pub fn index(&self) -> usize {
        self.spec.linear_index(self.id)
    }

    /// Cells owned by this tile
    pub fn private_box(&self) -> Rect {
        self.private
    }

    /// Private box extended by `R`, clipped at the global edges
    pub fn halo_box(&self) -> Rect {
        self.halo
    }

    /// Whether a neighbor exists in `dir`
    pub fn has_neighbor(&self, dir: GhostDirection) -> bool {
        self.spec.neighbor(self.id, dir).is_some()
    }

    /// The neighbor in `dir`, if any
    pub fn neighbor(&self, dir: GhostDirection) -> Option<TileId> {
        self.spec.neighbor(self.id, dir)
    }

    /// Ghost strip on side `dir`: `R` wide, spanning the private rows or columns
    ///
    /// Corners are never part of a ghost strip; the star stencil does not
    /// read them.
    pub fn ghost_rect(&self, dir: GhostDirection) -> Option<Rect> {
        if !self.has_neighbor(dir) {
            return None;
        }
        let (p, h) = (self.private, self.halo);
        let rect = match dir {
            GhostDirection::Left => Rect::from_coords(h.lo.x, p.lo.y, p.lo.x - 1, p.hi.y),
            GhostDirection::Up => Rect::from_coords(p.lo.x, h.lo.y, p.hi.x, p.lo.y - 1),
            GhostDirection::Right => Rect::from_coords(p.hi.x + 1, p.lo.y, h.hi.x, p.hi.y),
            GhostDirection::Down => Rect::from_coords(p.lo.x, p.hi.y + 1, p.hi.x, h.hi.y),
        };
        Some(rect)
    }

    /// Private cells this tile sends to its neighbor in `dir`
    ///
    /// Equal to the neighbor's ghost strip facing back at this tile.
    pub fn edge_strip(&self, dir: GhostDirection) -> Option<Rect> {
        let neighbor = Tile::at(&self.spec, self.neighbor(dir)?);
        neighbor.ghost_rect(dir.flip())
    }

    /// Private box shrunk by `R` on every side that faces a neighbor
    pub fn interior_box(&self) -> Rect {
        interior_box(self.private, self.spec.n, self.spec.radius)
    }

    /// Existing sectors of this tile
    pub fn sectors(&self) -> Vec<(Sector, Rect)> {
        describe_sectors(self.private, self.spec.n, self.spec.radius)
    }

    /// Halo partition: the four ghost strips that exist plus the private box
    pub fn halo_pieces(&self) -> (Vec<(GhostDirection, Rect)>, Rect) {
        let ghosts = GhostDirection::ALL
            .iter()
            .filter_map(|&dir| self.ghost_rect(dir).map(|r| (dir, r)))
            .collect();
        (ghosts, self.private)
    }
}

/// Shrink `private` by `radius` on every axis end not on the global boundary
pub fn interior_box(private: Rect, n: Coord, radius: Coord) -> Rect {
    let mut interior = private;
    if interior.lo.x != 0 {
        interior.lo.x += radius;
    }
    if interior.lo.y != 0 {
        interior.lo.y += radius;
    }
    if interior.hi.x != n - 1 {
        interior.hi.x -= radius;
    }
    if interior.hi.y != n - 1 {
        interior.hi.y -= radius;
    }
    interior
}

/// Split a tile's private box into its existing sectors
///
/// Each perimeter sector combines one of three bands per axis: the strip
/// between the private edge and the interior edge (low/high) or the interior
/// span (mid). A sector exists iff both of its bands are non-empty, so a
/// corner exists only when both adjacent edge sectors do. The interior is
/// always listed last.
pub fn describe_sectors(private: Rect, n: Coord, radius: Coord) -> Vec<(Sector, Rect)> {
    let interior = interior_box(private, n, radius);
    let x_band = |band: Band| match band {
        Band::Low => (private.lo.x, interior.lo.x - 1),
        Band::Mid => (interior.lo.x, interior.hi.x),
        Band::High => (interior.hi.x + 1, private.hi.x),
    };
    let y_band = |band: Band| match band {
        Band::Low => (private.lo.y, interior.lo.y - 1),
        Band::Mid => (interior.lo.y, interior.hi.y),
        Band::High => (interior.hi.y + 1, private.hi.y),
    };

    let sectors: Vec<(Sector, Rect)> = Sector::ALL
        .iter()
        .filter_map(|&sector| {
            let (bx, by) = sector.bands();
            let ((lo_x, hi_x), (lo_y, hi_y)) = (x_band(bx), y_band(by));
            let rect = Rect::from_coords(lo_x, lo_y, hi_x, hi_y);
            (!rect.is_empty()).then_some((sector, rect))
        })
        .collect();

    for (sector, rect) in &sectors {
        debug!(?sector, %rect, "sector");
    }
    sectors
}

/// Row counts of a balanced split: the first `size % workers` get one extra
pub fn balanced_sizes(size: Coord, workers: usize) -> Result<Vec<Coord>> {
    if workers == 0 {
        return Err(Error::Partition("cannot split across zero workers".to_string()));
    }
    if workers as Coord > size {
        return Err(Error::Partition(format!(
            "cannot split {size} rows across {workers} workers"
        )));
    }
    let base = size / workers as Coord;
    let remainder = (size % workers as Coord) as usize;
    Ok((0..workers)
        .map(|i| base + Coord::from(i < remainder))
        .collect())
}

/// Split `rect` into `workers` contiguous row-bands in increasing `y`
pub fn balanced_split(rect: Rect, workers: usize) -> Result<Vec<Rect>> {
    let sizes = balanced_sizes(rect.height(), workers)?;
    let mut start_y = rect.lo.y;
    let blocks = sizes
        .into_iter()
        .map(|rows| {
            let block = Rect::from_coords(rect.lo.x, start_y, rect.hi.x, start_y + rows - 1);
            start_y += rows;
            block
        })
        .collect();
    Ok(blocks)
}

/// Verify that `pieces` lie inside `parent` and do not overlap
///
/// With `complete`, also verify that they cover `parent` exactly.
pub fn check_tiling(parent: Rect, pieces: &[Rect], complete: bool) -> Result<()> {
    for (i, piece) in pieces.iter().enumerate() {
        if !parent.contains(piece) {
            return Err(Error::Partition(format!("piece {piece} escapes {parent}")));
        }
        for other in &pieces[i + 1..] {
            if piece.overlaps(other) {
                return Err(Error::Partition(format!("pieces {piece} and {other} overlap")));
            }
        }
    }
    if complete {
        let covered: u64 = pieces.iter().map(Rect::volume).sum();
        if covered != parent.volume() {
            return Err(Error::Partition(format!(
                "pieces cover {covered} of {} cells in {parent}",
                parent.volume()
            )));
        }
    }
    Ok(())
}
