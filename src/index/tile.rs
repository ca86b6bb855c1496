//! Tile identifiers and the `tile_<ix>_<iy>` naming convention.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Prefix shared by tile directories and tile file names.
pub const TILE_PREFIX: &str = "tile";

/// Integer tile coordinates in a [`Grid`](super::Grid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub ix: u64,
    pub iy: u64,
}

impl TileId {
    pub fn new(ix: u64, iy: u64) -> Self {
        Self { ix, iy }
    }

    /// Convert grid indices, rejecting the negative ones produced by
    /// points that fall outside the grid.
    pub fn from_index((ix, iy): (i64, i64)) -> Option<Self> {
        Some(Self {
            ix: u64::try_from(ix).ok()?,
            iy: u64::try_from(iy).ok()?,
        })
    }

    /// Grid indices as signed integers.
    pub fn index(&self) -> (i64, i64) {
        (self.ix as i64, self.iy as i64)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", TILE_PREFIX, self.ix, self.iy)
    }
}

impl FromStr for TileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_tile_name(s)
            .ok_or_else(|| Error::InvalidInput(format!("not a tile name: {}", s)))
    }
}

/// Name of tile `(ix, iy)`, e.g. `tile_3_12`.
pub fn tile_name(ix: u64, iy: u64) -> String {
    TileId::new(ix, iy).to_string()
}

/// Parse the tile indices out of a tile name.
///
/// Accepts bare names (`tile_3_12`) and file names that carry an extension
/// (`tile_3_12.ply`). Anything else yields `None`.
pub fn parse_tile_name(name: &str) -> Option<TileId> {
    let stem = name.split('.').next()?;
    let mut parts = stem.split('_');
    if parts.next()? != TILE_PREFIX {
        return None;
    }
    let ix = parts.next()?.parse().ok()?;
    let iy = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(TileId { ix, iy })
}
