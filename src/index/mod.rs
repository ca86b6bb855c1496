//! Square tiling grid and tile naming.

mod grid;
mod tile;

pub use grid::Grid;
pub use tile::{parse_tile_name, tile_name, TileId, TILE_PREFIX};
