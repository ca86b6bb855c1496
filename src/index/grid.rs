//! Regular square tiling grid used to retile point clouds and place targets.

use crate::error::{Error, Result};

/// Relative tolerance used when comparing derived grid quantities.
const RTOL: f64 = 1e-5;
/// Absolute tolerance used when comparing derived grid quantities.
const ATOL: f64 = 1e-8;

fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= ATOL + RTOL * b.abs()
}

/// Square grid of `n_tiles_side x n_tiles_side` tiles.
///
/// A tile is identified by its integer pair `(ix, iy)`; point coordinates are
/// mapped to tiles with `floor((p - grid_min) / tile_width)`, so a point lying
/// exactly on a boundary belongs to the tile whose minimum equals it.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    n_tiles_side: usize,
    is_set: bool,
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 0.0,
            max_y: 0.0,
            n_tiles_side: 1,
            is_set: false,
        }
    }
}

impl Grid {
    /// Create an unconfigured grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and configure a grid in one step.
    pub fn with_extent(
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        n_tiles_side: i64,
    ) -> Result<Self> {
        let mut grid = Self::new();
        grid.setup(min_x, min_y, max_x, max_y, n_tiles_side)?;
        Ok(grid)
    }

    /// Configure the grid extent and the number of tiles per side.
    ///
    /// Calling it again replaces the previous configuration. The grid is left
    /// unset if validation fails.
    pub fn setup(
        &mut self,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        n_tiles_side: i64,
    ) -> Result<()> {
        self.is_set = false;
        if n_tiles_side < 1 {
            return Err(Error::Config(format!(
                "n_tiles_side must be int > 0! Got instead: {}",
                n_tiles_side
            )));
        }
        if ![min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite()) {
            return Err(Error::Config(format!(
                "Grid bounds must be finite: [{}, {}, {}, {}]",
                min_x, min_y, max_x, max_y
            )));
        }

        self.min_x = min_x;
        self.min_y = min_y;
        self.max_x = max_x;
        self.max_y = max_y;
        self.n_tiles_side = n_tiles_side as usize;

        self.check_finite_extent()?;
        self.check_grid_is_square()?;
        self.is_set = true;

        tracing::debug!(
            "Grid set: [{}, {}, {}, {}], {} tiles per side, tile width {}",
            min_x,
            min_y,
            max_x,
            max_y,
            self.n_tiles_side,
            self.tile_width()[0]
        );
        Ok(())
    }

    /// Whether `setup` has succeeded.
    pub fn is_set(&self) -> bool {
        self.is_set
    }

    /// Number of tiles along each direction.
    pub fn n_tiles_side(&self) -> usize {
        self.n_tiles_side
    }

    /// Lower grid boundaries.
    pub fn grid_mins(&self) -> [f64; 2] {
        [self.min_x, self.min_y]
    }

    /// Upper grid boundaries.
    pub fn grid_maxs(&self) -> [f64; 2] {
        [self.max_x, self.max_y]
    }

    /// Width of the grid along X and Y.
    pub fn grid_width(&self) -> [f64; 2] {
        [self.max_x - self.min_x, self.max_y - self.min_y]
    }

    /// Width of a tile along X and Y.
    pub fn tile_width(&self) -> [f64; 2] {
        let width = self.grid_width();
        let n = self.n_tiles_side as f64;
        [width[0] / n, width[1] / n]
    }

    /// Tile indices of a single point.
    ///
    /// Points outside the grid extent produce indices outside
    /// `[0, n_tiles_side)` and a warning, not an error.
    pub fn get_tile_index(&self, px: f64, py: f64) -> Result<(i64, i64)> {
        self.ensure_set()?;
        let index = self.index_of(px, py);
        if !self.is_valid_index(index) {
            self.warn_outside();
        }
        Ok(index)
    }

    /// Tile indices of many points; one warning is emitted if any point
    /// falls outside the grid.
    pub fn get_tile_indices(&self, xs: &[f64], ys: &[f64]) -> Result<Vec<(i64, i64)>> {
        self.ensure_set()?;
        check_same_length(xs, ys)?;
        let indices: Vec<(i64, i64)> = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| self.index_of(x, y))
            .collect();
        if indices.iter().any(|&idx| !self.is_valid_index(idx)) {
            self.warn_outside();
        }
        Ok(indices)
    }

    /// Lower and upper boundaries of tile `(ix, iy)`.
    pub fn get_tile_bounds(&self, ix: i64, iy: i64) -> Result<([f64; 2], [f64; 2])> {
        self.ensure_set()?;
        Ok(self.bounds_of(ix, iy))
    }

    /// Check which points belong to tile `(ix, iy)`.
    ///
    /// Without `precision` a point belongs to the tile iff both of its
    /// indices match. With `precision` a point is accepted when, on every
    /// axis, `tile_min - p <= precision` and `p - tile_max <= precision`.
    pub fn is_point_in_tile(
        &self,
        xs: &[f64],
        ys: &[f64],
        ix: i64,
        iy: i64,
        precision: Option<f64>,
    ) -> Result<Vec<bool>> {
        self.ensure_set()?;
        check_same_length(xs, ys)?;

        match precision {
            None => Ok(self
                .get_tile_indices(xs, ys)?
                .into_iter()
                .map(|(jx, jy)| jx == ix && jy == iy)
                .collect()),
            Some(precision) => {
                if !(precision >= 0.0) {
                    return Err(Error::InvalidInput(format!(
                        "precision must be a non-negative number, got {}",
                        precision
                    )));
                }
                let (mins, maxs) = self.bounds_of(ix, iy);
                Ok(xs
                    .iter()
                    .zip(ys)
                    .map(|(&x, &y)| {
                        mins[0] - x <= precision
                            && x - maxs[0] <= precision
                            && mins[1] - y <= precision
                            && y - maxs[1] <= precision
                    })
                    .collect())
            }
        }
    }

    /// Regular mesh of cell-center points covering tile `(ix, iy)`.
    ///
    /// Returns flattened `(xs, ys)` with Y as the outer loop. The tile width
    /// must be an integer multiple of `mesh_size`.
    pub fn generate_tile_mesh(
        &self,
        ix: i64,
        iy: i64,
        mesh_size: f64,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        self.ensure_set()?;
        if !(mesh_size > 0.0) || !mesh_size.is_finite() {
            return Err(Error::InvalidInput(format!(
                "mesh size must be > 0, got {}",
                mesh_size
            )));
        }

        let tile_width = self.tile_width();
        let mut counts = [0usize; 2];
        for axis in 0..2 {
            let n = tile_width[axis] / mesh_size;
            if !is_close(n, n.round()) {
                return Err(Error::InvalidInput(format!(
                    "The tile width ({}) is not a multiple of the chosen mesh ({})!",
                    tile_width[axis], mesh_size
                )));
            }
            counts[axis] = n.round() as usize;
        }

        let (mins, _) = self.bounds_of(ix, iy);
        let offset = [mins[0] + mesh_size / 2.0, mins[1] + mesh_size / 2.0];

        let total = counts[0] * counts[1];
        let mut xs = Vec::with_capacity(total);
        let mut ys = Vec::with_capacity(total);
        for j in 0..counts[1] {
            let y = offset[1] + j as f64 * mesh_size;
            for i in 0..counts[0] {
                xs.push(offset[0] + i as f64 * mesh_size);
                ys.push(y);
            }
        }
        Ok((xs, ys))
    }

    fn index_of(&self, px: f64, py: f64) -> (i64, i64) {
        let tile_width = self.tile_width();
        let ix = ((px - self.min_x) / tile_width[0]).floor() as i64;
        let iy = ((py - self.min_y) / tile_width[1]).floor() as i64;
        (ix, iy)
    }

    fn bounds_of(&self, ix: i64, iy: i64) -> ([f64; 2], [f64; 2]) {
        let tile_width = self.tile_width();
        let mins = [
            ix as f64 * tile_width[0] + self.min_x,
            iy as f64 * tile_width[1] + self.min_y,
        ];
        let maxs = [mins[0] + tile_width[0], mins[1] + tile_width[1]];
        (mins, maxs)
    }

    fn is_valid_index(&self, (ix, iy): (i64, i64)) -> bool {
        let n = self.n_tiles_side as i64;
        (0..n).contains(&ix) && (0..n).contains(&iy)
    }

    fn warn_outside(&self) {
        tracing::warn!(
            "Points fall outside the bounds Min X={} Y={}, Max X={} Y={}",
            self.min_x,
            self.min_y,
            self.max_x,
            self.max_y
        );
    }

    fn ensure_set(&self) -> Result<()> {
        if self.is_set {
            Ok(())
        } else {
            Err(Error::Config("The grid has not been set!".to_string()))
        }
    }

    fn check_finite_extent(&self) -> Result<()> {
        let width = self.grid_width();
        for (axis, name) in ["x", "y"].iter().enumerate() {
            if is_close(width[axis], 0.0) {
                return Err(Error::Config(format!("Zero grid extent in {}!", name)));
            }
        }
        Ok(())
    }

    fn check_grid_is_square(&self) -> Result<()> {
        let tile_width = self.tile_width();
        if !is_close(tile_width[0], tile_width[1]) {
            return Err(Error::Config(format!(
                "Grid is not square! Width {} vs height {}",
                self.max_x - self.min_x,
                self.max_y - self.min_y
            )));
        }
        Ok(())
    }
}

fn check_same_length(xs: &[f64], ys: &[f64]) -> Result<()> {
    if xs.len() != ys.len() {
        return Err(Error::InvalidInput(format!(
            "x and y coordinates differ in length: {} vs {}",
            xs.len(),
            ys.len()
        )));
    }
    Ok(())
}
