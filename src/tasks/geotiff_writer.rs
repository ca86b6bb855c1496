//! Rasterize the target meshes of many PLY tiles into per-band GeoTIFFs.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ndarray::Array2;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cloud::{AttributeSelection, PointCloud};
use crate::error::{Error, Result};
use crate::index::{parse_tile_name, TileId};
use crate::io::fs::check_dir_exists;
use crate::io::ply::{read_ply, read_vertex_count, PLY_EXTENSION};
use crate::io::raster::{default_raster_writer, GeoTransform, RasterWriter};
use crate::pipeline::{
    base_registry, register_remote_tasks, wrap_phases, NoArgs, Pipeline, PipelineCore,
    RemoteData, RemoteDataPipeline, TaskRegistry,
};

/// EPSG code of the Dutch national grid, assumed when none is given.
pub const DEFAULT_EPSG: u32 = 28992;

const RELATIVE_TOLERANCE: f64 = 1e-5;
const ABSOLUTE_TOLERANCE: f64 = 1e-8;

fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= ABSOLUTE_TOLERANCE + RELATIVE_TOLERANCE * b.abs()
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSplitArgs {
    pub x_sub: usize,
    pub y_sub: usize,
}

fn default_epsg() -> u32 {
    DEFAULT_EPSG
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubregionArgs {
    pub output_handle: String,
    #[serde(default = "default_epsg", alias = "EPSG")]
    pub epsg: u32,
}

/// Pipeline writing one GeoTIFF per band and per sub-region of a set of
/// square PLY tiles sharing the same regular mesh.
pub struct GeotiffWriter {
    core: PipelineCore,
    remote: RemoteData,
    bands: Vec<String>,
    tiles: Vec<(String, TileId)>,
    subregions: Vec<Vec<String>>,
    points_per_tile: usize,
    resolution: [f64; 2],
    writer: Box<dyn RasterWriter>,
}

impl std::fmt::Debug for GeotiffWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeotiffWriter")
            .field("bands", &self.bands)
            .field("tiles", &self.tiles.len())
            .field("subregions", &self.subregions.len())
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

impl GeotiffWriter {
    pub fn new(input_dir: Option<PathBuf>, bands: Vec<String>, label: Option<String>) -> Self {
        let mut writer = Self {
            core: PipelineCore::new(&[
                "parse_point_cloud",
                "data_split",
                "create_subregion_geotiffs",
            ]),
            remote: RemoteData::default(),
            bands,
            tiles: Vec::new(),
            subregions: Vec::new(),
            points_per_tile: 0,
            resolution: [0.0; 2],
            writer: default_raster_writer(),
        };
        if let Some(input_dir) = input_dir {
            writer.remote.set_input_path(input_dir);
        }
        if let Some(label) = label {
            Pipeline::set_label(&mut writer, label);
        }
        writer
    }

    /// Replace the raster backend.
    pub fn with_raster_writer(mut self, writer: Box<dyn RasterWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn points_per_tile(&self) -> usize {
        self.points_per_tile
    }

    /// Mesh spacing along x and y.
    pub fn resolution(&self) -> [f64; 2] {
        self.resolution
    }

    /// File names of the tiles in each sub-region.
    pub fn subregions(&self) -> &[Vec<String>] {
        &self.subregions
    }

    /// List the PLY tiles of the input folder and derive the mesh spacing
    /// from the first one.
    pub fn parse_point_cloud(&mut self) -> Result<()> {
        let input = self.remote.input_path();
        check_dir_exists(&input, true, false)?;

        let mut tiles = Vec::new();
        for entry in std::fs::read_dir(&input)? {
            let path = entry?.path();
            let is_ply = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(PLY_EXTENSION));
            if !path.is_file() || !is_ply {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::InvalidInput(format!("invalid file name: {}", path.display()))
                })?;
            let tile = parse_tile_name(&name).ok_or_else(|| {
                Error::InvalidInput(format!("{} is not named after a tile", name))
            })?;
            tiles.push((name, tile));
        }
        if tiles.is_empty() {
            return Err(Error::NotFound(format!(
                "No PLY file in dir: {}",
                input.display()
            )));
        }
        tiles.sort();
        tracing::info!("{} PLY files found", tiles.len());

        let template = read_ply(&input.join(&tiles[0].0), &AttributeSelection::Only(vec![]))?;
        self.points_per_tile = template.len();
        tracing::info!("No. of points per file: {}", self.points_per_tile);

        let [min_x, min_y, max_x, max_y] = template.bounds().ok_or_else(|| {
            Error::InvalidInput("Tile should have finite extend in X and Y!".to_string())
        })?;
        let delta = [max_x - min_x, max_y - min_y];
        if is_close(delta[0], 0.0) || is_close(delta[1], 0.0) {
            return Err(Error::InvalidInput(
                "Tile should have finite extend in X and Y!".to_string(),
            ));
        }
        let side = (template.len() as f64).sqrt() - 1.0;
        let resolution = [delta[0] / side, delta[1] / side];
        if !(is_close(resolution[0], resolution[1]) && is_close(delta[0], delta[1])) {
            return Err(Error::InvalidInput("Tile read is not square!".to_string()));
        }
        self.resolution = resolution;
        self.tiles = tiles;
        tracing::info!("Resolution: ({}m x {}m)", resolution[0], resolution[1]);
        Ok(())
    }

    /// Group the tiles into `x_sub x y_sub` sub-regions of the tile-index
    /// range. Ranges are half-open, except along the last column and row.
    pub fn data_split(&mut self, args: DataSplitArgs) -> Result<()> {
        if self.tiles.is_empty() {
            return Err(Error::InvalidInput("Input tile list is empty!".to_string()));
        }
        if args.x_sub == 0 || args.y_sub == 0 {
            return Err(Error::InvalidInput(
                "number of sub-regions must be > 0".to_string(),
            ));
        }
        tracing::info!(
            "Splitting data into ({}x{}) sub-regions",
            args.x_sub,
            args.y_sub
        );

        let xs = self.tiles.iter().map(|(_, t)| t.ix);
        let ys = self.tiles.iter().map(|(_, t)| t.iy);
        let (min_x, max_x) = (xs.clone().min().unwrap_or(0), xs.max().unwrap_or(0));
        let (min_y, max_y) = (ys.clone().min().unwrap_or(0), ys.max().unwrap_or(0));
        let sub_range_x = (max_x - min_x + 1) / args.x_sub as u64;
        let sub_range_y = (max_y - min_y + 1) / args.y_sub as u64;

        let axis_contains = |value: u64, min: u64, max: u64, sub_range: u64, k: usize, last: bool| {
            let lower = min + k as u64 * sub_range;
            if last {
                lower <= value && value <= max
            } else {
                lower <= value && value < lower + sub_range
            }
        };

        self.subregions.clear();
        for i in 0..args.x_sub {
            for j in 0..args.y_sub {
                let last_column = i == args.x_sub - 1;
                let last_row = j == args.y_sub - 1;
                let members = self
                    .tiles
                    .iter()
                    .filter(|(_, t)| {
                        axis_contains(t.ix, min_x, max_x, sub_range_x, i, last_column)
                            && axis_contains(t.iy, min_y, max_y, sub_range_y, j, last_row)
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                self.subregions.push(members);
            }
        }
        Ok(())
    }

    /// Write `<handle>_TILE_<nnn>_BAND_<band>.tif` for every non-empty
    /// sub-region and every requested band.
    pub fn create_subregion_geotiffs(&mut self, args: SubregionArgs) -> Result<()> {
        let output = self.remote.output_folder().to_path_buf();
        check_dir_exists(&output, true, false)?;
        let input = self.remote.input_path();

        for (number, files) in self.subregions.iter().enumerate() {
            tracing::info!("Processing sub-region GeoTiff no. {} ...", number);
            tracing::info!("... number of constituent tiles: {}", files.len());
            if files.is_empty() {
                tracing::warn!("No data in sub-region no. {}", number);
                continue;
            }
            let stem = output.join(format!("{}_TILE_{:03}", args.output_handle, number));
            self.write_subregion(&input, files, &stem, args.epsg)?;
            tracing::info!("... processing of sub-region completed.");
        }
        Ok(())
    }

    fn write_subregion(&self, input: &Path, files: &[String], stem: &Path, epsg: u32) -> Result<()> {
        let bands: Vec<String> = self
            .bands
            .iter()
            .filter(|b| b.as_str() != "x" && b.as_str() != "y")
            .cloned()
            .collect();

        let mut cloud = PointCloud::default();
        for (i, file) in files.iter().enumerate() {
            if i % 25 == 0 || i == files.len() - 1 {
                tracing::debug!("... processing tile {} of {}", i + 1, files.len());
            }
            let path = input.join(file);
            let count = read_vertex_count(&path)?;
            if count != self.points_per_tile {
                tracing::warn!(
                    "{} holds {} points, expected {}",
                    file,
                    count,
                    self.points_per_tile
                );
            }
            cloud.append(read_ply(
                &path,
                &AttributeSelection::Only(bands.clone()),
            )?)?;
        }
        for band in &bands {
            cloud.require(band)?;
        }

        let frame = RasterFrame::new(&cloud, self.resolution)?;
        let cells = frame.cells(&cloud)?;
        for band in &bands {
            tracing::debug!("... creating GeoTiff for band {}", band);
            let values = cloud.require(band)?;
            let mut raster = Array2::from_elem((frame.rows, frame.cols), f64::NAN);
            for (&(row, col), &value) in cells.iter().zip(values) {
                raster[[row, col]] = value;
            }
            let mut band_stem = stem.as_os_str().to_os_string();
            band_stem.push(format!("_BAND_{}", band));
            let path = self.writer.write_band(
                Path::new(&band_stem),
                &raster,
                &frame.transform,
                epsg,
                band,
            )?;
            tracing::debug!("... GeoTiff written to {}", path.display());
        }
        Ok(())
    }
}

/// Raster covering a set of mesh points, with points shifted from cell
/// centers to the upper-left cell corners.
struct RasterFrame {
    transform: GeoTransform,
    rows: usize,
    cols: usize,
    resolution: [f64; 2],
}

impl RasterFrame {
    fn new(cloud: &PointCloud, resolution: [f64; 2]) -> Result<Self> {
        let [min_x, min_y, max_x, max_y] = cloud
            .bounds()
            .ok_or_else(|| Error::InvalidInput("Point cloud is empty!".to_string()))?;
        let [x_res, y_res] = resolution;
        let (x_min, y_max) = (min_x - x_res / 2.0, max_y + y_res / 2.0);
        let cols = ((max_x - min_x) / x_res + 1.0).round() as usize;
        let rows = ((max_y - min_y) / y_res + 1.0).round() as usize;
        Ok(Self {
            transform: GeoTransform::north_up(x_min, y_max, x_res, y_res),
            rows,
            cols,
            resolution,
        })
    }

    /// `(row, col)` of every point.
    fn cells(&self, cloud: &PointCloud) -> Result<Vec<(usize, usize)>> {
        let [x_res, y_res] = self.resolution;
        cloud
            .x()
            .iter()
            .zip(cloud.y())
            .map(|(&x, &y)| {
                let col = (x - x_res / 2.0 - self.transform.c) / x_res;
                let row = -(y + y_res / 2.0 - self.transform.f) / y_res;
                let (col_i, row_i) = (col.round(), row.round());
                let on_grid = is_close(col, col_i) && is_close(row, row_i);
                let inside = col_i >= 0.0
                    && row_i >= 0.0
                    && (col_i as usize) < self.cols
                    && (row_i as usize) < self.rows;
                if !(on_grid && inside) {
                    return Err(Error::task(
                        "create_subregion_geotiffs",
                        format!("Geo coding failed for point ({}, {})!", x, y),
                    ));
                }
                Ok((row_i as usize, col_i as usize))
            })
            .collect()
    }
}

impl Pipeline for GeotiffWriter {
    const NAME: &'static str = "GeotiffWriter";

    fn core(&self) -> &PipelineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore {
        &mut self.core
    }

    fn registry() -> &'static TaskRegistry<Self> {
        static REGISTRY: OnceLock<TaskRegistry<GeotiffWriter>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            register_remote_tasks(base_registry::<GeotiffWriter>())
                .register("parse_point_cloud", |p: &mut GeotiffWriter, _: NoArgs| {
                    p.parse_point_cloud()
                })
                .register("data_split", |p: &mut GeotiffWriter, a| p.data_split(a))
                .register("create_subregion_geotiffs", |p: &mut GeotiffWriter, a| {
                    p.create_subregion_geotiffs(a)
                })
        })
    }

    fn phases(sequence: Vec<String>) -> Vec<String> {
        wrap_phases(sequence)
    }

    fn constructor_args(&self) -> Option<Value> {
        Some(json!({
            "input_dir": self.remote.input_path_setting(),
            "bands": self.bands,
        }))
    }
}

impl RemoteDataPipeline for GeotiffWriter {
    fn remote(&self) -> &RemoteData {
        &self.remote
    }

    fn remote_mut(&mut self) -> &mut RemoteData {
        &mut self.remote
    }
}
