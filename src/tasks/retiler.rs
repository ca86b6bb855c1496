//! Split a point-cloud file into the tiles of a regular grid.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::GridArgs;
use crate::error::{Error, Result};
use crate::index::{Grid, TileId, TILE_PREFIX};
use crate::io::fs::{check_dir_exists, check_file_exists};
use crate::io::las::read_info;
use crate::io::splitter::{CellLayout, Splitter};
use crate::pipeline::{
    base_registry, register_remote_tasks, wrap_phases, Pipeline, PipelineCore, RemoteData,
    RemoteDataPipeline, TaskRegistry,
};

/// Audit record of one retiled file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetileRecord {
    pub file: String,
    pub redistributed_to: Vec<String>,
    pub validated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitArgs {
    #[serde(default)]
    pub splitter: Splitter,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateArgs {
    #[serde(default = "default_true")]
    pub write_record_to_file: bool,
}

/// Pipeline that splits one LAS/LAZ file on a grid and moves the pieces to
/// per-tile folders of the output folder.
#[derive(Debug)]
pub struct Retiler {
    core: PipelineCore,
    remote: RemoteData,
    grid: Grid,
    record: Option<RetileRecord>,
}

impl Retiler {
    pub fn new(input_file: Option<PathBuf>, label: Option<String>) -> Self {
        let mut retiler = Self {
            core: PipelineCore::new(&["set_grid", "split_and_redistribute", "validate"]),
            remote: RemoteData::default(),
            grid: Grid::new(),
            record: None,
        };
        if let Some(input_file) = input_file {
            retiler.remote.set_input_path(input_file);
        }
        if let Some(label) = label {
            Pipeline::set_label(&mut retiler, label);
        }
        retiler
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Record produced by the last validation.
    pub fn record(&self) -> Option<&RetileRecord> {
        self.record.as_ref()
    }

    pub fn set_grid(&mut self, args: GridArgs) -> Result<()> {
        tracing::info!("Setting up the target grid");
        self.grid
            .setup(args.min_x, args.min_y, args.max_x, args.max_y, args.n_tiles_side)
    }

    /// Split the input file and move each piece into the folder of the tile
    /// holding the center of its bounds.
    pub fn split_and_redistribute(&mut self, args: SplitArgs) -> Result<()> {
        let input = self.check_input()?;
        let output = self.remote.output_folder().to_path_buf();

        tracing::info!("Splitting file {} with {:?} splitter ...", input.display(), args.splitter);
        let layout = CellLayout {
            origin: self.grid.grid_mins(),
            length: self.grid.tile_width()[0],
        };
        let pieces = args.splitter.split(&input, &output, layout)?;
        tracing::info!("... splitting completed.");

        tracing::info!("Redistributing files to tiles ...");
        for piece in pieces.iter().filter(|p| is_piece_of(p, &input)) {
            let info = read_info(piece)?;
            let (cx, cy) = info.center();
            let index = self.grid.get_tile_index(cx, cy)?;
            let tile = TileId::from_index(index).ok_or_else(|| {
                Error::task(
                    "split_and_redistribute",
                    format!("{} lies outside the grid", piece.display()),
                )
            })?;
            let tile_dir = output.join(tile.to_string());
            check_dir_exists(&tile_dir, true, true)?;
            let name = file_name(piece)?;
            tracing::info!("... file {} to {}", name, tile);
            std::fs::rename(piece, tile_dir.join(name))?;
        }
        tracing::info!("... redistributing completed.");
        Ok(())
    }

    /// Check that the tiles hold as many points as the input file.
    pub fn validate(&mut self, args: ValidateArgs) -> Result<()> {
        let input = self.check_input()?;
        let output = self.remote.output_folder().to_path_buf();
        let stem = file_stem(&input)?;

        tracing::info!("Validating split ...");
        let parent_points = read_info(&input)?.number_of_points;
        tracing::info!("... {} points in parent file", parent_points);

        let mut split_points = 0;
        let mut redistributed_to = Vec::new();
        for tile_file in tile_files(&output, &stem)? {
            let points = read_info(&tile_file)?.number_of_points;
            tracing::info!("... {} points in {}", points, file_name(&tile_file)?);
            split_points += points;
            if let Some(tile) = tile_file
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
            {
                redistributed_to.push(tile.to_string());
            }
        }

        let validated = parent_points == split_points;
        if validated {
            tracing::info!("... split validation completed.");
        } else {
            tracing::error!("Number of points in parent and child tiles differ!");
        }

        let record = RetileRecord {
            file: input.to_string_lossy().into_owned(),
            redistributed_to,
            validated,
        };
        if args.write_record_to_file {
            write_record(&output.join(format!("{}_retile_record.js", stem)), &record)?;
        }
        self.record = Some(record);
        Ok(())
    }

    fn check_input(&self) -> Result<PathBuf> {
        if !self.grid.is_set() {
            return Err(Error::Config("The grid has not been set!".to_string()));
        }
        let input = self.remote.input_path();
        check_file_exists(&input, true)?;
        check_dir_exists(self.remote.output_folder(), true, false)?;
        Ok(input)
    }
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("invalid file name: {}", path.display())))
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("invalid file name: {}", path.display())))
}

/// Whether `piece` is a split product of `input`: same extension, a name
/// starting with the input stem, and not the input itself.
fn is_piece_of(piece: &Path, input: &Path) -> bool {
    let same_suffix = match (piece.extension(), input.extension()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    };
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    piece.is_file()
        && same_suffix
        && piece
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.starts_with(stem))
        && piece.file_name() != input.file_name()
}

/// Files named `<stem>*` in the `tile_*` folders of `output`, sorted.
fn tile_files(output: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let tile_prefix = format!("{}_", TILE_PREFIX);
    let mut files = Vec::new();
    for entry in std::fs::read_dir(output)? {
        let dir = entry?.path();
        let is_tile_dir = dir.is_dir()
            && dir
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&tile_prefix));
        if !is_tile_dir {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(stem));
            if path.is_file() && matches {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn write_record(path: &Path, record: &RetileRecord) -> Result<()> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    // round trip through Value so keys come out sorted
    serde_json::to_value(record)?.serialize(&mut serializer)?;
    std::fs::write(path, buffer)?;
    tracing::debug!("Retile record written to {}", path.display());
    Ok(())
}

impl Pipeline for Retiler {
    const NAME: &'static str = "Retiler";

    fn core(&self) -> &PipelineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore {
        &mut self.core
    }

    fn registry() -> &'static TaskRegistry<Self> {
        static REGISTRY: OnceLock<TaskRegistry<Retiler>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            register_remote_tasks(base_registry::<Retiler>())
                .register("set_grid", |p: &mut Retiler, a: GridArgs| p.set_grid(a))
                .register("split_and_redistribute", |p: &mut Retiler, a: SplitArgs| {
                    p.split_and_redistribute(a)
                })
                .register("validate", |p: &mut Retiler, a: ValidateArgs| p.validate(a))
        })
    }

    fn phases(sequence: Vec<String>) -> Vec<String> {
        wrap_phases(sequence)
    }

    fn constructor_args(&self) -> Option<Value> {
        Some(json!({ "input_file": self.remote.input_path_setting() }))
    }
}

impl RemoteDataPipeline for Retiler {
    fn remote(&self) -> &RemoteData {
        &self.remote
    }

    fn remote_mut(&mut self) -> &mut RemoteData {
        &mut self.remote
    }
}
