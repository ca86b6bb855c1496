//! Load, filter and normalize point clouds and extract features on a regular
//! mesh of target points.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::export::{default_format, export_cloud, export_path, OutputLayout};
use crate::cloud::{
    compute_features, compute_neighborhoods, normalize, AttributeSelection, FeatureCatalog,
    Filter, PointCloud, SpatialIndex, Volume,
};
use crate::error::{Error, Result};
use crate::index::{Grid, TileId};
use crate::io::fs::check_path_exists;
use crate::io::{is_point_cloud_file, load};
use crate::pipeline::{
    base_registry, register_remote_tasks, wrap_phases, NoArgs, Pipeline, PipelineCore,
    RemoteData, RemoteDataPipeline, TaskRegistry,
};

/// Extractor name plus its keyword parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomFeatureArgs {
    pub extractor_name: String,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomFeaturesArgs {
    pub custom_feature_list: Vec<CustomFeatureArgs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadArgs {
    #[serde(default)]
    pub attributes: AttributeSelection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizeArgs {
    pub cell_size: f64,
}

/// Filter name plus its keyword input.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterArgs {
    pub filter_type: String,
    #[serde(flatten)]
    pub filter_input: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportPointCloudArgs {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub attributes: AttributeSelection,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportTargetsArgs {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub attributes: AttributeSelection,
    #[serde(default = "default_true")]
    pub multi_band_files: bool,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateTargetsArgs {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub n_tiles_side: i64,
    pub tile_mesh_size: f64,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default)]
    pub validate_precision: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractFeaturesArgs {
    pub volume_type: String,
    pub volume_size: f64,
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub sample_size: Option<usize>,
}

/// Pipeline that turns the point cloud of one tile into a mesh of target
/// points carrying the requested features.
#[derive(Debug)]
pub struct DataProcessing {
    core: PipelineCore,
    remote: RemoteData,
    point_cloud: PointCloud,
    targets: PointCloud,
    grid: Grid,
    catalog: FeatureCatalog,
    tile_index: Option<TileId>,
    index_cache: Option<SpatialIndex>,
}

impl DataProcessing {
    pub fn new(input: Option<PathBuf>, label: Option<String>, tile_index: Option<TileId>) -> Self {
        let mut processing = Self {
            core: PipelineCore::new(&[
                "add_custom_feature",
                "add_custom_features",
                "load",
                "normalize",
                "apply_filter",
                "export_point_cloud",
                "generate_targets",
                "extract_features",
                "export_targets",
                "clear_cache",
            ]),
            remote: RemoteData::default(),
            point_cloud: PointCloud::default(),
            targets: PointCloud::default(),
            grid: Grid::new(),
            catalog: FeatureCatalog::default(),
            tile_index,
            index_cache: None,
        };
        if let Some(input) = input {
            processing.remote.set_input_path(input);
        }
        if let Some(label) = label {
            Pipeline::set_label(&mut processing, label);
        }
        processing
    }

    pub fn point_cloud(&self) -> &PointCloud {
        &self.point_cloud
    }

    pub fn targets(&self) -> &PointCloud {
        &self.targets
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn tile_index(&self) -> Option<TileId> {
        self.tile_index
    }

    pub fn set_tile_index(&mut self, tile: TileId) {
        self.tile_index = Some(tile);
    }

    /// Features that can be requested from `extract_features`.
    pub fn features(&self) -> Vec<&str> {
        self.catalog.names().collect()
    }

    /// Register a parametrized feature extractor.
    pub fn add_custom_feature(&mut self, args: CustomFeatureArgs) -> Result<()> {
        tracing::info!("Setting up feature extractor {}", args.extractor_name);
        let name = self
            .catalog
            .add_custom_feature(&args.extractor_name, args.parameters)?;
        tracing::debug!("... feature {} available", name);
        Ok(())
    }

    pub fn add_custom_features(&mut self, args: CustomFeaturesArgs) -> Result<()> {
        for custom_feature in args.custom_feature_list {
            self.add_custom_feature(custom_feature)?;
        }
        Ok(())
    }

    /// Read the input file, or every point-cloud file of the input folder,
    /// and append it to the environment point cloud.
    pub fn load(&mut self, args: LoadArgs) -> Result<()> {
        let input = self.remote.input_path();
        let files = input_file_list(&input)?;
        tracing::info!("Loading point cloud data ...");
        for file in files {
            tracing::info!("... loading {}", file.display());
            let cloud = load(&file, &args.attributes)?;
            self.point_cloud.append(cloud)?;
        }
        self.index_cache = None;
        tracing::info!("... loading completed.");
        Ok(())
    }

    pub fn normalize(&mut self, args: NormalizeArgs) -> Result<()> {
        tracing::info!("Normalizing point-cloud heights ...");
        normalize(&mut self.point_cloud, args.cell_size)?;
        tracing::info!("... normalization completed.");
        Ok(())
    }

    pub fn apply_filter(&mut self, args: FilterArgs) -> Result<()> {
        self.check_point_cloud_is_not_empty()?;
        let filter = Filter::from_name(&args.filter_type, args.filter_input)?;
        tracing::info!("Filtering point-cloud data");
        self.point_cloud = filter.apply(&self.point_cloud)?;
        self.index_cache = None;
        Ok(())
    }

    pub fn export_point_cloud(&mut self, args: ExportPointCloudArgs) -> Result<()> {
        let path = export_path(self.remote.output_folder(), &args.filename)?;
        tracing::info!("Exporting environment point-cloud ...");
        let layout = OutputLayout {
            file_handle: "point_cloud",
            multi_band_files: true,
            format: &args.format,
            overwrite: args.overwrite,
        };
        export_cloud(&self.point_cloud, &path, &args.attributes, &layout)?;
        tracing::info!("... exporting completed.");
        Ok(())
    }

    /// Set up the grid and build the mesh of target points of this tile.
    pub fn generate_targets(&mut self, args: GenerateTargetsArgs) -> Result<()> {
        tracing::info!("Setting up the target grid");
        self.grid.setup(
            args.min_x,
            args.min_y,
            args.max_x,
            args.max_y,
            args.n_tiles_side,
        )?;
        let tile = self
            .tile_index
            .ok_or_else(|| Error::Config("Tile index not set!".to_string()))?;
        let (ix, iy) = tile.index();

        if args.validate {
            tracing::info!("Checking whether points belong to cell ({},{})", ix, iy);
            let mask = self.grid.is_point_in_tile(
                self.point_cloud.x(),
                self.point_cloud.y(),
                ix,
                iy,
                args.validate_precision,
            )?;
            let outside = mask.iter().filter(|inside| !**inside).count();
            if outside > 0 {
                return Err(Error::task(
                    "generate_targets",
                    format!("{} points belong to (a) different tile(s)!", outside),
                ));
            }
        }

        tracing::info!(
            "Generating target point mesh with {}m spacing",
            args.tile_mesh_size
        );
        let (xs, ys) = self.grid.generate_tile_mesh(ix, iy, args.tile_mesh_size)?;
        let zs = vec![0.0; xs.len()];
        self.targets = PointCloud::new(xs, ys, zs)?;
        Ok(())
    }

    /// Compute the requested features of every target from its
    /// neighborhood in the environment point cloud.
    pub fn extract_features(&mut self, args: ExtractFeaturesArgs) -> Result<()> {
        tracing::info!("Building volume of type {}", args.volume_type);
        let volume = Volume::build(&args.volume_type, args.volume_size)?;
        for name in &args.feature_names {
            self.catalog.get(name)?;
        }
        for attribute in self.catalog.required_attributes(&args.feature_names) {
            self.point_cloud.require(&attribute)?;
        }

        tracing::info!("Constructing neighborhoods");
        let index = self
            .index_cache
            .get_or_insert_with(|| SpatialIndex::build(&self.point_cloud));
        let neighborhoods = compute_neighborhoods(
            &self.point_cloud,
            index,
            &self.targets,
            &volume,
            args.sample_size,
        )?;

        tracing::info!("Starting feature extraction ...");
        compute_features(
            &self.point_cloud,
            &neighborhoods,
            &mut self.targets,
            &args.feature_names,
            &volume,
            &self.catalog,
        )?;
        tracing::info!("... feature extraction completed.");
        Ok(())
    }

    pub fn export_targets(&mut self, args: ExportTargetsArgs) -> Result<()> {
        let path = export_path(self.remote.output_folder(), &args.filename)?;
        let file_handle = match self.tile_index {
            Some(tile) => tile.to_string(),
            None => "tile_None_None".to_string(),
        };
        tracing::info!("Exporting target point-cloud ...");
        let layout = OutputLayout {
            file_handle: &file_handle,
            multi_band_files: args.multi_band_files,
            format: &args.format,
            overwrite: args.overwrite,
        };
        export_cloud(&self.targets, &path, &args.attributes, &layout)?;
        tracing::info!("... exporting completed.");
        Ok(())
    }

    /// Drop the cached spatial index of the environment point cloud.
    pub fn clear_cache(&mut self) -> Result<()> {
        tracing::info!("Clearing cached spatial index ...");
        self.index_cache = None;
        Ok(())
    }

    fn check_point_cloud_is_not_empty(&self) -> Result<()> {
        if self.point_cloud.is_empty() {
            return Err(Error::InvalidInput("Point cloud is empty!".to_string()));
        }
        Ok(())
    }
}

/// The input file itself, or the supported files of an input folder.
fn input_file_list(path: &Path) -> Result<Vec<PathBuf>> {
    check_path_exists(path, true)?;
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Unable to read from path: {}",
            path.display()
        )));
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_point_cloud_file(p))
        .collect();
    if files.is_empty() {
        return Err(Error::NotFound(format!(
            "No point-cloud file in: {}",
            path.display()
        )));
    }
    files.sort();
    Ok(files)
}

impl Pipeline for DataProcessing {
    const NAME: &'static str = "DataProcessing";

    fn core(&self) -> &PipelineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore {
        &mut self.core
    }

    fn registry() -> &'static TaskRegistry<Self> {
        static REGISTRY: OnceLock<TaskRegistry<DataProcessing>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            register_remote_tasks(base_registry::<DataProcessing>())
                .register("add_custom_feature", |p: &mut DataProcessing, a| {
                    p.add_custom_feature(a)
                })
                .register("add_custom_features", |p: &mut DataProcessing, a| {
                    p.add_custom_features(a)
                })
                .register("load", |p: &mut DataProcessing, a| p.load(a))
                .register("normalize", |p: &mut DataProcessing, a| p.normalize(a))
                .register("apply_filter", |p: &mut DataProcessing, a| p.apply_filter(a))
                .register("export_point_cloud", |p: &mut DataProcessing, a| {
                    p.export_point_cloud(a)
                })
                .register("generate_targets", |p: &mut DataProcessing, a| {
                    p.generate_targets(a)
                })
                .register("extract_features", |p: &mut DataProcessing, a| {
                    p.extract_features(a)
                })
                .register("export_targets", |p: &mut DataProcessing, a| {
                    p.export_targets(a)
                })
                .register("clear_cache", |p: &mut DataProcessing, _: NoArgs| {
                    p.clear_cache()
                })
        })
    }

    fn phases(sequence: Vec<String>) -> Vec<String> {
        wrap_phases(sequence)
    }

    fn constructor_args(&self) -> Option<Value> {
        Some(json!({
            "input": self.remote.input_path_setting(),
            "tile_index": self.tile_index.map(|t| [t.ix, t.iy]),
        }))
    }
}

impl RemoteDataPipeline for DataProcessing {
    fn remote(&self) -> &RemoteData {
        &self.remote
    }

    fn remote_mut(&mut self) -> &mut RemoteData {
        &mut self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ply::read_ply;
    use tempfile::TempDir;

    /// 10x10 tile (1, 0) of a 20x20 grid, one point per 1m cell.
    fn tile_cloud() -> PointCloud {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                xs.push(10.0 + i as f64 + 0.5);
                ys.push(j as f64 + 0.5);
                zs.push((i + j) as f64);
            }
        }
        PointCloud::new(xs, ys, zs).unwrap()
    }

    fn setup(dir: &Path) -> DataProcessing {
        let input = dir.join("input");
        let output = dir.join("output");
        std::fs::create_dir(&input).unwrap();
        std::fs::create_dir(&output).unwrap();
        crate::io::ply::write_ply(&input.join("tile_1_0.ply"), &tile_cloud(), &[]).unwrap();

        let mut processing =
            DataProcessing::new(None, Some("dp".into()), Some(TileId::new(1, 0)));
        processing.remote_mut().set_input_folder(&input);
        processing.remote_mut().set_output_folder(&output);
        processing
    }

    fn grid_input() -> Value {
        json!({
            "min_x": 0.0, "min_y": 0.0, "max_x": 20.0, "max_y": 20.0,
            "n_tiles_side": 2, "tile_mesh_size": 5.0
        })
    }

    #[test]
    fn test_full_processing() {
        let dir = TempDir::new().unwrap();
        let mut processing = setup(dir.path());
        processing
            .set_input(json!({
                "load": {},
                "normalize": 1,
                "generate_targets": grid_input(),
                "extract_features": {
                    "volume_type": "infinite_cylinder",
                    "volume_size": 2.5,
                    "feature_names": ["point_density", "max_z", "perc_50_normalized_height"],
                },
                "export_targets": {"attributes": ["point_density", "max_z"]},
                "clear_cache": {},
            }))
            .unwrap();
        let summary = processing.run().unwrap();
        assert!(summary.unused.is_empty());

        let targets = processing.targets();
        assert_eq!(targets.len(), 4);
        assert_eq!(targets.x()[0], 12.5);
        assert_eq!(targets.y()[0], 2.5);
        // one point per cell, every cell is its own minimum
        assert!(targets
            .attribute("perc_50_normalized_height")
            .unwrap()
            .iter()
            .all(|v| *v == 0.0));

        let out = dir.path().join("output").join("tile_1_0.ply");
        let exported = read_ply(&out, &AttributeSelection::All).unwrap();
        assert_eq!(exported.len(), 4);
        let names: Vec<&str> = exported.attribute_names().collect();
        assert_eq!(names, vec!["max_z", "point_density"]);
    }

    #[test]
    fn test_load_empty_directory() {
        let dir = TempDir::new().unwrap();
        let mut processing = DataProcessing::new(None, None, None);
        processing.remote_mut().set_input_folder(dir.path());
        assert!(matches!(
            processing.load(LoadArgs::default()).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_generate_targets_validation() {
        let dir = TempDir::new().unwrap();
        let mut processing = setup(dir.path());
        processing.load(LoadArgs::default()).unwrap();
        processing.set_tile_index(TileId::new(0, 0));
        let args: GenerateTargetsArgs = serde_json::from_value(grid_input()).unwrap();
        let err = processing.generate_targets(args.clone()).unwrap_err();
        assert!(err.to_string().contains("100 points belong to (a) different tile(s)!"));

        let mut unvalidated = args;
        unvalidated.validate = false;
        processing.generate_targets(unvalidated).unwrap();
        assert_eq!(processing.targets().x()[0], 2.5);
    }

    #[test]
    fn test_generate_targets_needs_tile_index() {
        let mut processing = DataProcessing::new(None, None, None);
        let args: GenerateTargetsArgs = serde_json::from_value(grid_input()).unwrap();
        assert!(matches!(
            processing.generate_targets(args).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn test_filter_and_custom_features() {
        let dir = TempDir::new().unwrap();
        let mut processing = setup(dir.path());
        processing.load(LoadArgs::default()).unwrap();
        processing
            .apply_filter(
                serde_json::from_value(
                    json!({"filter_type": "select_below", "attribute": "z", "threshold": 5.0}),
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(processing.point_cloud().len(), 15);

        let err = processing
            .apply_filter(serde_json::from_value(json!({"filter_type": "select_sideways"})).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("Choose between"));

        processing
            .add_custom_features(
                serde_json::from_value(json!({"custom_feature_list": [
                    {"extractor_name": "PercentileFeatureExtractor", "percentile": 33, "data_key": "z"},
                    {"extractor_name": "BandRatioFeatureExtractor", "lower_limit": 1, "upper_limit": 3, "data_key": "z"},
                ]}))
                .unwrap(),
            )
            .unwrap();
        assert!(processing.features().contains(&"perc_33_z"));
        assert!(processing.features().contains(&"band_ratio_1_z_3"));
        assert!(processing
            .add_custom_feature(
                serde_json::from_value(json!({"extractor_name": "EigenValueVectorizeFeatureExtractor"}))
                    .unwrap()
            )
            .is_err());
    }

    #[test]
    fn test_export_point_cloud_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let mut processing = setup(dir.path());
        processing.load(LoadArgs::default()).unwrap();
        let args: ExportPointCloudArgs = serde_json::from_value(json!({})).unwrap();
        processing.export_point_cloud(args.clone()).unwrap();
        assert!(dir.path().join("output").join("point_cloud.ply").is_file());
        assert!(matches!(
            processing.export_point_cloud(args).unwrap_err(),
            Error::AlreadyExists(_)
        ));
        let nested: ExportPointCloudArgs =
            serde_json::from_value(json!({"filename": "a/b.ply"})).unwrap();
        assert!(processing.export_point_cloud(nested).is_err());
    }
}
