//! Label the points of a cloud that fall inside polygon files.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::Deserialize;
use serde_json::{json, Value};

use super::export::{export_cloud, export_path, OutputLayout};
use crate::cloud::polygon::MultiPolygon;
use crate::cloud::{AttributeSelection, PointCloud};
use crate::error::{Error, Result};
use crate::io::fs::{check_dir_exists, check_file_exists};
use crate::io::load;
use crate::pipeline::{
    base_registry, register_remote_tasks, wrap_phases, Pipeline, PipelineCore, RemoteData,
    RemoteDataPipeline, TaskRegistry,
};

/// Attribute written by [`Classification::classification`].
pub const GROUND_TYPE: &str = "ground_type";

const POLYGON_EXTENSIONS: [&str; 2] = ["geojson", "json"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocateArgs {
    pub shp_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationArgs {
    pub ground_type: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportArgs {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug)]
pub struct Classification {
    core: PipelineCore,
    remote: RemoteData,
    point_cloud: Option<PointCloud>,
    polygon_files: Vec<PathBuf>,
}

impl Classification {
    pub fn new(input_file: Option<PathBuf>, label: Option<String>) -> Self {
        let mut classification = Self {
            core: PipelineCore::new(&["locate_shp", "classification", "export_point_cloud"]),
            remote: RemoteData::default(),
            point_cloud: None,
            polygon_files: Vec::new(),
        };
        if let Some(input_file) = input_file {
            classification.remote.set_input_path(input_file);
        }
        if let Some(label) = label {
            Pipeline::set_label(&mut classification, label);
        }
        classification
    }

    pub fn point_cloud(&self) -> Option<&PointCloud> {
        self.point_cloud.as_ref()
    }

    /// Polygon files overlapping the point cloud.
    pub fn polygon_files(&self) -> &[PathBuf] {
        &self.polygon_files
    }

    /// Load the input cloud and keep the polygon files of `shp_dir` whose
    /// bounding box intersects the one of the cloud.
    pub fn locate_shp(&mut self, args: LocateArgs) -> Result<()> {
        let input = self.remote.input_path();
        check_file_exists(&input, true)?;
        let cloud = load(&input, &AttributeSelection::All)?;

        let polygon_dir = self.remote.input_folder().join(&args.shp_dir);
        check_dir_exists(&polygon_dir, true, false)?;

        let bounds = cloud
            .bounds()
            .ok_or_else(|| Error::InvalidInput("Point cloud is empty!".to_string()))?;

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&polygon_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| POLYGON_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        candidates.sort();

        self.polygon_files.clear();
        for file in candidates {
            let region = MultiPolygon::from_geojson_file(&file)?;
            let overlaps = region.bbox().is_some_and(|b| boxes_intersect(&b, &bounds));
            tracing::debug!("... polygon file {} overlaps: {}", file.display(), overlaps);
            if overlaps {
                self.polygon_files.push(file);
            }
        }
        tracing::info!(
            "{} polygon file(s) overlap {}",
            self.polygon_files.len(),
            input.display()
        );
        self.point_cloud = Some(cloud);
        Ok(())
    }

    /// Set `ground_type` to the given value for points inside any located
    /// polygon, and to 0 for all other points.
    pub fn classification(&mut self, args: ClassificationArgs) -> Result<()> {
        let cloud = self.point_cloud.as_mut().ok_or_else(|| {
            Error::Config("The point cloud has not been loaded!".to_string())
        })?;
        let mut inside = vec![false; cloud.len()];
        for file in &self.polygon_files {
            let region = MultiPolygon::from_geojson_file(file)?;
            let mask = region.contains_points(cloud.x(), cloud.y());
            for (acc, hit) in inside.iter_mut().zip(mask) {
                *acc |= hit;
            }
        }
        let classified = inside.iter().filter(|i| **i).count();
        tracing::info!(
            "{} of {} points classified as {}",
            classified,
            cloud.len(),
            args.ground_type
        );
        let values = inside
            .into_iter()
            .map(|hit| if hit { args.ground_type } else { 0.0 })
            .collect();
        cloud.set_attribute(GROUND_TYPE, values)
    }

    /// Write the classified cloud to the output folder, by default as
    /// `<stem>_classification<suffix>`.
    pub fn export_point_cloud(&mut self, args: ExportArgs) -> Result<()> {
        let cloud = self.point_cloud.as_ref().ok_or_else(|| {
            Error::Config("The point cloud has not been loaded!".to_string())
        })?;
        let input = self.remote.input_path();
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let suffix = input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let file_handle = format!("{}_classification", stem);
        let filename = if args.filename.is_empty() {
            format!("{}{}", file_handle, suffix)
        } else {
            args.filename
        };
        let path = export_path(self.remote.output_folder(), &filename)?;
        let layout = OutputLayout {
            file_handle: &file_handle,
            multi_band_files: true,
            format: &suffix,
            overwrite: args.overwrite,
        };
        tracing::info!("Exporting classified point-cloud to {}", path.display());
        export_cloud(cloud, &path, &AttributeSelection::All, &layout)
    }
}

fn boxes_intersect(a: &[f64; 4], b: &[f64; 4]) -> bool {
    a[0] <= b[2] && b[0] <= a[2] && a[1] <= b[3] && b[1] <= a[3]
}

impl Pipeline for Classification {
    const NAME: &'static str = "Classification";

    fn core(&self) -> &PipelineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore {
        &mut self.core
    }

    fn registry() -> &'static TaskRegistry<Self> {
        static REGISTRY: OnceLock<TaskRegistry<Classification>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            register_remote_tasks(base_registry::<Classification>())
                .register("locate_shp", |p: &mut Classification, a| p.locate_shp(a))
                .register("classification", |p: &mut Classification, a| {
                    p.classification(a)
                })
                .register("export_point_cloud", |p: &mut Classification, a| {
                    p.export_point_cloud(a)
                })
        })
    }

    fn phases(sequence: Vec<String>) -> Vec<String> {
        wrap_phases(sequence)
    }

    fn constructor_args(&self) -> Option<Value> {
        Some(json!({ "input_file": self.remote.input_path_setting() }))
    }
}

impl RemoteDataPipeline for Classification {
    fn remote(&self) -> &RemoteData {
        &self.remote
    }

    fn remote_mut(&mut self) -> &mut RemoteData {
        &mut self.remote
    }
}
