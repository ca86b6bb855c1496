//! Concrete pipelines and the registry that rebuilds them from descriptors.

pub mod classification;
pub mod data_processing;
mod export;
pub mod geotiff_writer;
pub mod retiler;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use classification::Classification;
pub use data_processing::DataProcessing;
pub use export::DEFAULT_FORMAT;
pub use geotiff_writer::GeotiffWriter;
pub use retiler::Retiler;

use crate::error::{Error, Result};
use crate::index::TileId;
use crate::pipeline::{args_object, BatchTask, Pipeline, TaskDescriptor};

/// Grid definition shared by the retiling and target-generation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GridArgs {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub n_tiles_side: i64,
}

/// Command-line names of the pipeline kinds.
pub const PIPELINE_KINDS: [&str; 4] = [
    "retiling",
    "data_processing",
    "geotiff_writer",
    "classification",
];

/// The pipeline types a batch or a worker can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    #[serde(alias = "Retiler")]
    Retiling,
    #[serde(alias = "DataProcessing")]
    DataProcessing,
    #[serde(alias = "GeotiffWriter")]
    GeotiffWriter,
    #[serde(alias = "Classification")]
    Classification,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetilerInit {
    input_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataProcessingInit {
    input: Option<PathBuf>,
    tile_index: Option<[u64; 2]>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Bands {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeotiffWriterInit {
    input_dir: Option<PathBuf>,
    bands: Option<Bands>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassificationInit {
    input_file: Option<PathBuf>,
}

fn init<T: serde::de::DeserializeOwned>(kind: PipelineKind, args: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(args)).map_err(|e| {
        Error::Config(format!(
            "invalid constructor arguments for {}: {}",
            kind.pipeline_name(),
            e
        ))
    })
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Retiling,
        PipelineKind::DataProcessing,
        PipelineKind::GeotiffWriter,
        PipelineKind::Classification,
    ];

    /// Command-line name, e.g. `data_processing`.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Retiling => PIPELINE_KINDS[0],
            PipelineKind::DataProcessing => PIPELINE_KINDS[1],
            PipelineKind::GeotiffWriter => PIPELINE_KINDS[2],
            PipelineKind::Classification => PIPELINE_KINDS[3],
        }
    }

    /// Type name, as carried by task descriptors.
    pub fn pipeline_name(&self) -> &'static str {
        match self {
            PipelineKind::Retiling => Retiler::NAME,
            PipelineKind::DataProcessing => DataProcessing::NAME,
            PipelineKind::GeotiffWriter => GeotiffWriter::NAME,
            PipelineKind::Classification => Classification::NAME,
        }
    }

    /// Constructor argument holding the input path.
    pub fn input_arg(&self) -> &'static str {
        match self {
            PipelineKind::Retiling | PipelineKind::Classification => "input_file",
            PipelineKind::DataProcessing => "input",
            PipelineKind::GeotiffWriter => "input_dir",
        }
    }

    /// Build an unconfigured pipeline from constructor arguments.
    pub fn build(
        &self,
        label: Option<String>,
        args: Map<String, Value>,
    ) -> Result<Box<dyn BatchTask>> {
        let task: Box<dyn BatchTask> = match self {
            PipelineKind::Retiling => {
                let a: RetilerInit = init(*self, args)?;
                Box::new(Retiler::new(a.input_file, label))
            }
            PipelineKind::DataProcessing => {
                let a: DataProcessingInit = init(*self, args)?;
                let tile = a.tile_index.map(|[ix, iy]| TileId::new(ix, iy));
                Box::new(DataProcessing::new(a.input, label, tile))
            }
            PipelineKind::GeotiffWriter => {
                let a: GeotiffWriterInit = init(*self, args)?;
                let bands = match a.bands {
                    None => Vec::new(),
                    Some(Bands::One(band)) => vec![band],
                    Some(Bands::Many(bands)) => bands,
                };
                Box::new(GeotiffWriter::new(a.input_dir, bands, label))
            }
            PipelineKind::Classification => {
                let a: ClassificationInit = init(*self, args)?;
                Box::new(Classification::new(a.input_file, label))
            }
        };
        Ok(task)
    }

    /// Build a pipeline and load its input mapping.
    pub fn build_with_input(
        &self,
        label: Option<String>,
        args: Map<String, Value>,
        input: Value,
    ) -> Result<Box<dyn BatchTask>> {
        let mut task = self.build(label, args)?;
        task.load_input(input)?;
        Ok(task)
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = Error;

    /// Accepts both the command-line name and the type name.
    fn from_str(s: &str) -> Result<Self> {
        PipelineKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.pipeline_name() == s)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Unknown pipeline kind {}! Choose between: {}",
                    s,
                    PIPELINE_KINDS.join(", ")
                ))
            })
    }
}

/// Rebuild the pipeline a descriptor was taken from.
pub fn build_task(descriptor: &TaskDescriptor) -> Result<Box<dyn BatchTask>> {
    let kind: PipelineKind = descriptor.kind.parse()?;
    kind.build_with_input(
        Some(descriptor.label.clone()),
        args_object(&descriptor.args)?,
        descriptor.input.clone(),
    )
}
