//! laserfarm
//!
//! Parallel processing of large-scale airborne point-cloud data: retiling of
//! raw LAS/LAZ files onto a regular grid, per-tile feature extraction and
//! rasterization of the results into GeoTIFFs.
//!
//! # Architecture
//!
//! - **Index**: square tiling grid and `tile_<ix>_<iy>` naming
//! - **Cloud**: in-memory point clouds, filters, normalization and features
//! - **I/O**: LAS/LAZ, PLY and GeoTIFF files, remote staging via object_store
//! - **Pipeline**: task sequencer, remote-data staging and batch execution
//! - **Tasks**: the retiling, data processing, GeoTIFF and classification
//!   pipelines
//!
//! # Usage
//!
//! ```no_run
//! use laserfarm::{ClusterConfig, DataProcessing, MacroPipeline, Pipeline, TileId};
//! use serde_json::json;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut pipeline = DataProcessing::new(
//!         Some("tile_101_101".into()),
//!         Some("tile_101_101".into()),
//!         Some(TileId::new(101, 101)),
//!     );
//!     pipeline.set_input(json!({"load": {}, "normalize": 1}))?;
//!
//!     let mut batch = MacroPipeline::new();
//!     batch.add_task(pipeline);
//!     batch.setup_cluster(&ClusterConfig::default())?;
//!     batch.run()?;
//!     batch.print_outcome(None)?;
//!     batch.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod cloud;
pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod pipeline;
pub mod tasks;

pub use cloud::{AttributeSelection, PointCloud};
pub use config::{MacroConfig, TaskEntry, SAMPLE_CONFIG};
pub use error::{Error, ErrorKind, Result};
pub use index::{Grid, TileId};
pub use pipeline::{
    BatchStats, BatchTask, ClusterConfig, ConfigSource, MacroPipeline, Pipeline, RunSummary,
    TaskDescriptor, TaskOutcome,
};
pub use tasks::{
    build_task, Classification, DataProcessing, GeotiffWriter, PipelineKind, Retiler,
};

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> anyhow::Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
