//! File and remote storage I/O: point-cloud formats, rasters, staging.

pub mod fs;
pub mod las;
pub mod ply;
pub mod raster;
pub mod splitter;
mod remote;
mod store;

use std::path::Path;

use crate::cloud::{AttributeSelection, PointCloud};
use crate::error::{Error, Result};

pub use remote::{pull_from_remote, push_to_remote};
pub use store::{
    create_remote_store, object_path, RemoteClient, RemoteOptions, RemoteOptionsSource,
};

/// Extensions of the point-cloud files that can be loaded.
pub const POINT_CLOUD_EXTENSIONS: [&str; 3] = ["las", "laz", "ply"];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

pub fn is_point_cloud_file(path: &Path) -> bool {
    extension(path).is_some_and(|e| POINT_CLOUD_EXTENSIONS.contains(&e.as_str()))
}

/// Read a point-cloud file, dispatching on its extension.
pub fn load(path: &Path, selection: &AttributeSelection) -> Result<PointCloud> {
    fs::check_file_exists(path, true)?;
    match extension(path).as_deref() {
        Some("las") | Some("laz") => las::read_las(path, selection),
        Some("ply") => ply::read_ply(path, selection),
        _ => Err(Error::NotImplemented(format!(
            "unsupported point-cloud format: {}",
            path.display()
        ))),
    }
}

/// Write the selected attributes of `cloud`, dispatching on the extension
/// of `path`.
pub fn export(cloud: &PointCloud, path: &Path, selection: &AttributeSelection) -> Result<()> {
    let attributes = selection.resolve(cloud)?;
    match extension(path).as_deref() {
        Some("las") | Some("laz") => las::write_las(path, cloud, &attributes),
        Some("ply") => ply::write_ply(path, cloud, &attributes),
        _ => Err(Error::NotImplemented(format!(
            "unsupported point-cloud format: {}",
            path.display()
        ))),
    }
}
