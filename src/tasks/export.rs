//! Output file layout for exported point clouds.

use std::path::{Path, PathBuf};

use crate::cloud::{AttributeSelection, PointCloud};
use crate::error::{Error, Result};
use crate::io::fs::{check_dir_exists, check_file_exists};

/// Default extension of exported point clouds.
pub const DEFAULT_FORMAT: &str = ".ply";

pub(crate) fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

/// Join a bare file name to the output folder, which must exist.
pub fn export_path(output_folder: &Path, filename: &str) -> Result<PathBuf> {
    check_dir_exists(output_folder, true, false)?;
    let has_dir = Path::new(filename)
        .parent()
        .is_some_and(|p| !p.as_os_str().is_empty());
    if has_dir {
        return Err(Error::InvalidInput(
            "filename should not include path!".to_string(),
        ));
    }
    Ok(output_folder.join(filename))
}

/// How one export is laid out on disk.
#[derive(Debug, Clone)]
pub struct OutputLayout<'a> {
    /// Stem of the file names when the target is a directory
    pub file_handle: &'a str,
    /// Write all attributes in one file, or one sub-folder per attribute
    pub multi_band_files: bool,
    pub format: &'a str,
    pub overwrite: bool,
}

/// Files to write and the attributes that go in each.
///
/// A `path` without extension is a directory: it receives
/// `<file_handle><format>`, or `<attribute>/<file_handle><format>` per
/// attribute when bands go to separate files. Otherwise `path` itself is
/// the file. Existing files are refused unless `overwrite` is set.
pub fn output_files(
    path: &Path,
    features: &[String],
    layout: &OutputLayout<'_>,
) -> Result<Vec<(PathBuf, AttributeSelection)>> {
    let extension = layout.format.trim_start_matches('.');
    let selection = |names: Vec<String>| {
        if names.is_empty() {
            AttributeSelection::All
        } else {
            AttributeSelection::Only(names)
        }
    };

    let files = if path.extension().is_none() {
        check_dir_exists(path, true, false)?;
        if !features.is_empty() && !layout.multi_band_files {
            let mut files = Vec::with_capacity(features.len());
            for feature in features {
                let sub_path = path.join(feature);
                check_dir_exists(&sub_path, true, true)?;
                let file = sub_path.join(layout.file_handle).with_extension(extension);
                files.push((file, selection(vec![feature.clone()])));
            }
            files
        } else {
            let file = path.join(layout.file_handle).with_extension(extension);
            vec![(file, selection(features.to_vec()))]
        }
    } else {
        let parent = path.parent().unwrap_or(Path::new("."));
        check_dir_exists(parent, true, false)?;
        vec![(path.to_path_buf(), selection(features.to_vec()))]
    };

    if !layout.overwrite {
        for (file, _) in &files {
            check_file_exists(file, false)?;
        }
    }
    Ok(files)
}

/// Export `cloud` following `layout`; `attributes` picks the exported
/// attributes.
pub fn export_cloud(
    cloud: &PointCloud,
    path: &Path,
    attributes: &AttributeSelection,
    layout: &OutputLayout<'_>,
) -> Result<()> {
    let features = attributes.resolve(cloud)?;
    for (file, selection) in output_files(path, &features, layout)? {
        tracing::info!("... exporting {}", file.display());
        if layout.overwrite && file.exists() {
            std::fs::remove_file(&file)?;
        }
        crate::io::export(cloud, &file, &selection)?;
    }
    Ok(())
}
