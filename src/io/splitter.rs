//! Splitting a LAS/LAZ file into square cells.
//!
//! Every cell touched by the input gets its own file, named after the input
//! as `<stem>_<n><suffix>` with `n` counting from 1 in order of first
//! appearance.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use las::{Builder, Header, Writer};
use serde::Deserialize;
use serde_json::json;

use super::las::open_reader;
use crate::error::{Error, Result};

/// Tool used to split a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Splitter {
    /// Split in-process with the `las` crate.
    #[default]
    Native,
    /// Run a PDAL `filters.splitter` pipeline through the `pdal` executable.
    Pdal,
}

/// Placement of the cells: lower-left corner of cell `(0, 0)` and side length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellLayout {
    pub origin: [f64; 2],
    pub length: f64,
}

impl CellLayout {
    fn cell_of(&self, x: f64, y: f64) -> (i64, i64) {
        (
            ((x - self.origin[0]) / self.length).floor() as i64,
            ((y - self.origin[1]) / self.length).floor() as i64,
        )
    }
}

impl Splitter {
    /// Split `input` into `output_dir`, returning the files written.
    pub fn split(&self, input: &Path, output_dir: &Path, layout: CellLayout) -> Result<Vec<PathBuf>> {
        if !(layout.length > 0.0) {
            return Err(Error::InvalidInput(format!(
                "cell length must be > 0, got {}",
                layout.length
            )));
        }
        match self {
            Splitter::Native => split_native(input, output_dir, layout),
            Splitter::Pdal => split_pdal(input, output_dir, layout),
        }
    }
}

fn stem_and_suffix(input: &Path) -> Result<(String, String)> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("invalid file name: {}", input.display())))?;
    let suffix = input
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    Ok((stem.to_string(), suffix))
}

fn cell_header(source: &Header) -> Result<Header> {
    let mut builder = Builder::from(source.version());
    builder.point_format = source.point_format().clone();
    builder.transforms = source.transforms().clone();
    builder.vlrs = source.vlrs().clone();
    Ok(builder.into_header()?)
}

fn split_native(input: &Path, output_dir: &Path, layout: CellLayout) -> Result<Vec<PathBuf>> {
    let (stem, suffix) = stem_and_suffix(input)?;
    let mut reader = open_reader(input)?;
    let header = cell_header(reader.header())?;

    let mut writers: HashMap<(i64, i64), Writer<BufWriter<File>>> = HashMap::new();
    let mut written = Vec::new();
    for point in reader.points() {
        let point = point?;
        let cell = layout.cell_of(point.x, point.y);
        let writer = match writers.entry(cell) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = output_dir.join(format!("{}_{}{}", stem, written.len() + 1, suffix));
                let writer = Writer::from_path(&path, header.clone())?;
                written.push(path);
                entry.insert(writer)
            }
        };
        writer.write_point(point)?;
    }
    for (_, mut writer) in writers {
        writer.close()?;
    }
    tracing::debug!("Split {} into {} files", input.display(), written.len());
    Ok(written)
}

fn split_pdal(input: &Path, output_dir: &Path, layout: CellLayout) -> Result<Vec<PathBuf>> {
    let (stem, suffix) = stem_and_suffix(input)?;
    let placeholder = output_dir.join(format!("{}_#{}", stem, suffix));
    let pipeline = json!({
        "pipeline": [
            input.to_string_lossy(),
            {
                "type": "filters.splitter",
                "origin_x": layout.origin[0].to_string(),
                "origin_y": layout.origin[1].to_string(),
                "length": layout.length.to_string(),
            },
            {
                "type": "writers.las",
                "filename": placeholder.to_string_lossy(),
                "forward": ["scale_x", "scale_y", "scale_z"],
                "offset_x": "auto",
                "offset_y": "auto",
                "offset_z": "auto",
            }
        ]
    });
    tracing::debug!("PDAL pipeline: {}", pipeline);

    let mut child = Command::new("pdal")
        .args(["pipeline", "--stdin"])
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| Error::task("split_and_redistribute", format!("cannot run pdal: {}", e)))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(pipeline.to_string().as_bytes())?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(Error::task(
            "split_and_redistribute",
            format!("pdal exited with {}", status),
        ));
    }

    let prefix = format!("{}_", stem);
    let mut written: Vec<PathBuf> = std::fs::read_dir(output_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
        })
        .collect();
    written.sort();
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::PointCloud;
    use crate::io::las::{read_info, write_las};
    use tempfile::TempDir;

    #[test]
    fn test_native_split_conserves_points() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("cloud.las");
        let pc = PointCloud::new(
            vec![0.5, 1.5, 2.5, 0.5, 3.5],
            vec![0.5, 0.5, 0.5, 2.5, 3.5],
            vec![0.0; 5],
        )
        .unwrap();
        write_las(&input, &pc, &[]).unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let layout = CellLayout {
            origin: [0.0, 0.0],
            length: 2.0,
        };
        let files = Splitter::Native.split(&input, &out, layout).unwrap();
        assert_eq!(files.len(), 4);
        assert_eq!(files[0], out.join("cloud_1.las"));

        let total: u64 = files
            .iter()
            .map(|f| read_info(f).unwrap().number_of_points)
            .sum();
        assert_eq!(total, 5);
        // (0.5, 0.5) and (1.5, 0.5) share the first cell
        assert_eq!(read_info(&files[0]).unwrap().number_of_points, 2);
    }

    #[test]
    fn test_invalid_length() {
        let dir = TempDir::new().unwrap();
        let layout = CellLayout {
            origin: [0.0, 0.0],
            length: 0.0,
        };
        assert!(Splitter::Native
            .split(&dir.path().join("a.las"), dir.path(), layout)
            .is_err());
    }
}
