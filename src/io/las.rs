//! LAS/LAZ access through the `las` crate.
//!
//! Standard point record fields map to named attributes (`intensity`,
//! `raw_classification`, `gps_time`, ...). Any other attribute is stored as
//! an `f64` extra-bytes field described in the `LASF_Spec` extra-bytes VLR,
//! so derived attributes survive a round trip through a LAS file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use las::point::{Classification, Format};
use las::{Builder, Header, Point, Reader, Transform, Vector, Vlr};

use crate::cloud::{min_max, AttributeSelection, PointCloud};
use crate::error::{Error, Result};

/// File extensions handled by this module.
pub const LAS_EXTENSIONS: [&str; 2] = ["las", "laz"];

const EXTRA_BYTES_USER_ID: &str = "LASF_Spec";
const EXTRA_BYTES_RECORD_ID: u16 = 4;
const EXTRA_BYTES_DESCRIPTOR_LEN: usize = 192;
const EXTRA_BYTES_F64: u8 = 10;

/// Coordinate resolution used when writing.
const COORDINATE_SCALE: f64 = 0.001;

/// Summary of a LAS/LAZ header.
#[derive(Debug, Clone, PartialEq)]
pub struct LasInfo {
    pub number_of_points: u64,
    /// `[min_x, min_y, min_z]`
    pub min: [f64; 3],
    /// `[max_x, max_y, max_z]`
    pub max: [f64; 3],
}

impl LasInfo {
    /// XY center of the header bounds.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
        )
    }
}

pub fn is_las_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| LAS_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Open a reader on a LAS or LAZ file.
pub fn open_reader(path: &Path) -> Result<Reader> {
    let file = File::open(path)
        .map_err(|e| Error::NotFound(format!("{}: {}", path.display(), e)))?;
    Ok(Reader::new(BufReader::new(file))?)
}

pub fn read_info(path: &Path) -> Result<LasInfo> {
    let reader = open_reader(path)?;
    Ok(header_info(reader.header()))
}

pub(crate) fn header_info(header: &Header) -> LasInfo {
    let bounds = header.bounds();
    LasInfo {
        number_of_points: header.number_of_points(),
        min: [bounds.min.x, bounds.min.y, bounds.min.z],
        max: [bounds.max.x, bounds.max.y, bounds.max.z],
    }
}

#[derive(Debug, Clone, Copy)]
struct ExtraField {
    offset: usize,
    size: usize,
    data_type: u8,
    scale: Option<f64>,
    add_offset: Option<f64>,
}

impl ExtraField {
    fn decode(&self, bytes: &[u8]) -> Option<f64> {
        let raw = bytes.get(self.offset..self.offset + self.size)?;
        let value = match self.data_type {
            1 => raw[0] as f64,
            2 => raw[0] as i8 as f64,
            3 => u16::from_le_bytes(raw.try_into().ok()?) as f64,
            4 => i16::from_le_bytes(raw.try_into().ok()?) as f64,
            5 => u32::from_le_bytes(raw.try_into().ok()?) as f64,
            6 => i32::from_le_bytes(raw.try_into().ok()?) as f64,
            7 => u64::from_le_bytes(raw.try_into().ok()?) as f64,
            8 => i64::from_le_bytes(raw.try_into().ok()?) as f64,
            9 => f32::from_le_bytes(raw.try_into().ok()?) as f64,
            10 => f64::from_le_bytes(raw.try_into().ok()?),
            _ => return None,
        };
        Some(value * self.scale.unwrap_or(1.0) + self.add_offset.unwrap_or(0.0))
    }
}

fn extra_type_size(data_type: u8) -> Option<usize> {
    match data_type {
        1 | 2 => Some(1),
        3 | 4 => Some(2),
        5 | 6 | 9 => Some(4),
        7 | 8 | 10 => Some(8),
        _ => None,
    }
}

/// Named scalar fields described by the extra-bytes VLR, if any.
fn extra_fields(header: &Header) -> Vec<(String, ExtraField)> {
    let Some(vlr) = header
        .vlrs()
        .iter()
        .find(|v| v.user_id == EXTRA_BYTES_USER_ID && v.record_id == EXTRA_BYTES_RECORD_ID)
    else {
        return Vec::new();
    };

    let mut fields = Vec::new();
    let mut offset = 0;
    for desc in vlr.data.chunks_exact(EXTRA_BYTES_DESCRIPTOR_LEN) {
        let data_type = desc[2];
        let options = desc[3];
        let name = String::from_utf8_lossy(&desc[4..36])
            .trim_end_matches('\0')
            .to_string();
        let Some(size) = extra_type_size(data_type) else {
            // undocumented bytes: `options` holds their count
            offset += if data_type == 0 { options as usize } else { 0 };
            tracing::debug!("Skipping extra-bytes field '{}' of type {}", name, data_type);
            continue;
        };
        let read_f64 = |start: usize| {
            desc[start..start + 8]
                .try_into()
                .map(f64::from_le_bytes)
                .ok()
        };
        fields.push((
            name,
            ExtraField {
                offset,
                size,
                data_type,
                scale: if options & 0b1000 != 0 { read_f64(112) } else { None },
                add_offset: if options & 0b1_0000 != 0 { read_f64(136) } else { None },
            },
        ));
        offset += size;
    }
    fields
}

/// Read a LAS/LAZ file into a point cloud, keeping the selected attributes.
pub fn read_las(path: &Path, selection: &AttributeSelection) -> Result<PointCloud> {
    let mut reader = open_reader(path)?;
    let header = reader.header().clone();
    let format = header.point_format().clone();
    let n = header.number_of_points() as usize;
    let extras = extra_fields(&header);

    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);
    let mut standard: Vec<(&str, Vec<f64>)> = standard_attributes(&format)
        .into_iter()
        .filter(|name| selection.includes(name))
        .map(|name| (name, Vec::with_capacity(n)))
        .collect();
    let mut extra: Vec<(String, ExtraField, Vec<f64>)> = extras
        .into_iter()
        .filter(|(name, _)| selection.includes(name))
        .map(|(name, field)| (name, field, Vec::with_capacity(n)))
        .collect();

    for point in reader.points() {
        let point = point?;
        x.push(point.x);
        y.push(point.y);
        z.push(point.z);
        for (name, column) in standard.iter_mut() {
            column.push(standard_value(&point, name));
        }
        for (_, field, column) in extra.iter_mut() {
            column.push(field.decode(&point.extra_bytes).unwrap_or(f64::NAN));
        }
    }

    let mut cloud = PointCloud::new(x, y, z)?;
    for (name, column) in standard {
        cloud.set_attribute(name, column)?;
    }
    for (name, _, column) in extra {
        cloud.set_attribute(name, column)?;
    }
    if let AttributeSelection::Only(names) = selection {
        for name in names {
            cloud.require(name)?;
        }
    }
    tracing::debug!("Read {} points from {}", cloud.len(), path.display());
    Ok(cloud)
}

fn standard_attributes(format: &Format) -> Vec<&'static str> {
    let mut names = vec![
        "intensity",
        "return_number",
        "number_of_returns",
        "raw_classification",
        "scan_angle",
        "user_data",
        "point_source_id",
    ];
    if format.has_gps_time {
        names.push("gps_time");
    }
    if format.has_color {
        names.extend(["red", "green", "blue"]);
    }
    names
}

fn standard_value(point: &Point, name: &str) -> f64 {
    match name {
        "intensity" => point.intensity as f64,
        "return_number" => point.return_number as f64,
        "number_of_returns" => point.number_of_returns as f64,
        "raw_classification" => u8::from(point.classification) as f64,
        "scan_angle" => point.scan_angle as f64,
        "user_data" => point.user_data as f64,
        "point_source_id" => point.point_source_id as f64,
        "gps_time" => point.gps_time.unwrap_or(f64::NAN),
        "red" => point.color.map_or(f64::NAN, |c| c.red as f64),
        "green" => point.color.map_or(f64::NAN, |c| c.green as f64),
        "blue" => point.color.map_or(f64::NAN, |c| c.blue as f64),
        _ => f64::NAN,
    }
}

fn is_standard(name: &str) -> bool {
    matches!(
        name,
        "intensity"
            | "return_number"
            | "number_of_returns"
            | "raw_classification"
            | "scan_angle"
            | "user_data"
            | "point_source_id"
            | "gps_time"
    )
}

fn extra_bytes_vlr(names: &[&str]) -> Vlr {
    let mut data = Vec::with_capacity(names.len() * EXTRA_BYTES_DESCRIPTOR_LEN);
    for name in names {
        let mut desc = [0u8; EXTRA_BYTES_DESCRIPTOR_LEN];
        desc[2] = EXTRA_BYTES_F64;
        let bytes = name.as_bytes();
        let len = bytes.len().min(32);
        desc[4..4 + len].copy_from_slice(&bytes[..len]);
        data.extend_from_slice(&desc);
    }
    Vlr {
        user_id: EXTRA_BYTES_USER_ID.to_string(),
        record_id: EXTRA_BYTES_RECORD_ID,
        description: "laserfarm attributes".to_string(),
        data,
    }
}

/// Write `attributes` of `cloud` to a LAS (or, by extension, LAZ) file.
pub fn write_las(path: &Path, cloud: &PointCloud, attributes: &[String]) -> Result<()> {
    let mut format = Format::new(1)?;
    let extras: Vec<&str> = attributes
        .iter()
        .map(String::as_str)
        .filter(|a| !is_standard(a))
        .collect();
    format.extra_bytes = (extras.len() * 8) as u16;

    let mut builder = Builder::from((1, 2));
    builder.point_format = format;
    let offset = |values: &[f64]| {
        let (lo, _) = min_max(values);
        if lo.is_finite() {
            lo.floor()
        } else {
            0.0
        }
    };
    builder.transforms = Vector {
        x: Transform {
            scale: COORDINATE_SCALE,
            offset: offset(cloud.x()),
        },
        y: Transform {
            scale: COORDINATE_SCALE,
            offset: offset(cloud.y()),
        },
        z: Transform {
            scale: COORDINATE_SCALE,
            offset: offset(cloud.z()),
        },
    };
    if !extras.is_empty() {
        builder.vlrs.push(extra_bytes_vlr(&extras));
    }
    let header = builder.into_header()?;

    let standard: Vec<(&str, &[f64])> = attributes
        .iter()
        .filter(|a| is_standard(a))
        .map(|a| cloud.require(a).map(|c| (a.as_str(), c)))
        .collect::<Result<_>>()?;
    let extra_columns: Vec<&[f64]> = extras
        .iter()
        .map(|a| cloud.require(a))
        .collect::<Result<_>>()?;

    let mut writer = las::Writer::from_path(path, header)?;
    for i in 0..cloud.len() {
        let [x, y, z] = cloud.point(i);
        let mut point = Point {
            x,
            y,
            z,
            return_number: 1,
            number_of_returns: 1,
            gps_time: Some(0.0),
            ..Default::default()
        };
        for (name, column) in &standard {
            set_standard(&mut point, name, column[i])?;
        }
        point.extra_bytes = extra_columns
            .iter()
            .flat_map(|c| c[i].to_le_bytes())
            .collect();
        writer.write_point(point)?;
    }
    writer.close()?;
    tracing::debug!("Wrote {} points to {}", cloud.len(), path.display());
    Ok(())
}

fn set_standard(point: &mut Point, name: &str, value: f64) -> Result<()> {
    match name {
        "intensity" => point.intensity = value as u16,
        "return_number" => point.return_number = value as u8,
        "number_of_returns" => point.number_of_returns = value as u8,
        "raw_classification" => point.classification = Classification::new(value as u8)?,
        "scan_angle" => point.scan_angle = value as f32,
        "user_data" => point.user_data = value as u8,
        "point_source_id" => point.point_source_id = value as u16,
        "gps_time" => point.gps_time = Some(value),
        _ => {}
    }
    Ok(())
}
