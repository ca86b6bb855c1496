//! PLY point-cloud files.
//!
//! Points are written as a single `vertex` element in `binary_little_endian`
//! with every property stored as `double`. Reading accepts `ascii` and
//! `binary_little_endian` files with scalar properties of any type.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use crate::cloud::{AttributeSelection, PointCloud};
use crate::error::{Error, Result};

pub const PLY_EXTENSION: &str = "ply";

// Rows reserved up front; columns grow past this as data is read.
const MAX_RESERVED_ROWS: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "char" | "int8" => ScalarType::I8,
            "uchar" | "uint8" => ScalarType::U8,
            "short" | "int16" => ScalarType::I16,
            "ushort" | "uint16" => ScalarType::U16,
            "int" | "int32" => ScalarType::I32,
            "uint" | "uint32" => ScalarType::U32,
            "float" | "float32" => ScalarType::F32,
            "double" | "float64" => ScalarType::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }

    fn decode(self, b: &[u8]) -> f64 {
        match self {
            ScalarType::I8 => b[0] as i8 as f64,
            ScalarType::U8 => b[0] as f64,
            ScalarType::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            ScalarType::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            ScalarType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            ScalarType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            ScalarType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            ScalarType::F64 => {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<(String, ScalarType)>,
}

#[derive(Debug, Clone)]
struct PlyHeader {
    encoding: Encoding,
    elements: Vec<Element>,
}

fn malformed(path: &Path, what: impl std::fmt::Display) -> Error {
    Error::InvalidInput(format!("malformed PLY file {}: {}", path.display(), what))
}

fn read_header<R: BufRead>(path: &Path, reader: &mut R) -> Result<PlyHeader> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim_end() != "ply" {
        return Err(malformed(path, "missing magic number"));
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(malformed(path, "unterminated header"));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["end_header"] => break,
            ["format", "ascii", _] => encoding = Some(Encoding::Ascii),
            ["format", "binary_little_endian", _] => {
                encoding = Some(Encoding::BinaryLittleEndian)
            }
            ["format", other, _] => {
                return Err(Error::NotImplemented(format!(
                    "PLY format {} in {}",
                    other,
                    path.display()
                )))
            }
            ["comment", ..] | ["obj_info", ..] | [] => {}
            ["element", name, count] => elements.push(Element {
                name: name.to_string(),
                count: count
                    .parse()
                    .map_err(|_| malformed(path, format!("bad element count '{}'", count)))?,
                properties: Vec::new(),
            }),
            ["property", "list", ..] => {
                return Err(Error::NotImplemented(format!(
                    "PLY list properties in {}",
                    path.display()
                )))
            }
            ["property", ty, name] => {
                let ty = ScalarType::parse(ty)
                    .ok_or_else(|| malformed(path, format!("unknown type '{}'", ty)))?;
                elements
                    .last_mut()
                    .ok_or_else(|| malformed(path, "property before element"))?
                    .properties
                    .push((name.to_string(), ty));
            }
            _ => return Err(malformed(path, format!("unexpected line '{}'", line.trim()))),
        }
    }
    let encoding = encoding.ok_or_else(|| malformed(path, "missing format line"))?;
    Ok(PlyHeader { encoding, elements })
}

/// Number of vertices declared in the header of a PLY file.
pub fn read_vertex_count(path: &Path) -> Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(path, &mut reader)?;
    header
        .elements
        .iter()
        .find(|e| e.name == "vertex")
        .map(|e| e.count)
        .ok_or_else(|| malformed(path, "no vertex element"))
}

/// Read the `vertex` element of a PLY file into a point cloud.
pub fn read_ply(path: &Path, selection: &AttributeSelection) -> Result<PointCloud> {
    let file = File::open(path)
        .map_err(|e| Error::NotFound(format!("{}: {}", path.display(), e)))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let header = read_header(path, &mut reader)?;

    let mut columns: Option<Vec<Vec<f64>>> = None;
    let mut vertex_props = Vec::new();
    for element in &header.elements {
        let available = file_len.saturating_sub(reader.stream_position()?);
        check_element_fits(path, header.encoding, element, available)?;
        let values = read_element(path, &mut reader, header.encoding, element)?;
        if element.name == "vertex" {
            columns = Some(values);
            vertex_props = element.properties.clone();
            break;
        }
    }
    let mut columns = columns.ok_or_else(|| malformed(path, "no vertex element"))?;

    let position = |name: &str| vertex_props.iter().position(|(p, _)| p == name);
    let (Some(ix), Some(iy), Some(iz)) = (position("x"), position("y"), position("z")) else {
        return Err(malformed(path, "vertex element without x, y, z"));
    };
    let x = std::mem::take(&mut columns[ix]);
    let y = std::mem::take(&mut columns[iy]);
    let z = std::mem::take(&mut columns[iz]);
    let mut cloud = PointCloud::new(x, y, z)?;
    for (i, (name, _)) in vertex_props.iter().enumerate() {
        if i == ix || i == iy || i == iz || !selection.includes(name) {
            continue;
        }
        cloud.set_attribute(name.clone(), std::mem::take(&mut columns[i]))?;
    }
    if let AttributeSelection::Only(names) = selection {
        for name in names {
            cloud.require(name)?;
        }
    }
    tracing::debug!("Read {} points from {}", cloud.len(), path.display());
    Ok(cloud)
}

/// Reject elements whose declared row count cannot be stored in the
/// `available` bytes left in the file.
fn check_element_fits(
    path: &Path,
    encoding: Encoding,
    element: &Element,
    available: u64,
) -> Result<()> {
    let needed = match encoding {
        // at least one byte per row
        Encoding::Ascii if element.properties.is_empty() => Some(0),
        Encoding::Ascii => Some(element.count as u64),
        Encoding::BinaryLittleEndian => {
            let row_size: u64 = element.properties.iter().map(|(_, t)| t.size() as u64).sum();
            (element.count as u64).checked_mul(row_size)
        }
    };
    match needed {
        Some(needed) if needed <= available => Ok(()),
        _ => Err(malformed(
            path,
            format!(
                "element {} declares {} rows, more than the {} bytes left",
                element.name, element.count, available
            ),
        )),
    }
}

/// One column per property.
fn read_element<R: BufRead>(
    path: &Path,
    reader: &mut R,
    encoding: Encoding,
    element: &Element,
) -> Result<Vec<Vec<f64>>> {
    let n_props = element.properties.len();
    let mut columns = vec![Vec::with_capacity(element.count.min(MAX_RESERVED_ROWS)); n_props];
    match encoding {
        Encoding::Ascii => {
            let mut line = String::new();
            for _ in 0..element.count {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    return Err(malformed(path, "unexpected end of data"));
                }
                let mut fields = line.split_whitespace();
                for column in columns.iter_mut() {
                    let value = fields
                        .next()
                        .and_then(|f| f.parse::<f64>().ok())
                        .ok_or_else(|| malformed(path, format!("bad row '{}'", line.trim())))?;
                    column.push(value);
                }
            }
        }
        Encoding::BinaryLittleEndian => {
            let row_size: usize = element.properties.iter().map(|(_, t)| t.size()).sum();
            let mut row = vec![0u8; row_size];
            for _ in 0..element.count {
                reader.read_exact(&mut row)?;
                let mut offset = 0;
                for ((_, ty), column) in element.properties.iter().zip(columns.iter_mut()) {
                    column.push(ty.decode(&row[offset..offset + ty.size()]));
                    offset += ty.size();
                }
            }
        }
    }
    Ok(columns)
}

/// Write `x`, `y`, `z` and `attributes` of `cloud` as a binary PLY file.
pub fn write_ply(path: &Path, cloud: &PointCloud, attributes: &[String]) -> Result<()> {
    let mut names: Vec<&str> = vec!["x", "y", "z"];
    names.extend(
        attributes
            .iter()
            .map(String::as_str)
            .filter(|a| !["x", "y", "z"].contains(a)),
    );
    let columns = names
        .iter()
        .map(|n| cloud.require(n))
        .collect::<Result<Vec<_>>>()?;

    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ply")?;
    writeln!(out, "format binary_little_endian 1.0")?;
    writeln!(out, "comment written by laserfarm {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "element vertex {}", cloud.len())?;
    for name in &names {
        writeln!(out, "property double {}", name)?;
    }
    writeln!(out, "end_header")?;
    for i in 0..cloud.len() {
        for column in &columns {
            out.write_all(&column[i].to_le_bytes())?;
        }
    }
    out.flush()?;
    tracing::debug!("Wrote {} points to {}", cloud.len(), path.display());
    Ok(())
}
