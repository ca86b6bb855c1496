//! Single-band GeoTIFF output.
//!
//! [`TiffWriter`] writes uncompressed float32 GeoTIFFs with no external
//! dependency. With the `gdal` feature, [`GdalWriter`] writes LZW-compressed
//! files through GDAL instead.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::{Error, Result};

/// Affine transform from pixel to world coordinates.
///
/// ```text
/// x_world = a * col + b * row + c
/// y_world = d * col + e * row + f
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// Pixel width
    pub a: f64,
    pub b: f64,
    /// X of the upper-left corner
    pub c: f64,
    pub d: f64,
    /// Pixel height, negative for north-up rasters
    pub e: f64,
    /// Y of the upper-left corner
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform with the upper-left corner at `(x_min, y_max)`.
    pub fn north_up(x_min: f64, y_max: f64, x_res: f64, y_res: f64) -> Self {
        Self {
            a: x_res,
            b: 0.0,
            c: x_min,
            d: 0.0,
            e: -y_res,
            f: y_max,
        }
    }

    /// Coefficients in GDAL order: `[c, a, b, f, d, e]`.
    pub fn to_gdal(&self) -> [f64; 6] {
        [self.c, self.a, self.b, self.f, self.d, self.e]
    }
}

/// Writes one raster band to `<stem>.tif`.
pub trait RasterWriter: Send + Sync {
    fn write_band(
        &self,
        stem: &Path,
        data: &Array2<f64>,
        transform: &GeoTransform,
        epsg: u32,
        band_name: &str,
    ) -> Result<PathBuf>;
}

/// GDAL-backed writer when built with the `gdal` feature, native otherwise.
pub fn default_raster_writer() -> Box<dyn RasterWriter> {
    #[cfg(feature = "gdal")]
    {
        Box::new(GdalWriter)
    }
    #[cfg(not(feature = "gdal"))]
    {
        Box::new(TiffWriter)
    }
}

fn tif_path(stem: &Path) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    name.push(".tif");
    PathBuf::from(name)
}

// TIFF field types
const SHORT: u16 = 3;
const LONG: u16 = 4;
const ASCII: u16 = 2;
const DOUBLE: u16 = 12;

const HEADER_LEN: u32 = 8;

struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    bytes: Vec<u8>,
}

impl Entry {
    fn shorts(tag: u16, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: SHORT,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn long(tag: u16, value: u32) -> Self {
        Self {
            tag,
            field_type: LONG,
            count: 1,
            bytes: value.to_le_bytes().to_vec(),
        }
    }

    fn doubles(tag: u16, values: &[f64]) -> Self {
        Self {
            tag,
            field_type: DOUBLE,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn ascii(tag: u16, text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        Self {
            tag,
            field_type: ASCII,
            count: bytes.len() as u32,
            bytes,
        }
    }
}

/// Native float32 GeoTIFF writer, one uncompressed strip.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiffWriter;

impl TiffWriter {
    fn geo_keys(epsg: u32) -> Result<Vec<u16>> {
        let code = u16::try_from(epsg)
            .map_err(|_| Error::Raster(format!("EPSG code {} out of range", epsg)))?;
        // geographic systems live in the 4000 range
        let (model_type, cs_key) = if (4000..5000).contains(&code) {
            (2, 2048)
        } else {
            (1, 3072)
        };
        Ok(vec![
            1, 1, 0, 3, // directory header: version, revision, minor, key count
            1024, 0, 1, model_type, // GTModelTypeGeoKey
            1025, 0, 1, 1, // GTRasterTypeGeoKey: pixel is area
            cs_key, 0, 1, code,
        ])
    }
}

impl RasterWriter for TiffWriter {
    fn write_band(
        &self,
        stem: &Path,
        data: &Array2<f64>,
        transform: &GeoTransform,
        epsg: u32,
        band_name: &str,
    ) -> Result<PathBuf> {
        let (nrows, ncols) = data.dim();
        if nrows == 0 || ncols == 0 {
            return Err(Error::Raster("cannot write an empty raster".to_string()));
        }
        let image_len = u32::try_from(nrows * ncols * 4)
            .map_err(|_| Error::Raster(format!("raster {}x{} too large", nrows, ncols)))?;

        let metadata = format!(
            "<GDALMetadata><Item name=\"band\">{0}</Item>\
             <Item name=\"band_key\" sample=\"0\">{0}</Item></GDALMetadata>",
            band_name
        );
        let entries = vec![
            Entry::long(256, ncols as u32),
            Entry::long(257, nrows as u32),
            Entry::shorts(258, &[32]),
            Entry::shorts(259, &[1]),
            Entry::shorts(262, &[1]),
            Entry::long(273, HEADER_LEN),
            Entry::shorts(277, &[1]),
            Entry::long(278, nrows as u32),
            Entry::long(279, image_len),
            Entry::shorts(284, &[1]),
            Entry::shorts(339, &[3]),
            Entry::doubles(33550, &[transform.a, -transform.e, 0.0]),
            Entry::doubles(33922, &[0.0, 0.0, 0.0, transform.c, transform.f, 0.0]),
            Entry::shorts(34735, &Self::geo_keys(epsg)?),
            Entry::ascii(42112, &metadata),
            Entry::ascii(42113, "nan"),
        ];

        let path = tif_path(stem);
        let mut out = BufWriter::new(File::create(&path)?);
        let ifd_offset = HEADER_LEN + image_len;
        out.write_all(b"II")?;
        out.write_all(&42u16.to_le_bytes())?;
        out.write_all(&ifd_offset.to_le_bytes())?;
        for value in data.iter() {
            out.write_all(&(*value as f32).to_le_bytes())?;
        }

        let ifd_len = 2 + 12 * entries.len() as u32 + 4;
        let mut overflow_offset = ifd_offset + ifd_len;
        let mut overflow = Vec::new();
        out.write_all(&(entries.len() as u16).to_le_bytes())?;
        for entry in &entries {
            out.write_all(&entry.tag.to_le_bytes())?;
            out.write_all(&entry.field_type.to_le_bytes())?;
            out.write_all(&entry.count.to_le_bytes())?;
            if entry.bytes.len() <= 4 {
                let mut inline = [0u8; 4];
                inline[..entry.bytes.len()].copy_from_slice(&entry.bytes);
                out.write_all(&inline)?;
            } else {
                out.write_all(&overflow_offset.to_le_bytes())?;
                overflow.extend_from_slice(&entry.bytes);
                // keep values word aligned
                if overflow.len() % 2 == 1 {
                    overflow.push(0);
                }
                overflow_offset = ifd_offset + ifd_len + overflow.len() as u32;
            }
        }
        out.write_all(&0u32.to_le_bytes())?;
        out.write_all(&overflow)?;
        out.flush()?;
        Ok(path)
    }
}

/// GDAL GeoTIFF writer (`GTiff`, float32, LZW).
#[cfg(feature = "gdal")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalWriter;

#[cfg(feature = "gdal")]
impl RasterWriter for GdalWriter {
    fn write_band(
        &self,
        stem: &Path,
        data: &Array2<f64>,
        transform: &GeoTransform,
        epsg: u32,
        band_name: &str,
    ) -> Result<PathBuf> {
        use gdal::raster::{Buffer, RasterCreationOptions};
        use gdal::spatial_ref::SpatialRef;
        use gdal::{DriverManager, Metadata};

        let raster_err = |e: gdal::errors::GdalError| Error::Raster(e.to_string());
        let (nrows, ncols) = data.dim();
        let path = tif_path(stem);

        let driver = DriverManager::get_driver_by_name("GTiff").map_err(raster_err)?;
        let mut options = RasterCreationOptions::new();
        options
            .set_name_value("COMPRESS", "LZW")
            .map_err(raster_err)?;
        let mut dataset = driver
            .create_with_band_type_with_options::<f32, _>(&path, ncols, nrows, 1, &options)
            .map_err(raster_err)?;
        dataset
            .set_geo_transform(&transform.to_gdal())
            .map_err(raster_err)?;
        let srs = SpatialRef::from_epsg(epsg).map_err(raster_err)?;
        dataset.set_spatial_ref(&srs).map_err(raster_err)?;
        dataset
            .set_metadata_item("band", band_name, "")
            .map_err(raster_err)?;

        let mut band = dataset.rasterband(1).map_err(raster_err)?;
        band.set_metadata_item("band_key", band_name, "")
            .map_err(raster_err)?;
        let values: Vec<f32> = data.iter().map(|v| *v as f32).collect();
        let mut buffer = Buffer::new((ncols, nrows), values);
        band.write((0, 0), (ncols, nrows), &mut buffer)
            .map_err(raster_err)?;
        Ok(path)
    }
}
