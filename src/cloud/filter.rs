//! Point selection filters.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::point_cloud::PointCloud;
use super::polygon::MultiPolygon;
use crate::error::{Error, Result};

/// Names accepted by [`Filter::from_name`].
pub const FILTER_NAMES: [&str; 4] = [
    "select_above",
    "select_below",
    "select_equal",
    "select_polygon",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdParams {
    attribute: String,
    threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(f64),
    Many(Vec<f64>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EqualParams {
    attribute: String,
    value: OneOrMany,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolygonParams {
    polygon_string: String,
    #[serde(default)]
    read_from_file: bool,
}

/// A configured point filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Keep points whose attribute is strictly above the threshold.
    Above { attribute: String, threshold: f64 },
    /// Keep points whose attribute is strictly below the threshold.
    Below { attribute: String, threshold: f64 },
    /// Keep points whose attribute equals any of the values.
    Equal { attribute: String, values: Vec<f64> },
    /// Keep points inside the region.
    Polygon(MultiPolygon),
}

fn params<T: DeserializeOwned>(name: &str, input: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(input))
        .map_err(|e| Error::InvalidInput(format!("invalid input for filter {}: {}", name, e)))
}

impl Filter {
    /// Build a filter from its name and keyword parameters.
    pub fn from_name(name: &str, input: Map<String, Value>) -> Result<Self> {
        match name {
            "select_above" => {
                let p: ThresholdParams = params(name, input)?;
                Ok(Filter::Above {
                    attribute: p.attribute,
                    threshold: p.threshold,
                })
            }
            "select_below" => {
                let p: ThresholdParams = params(name, input)?;
                Ok(Filter::Below {
                    attribute: p.attribute,
                    threshold: p.threshold,
                })
            }
            "select_equal" => {
                let p: EqualParams = params(name, input)?;
                let values = match p.value {
                    OneOrMany::One(v) => vec![v],
                    OneOrMany::Many(vs) => vs,
                };
                Ok(Filter::Equal {
                    attribute: p.attribute,
                    values,
                })
            }
            "select_polygon" => {
                let p: PolygonParams = params(name, input)?;
                let region = if p.read_from_file {
                    read_polygon_file(Path::new(&p.polygon_string))?
                } else {
                    MultiPolygon::from_wkt(&p.polygon_string)?
                };
                Ok(Filter::Polygon(region))
            }
            other => Err(Error::InvalidInput(format!(
                "Invalid attribute: {}. Choose between: {}",
                other,
                FILTER_NAMES.join(", ")
            ))),
        }
    }

    /// Mask of the points kept by this filter.
    pub fn mask(&self, cloud: &PointCloud) -> Result<Vec<bool>> {
        Ok(match self {
            Filter::Above {
                attribute,
                threshold,
            } => cloud.require(attribute)?.iter().map(|v| v > threshold).collect(),
            Filter::Below {
                attribute,
                threshold,
            } => cloud.require(attribute)?.iter().map(|v| v < threshold).collect(),
            Filter::Equal { attribute, values } => cloud
                .require(attribute)?
                .iter()
                .map(|v| values.contains(v))
                .collect(),
            Filter::Polygon(region) => region.contains_points(cloud.x(), cloud.y()),
        })
    }

    /// Filtered copy of `cloud`.
    pub fn apply(&self, cloud: &PointCloud) -> Result<PointCloud> {
        let mask = self.mask(cloud)?;
        Ok(cloud.select(&mask))
    }
}

fn read_polygon_file(path: &Path) -> Result<MultiPolygon> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("geojson") | Some("json") => MultiPolygon::from_geojson_file(path),
        _ => MultiPolygon::from_wkt(&std::fs::read_to_string(path)?),
    }
}
