//! Column-oriented in-memory point cloud.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Coordinate attribute names, always present.
pub const COORDINATES: [&str; 3] = ["x", "y", "z"];

/// Attribute selection for loading and exporting.
///
/// Deserializes from `"all"`, a single attribute name or a list of names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawSelection")]
pub enum AttributeSelection {
    #[default]
    All,
    Only(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelection {
    One(String),
    Many(Vec<String>),
}

impl From<RawSelection> for AttributeSelection {
    fn from(raw: RawSelection) -> Self {
        match raw {
            RawSelection::One(name) if name == "all" => AttributeSelection::All,
            RawSelection::One(name) => AttributeSelection::Only(vec![name]),
            RawSelection::Many(names) => AttributeSelection::Only(names),
        }
    }
}

impl AttributeSelection {
    /// Non-coordinate attributes of `cloud` covered by this selection.
    ///
    /// Explicitly requested attributes must exist.
    pub fn resolve(&self, cloud: &PointCloud) -> Result<Vec<String>> {
        match self {
            AttributeSelection::All => Ok(cloud.attribute_names().map(str::to_string).collect()),
            AttributeSelection::Only(names) => {
                let mut resolved = Vec::with_capacity(names.len());
                for name in names {
                    if COORDINATES.contains(&name.as_str()) {
                        continue;
                    }
                    cloud.require(name)?;
                    resolved.push(name.clone());
                }
                Ok(resolved)
            }
        }
    }

    /// Whether `name` is covered, for readers that filter while loading.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            AttributeSelection::All => true,
            AttributeSelection::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Point cloud with x, y, z coordinates and any number of per-point
/// attributes stored as `f64` columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    attributes: BTreeMap<String, Vec<f64>>,
}

impl PointCloud {
    pub fn new(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() || x.len() != z.len() {
            return Err(Error::InvalidInput(format!(
                "coordinate arrays differ in length: {}, {}, {}",
                x.len(),
                y.len(),
                z.len()
            )));
        }
        Ok(Self {
            x,
            y,
            z,
            attributes: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn z(&self) -> &[f64] {
        &self.z
    }

    /// Any column by name, coordinates included.
    pub fn attribute(&self, name: &str) -> Option<&[f64]> {
        match name {
            "x" => Some(&self.x),
            "y" => Some(&self.y),
            "z" => Some(&self.z),
            _ => self.attributes.get(name).map(Vec::as_slice),
        }
    }

    /// Like [`attribute`](Self::attribute), failing if the column is missing.
    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.attribute(name).ok_or_else(|| {
            Error::InvalidInput(format!("attribute '{}' not in point cloud", name))
        })
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// Names of the non-coordinate attributes, sorted.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Add or replace a non-coordinate attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if COORDINATES.contains(&name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "cannot overwrite coordinate '{}'",
                name
            )));
        }
        if values.len() != self.len() {
            return Err(Error::InvalidInput(format!(
                "attribute '{}' has {} values for {} points",
                name,
                values.len(),
                self.len()
            )));
        }
        self.attributes.insert(name, values);
        Ok(())
    }

    /// Coordinates of point `i`.
    pub fn point(&self, i: usize) -> [f64; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    /// Points for which `mask` is true.
    pub fn select(&self, mask: &[bool]) -> Self {
        let pick = |values: &[f64]| -> Vec<f64> {
            values
                .iter()
                .zip(mask)
                .filter_map(|(v, keep)| keep.then_some(*v))
                .collect()
        };
        Self {
            x: pick(&self.x),
            y: pick(&self.y),
            z: pick(&self.z),
            attributes: self
                .attributes
                .iter()
                .map(|(name, values)| (name.clone(), pick(values)))
                .collect(),
        }
    }

    /// Append the points of `other`.
    ///
    /// Appending to an empty cloud adopts `other`'s attributes; otherwise
    /// both clouds must carry the same attributes.
    pub fn append(&mut self, other: PointCloud) -> Result<()> {
        if self.is_empty() && self.attributes.is_empty() {
            *self = other;
            return Ok(());
        }
        let ours: Vec<&String> = self.attributes.keys().collect();
        let theirs: Vec<&String> = other.attributes.keys().collect();
        if ours != theirs {
            return Err(Error::InvalidInput(format!(
                "cannot merge point clouds with different attributes: {:?} vs {:?}",
                ours, theirs
            )));
        }
        self.x.extend(other.x);
        self.y.extend(other.y);
        self.z.extend(other.z);
        for (name, values) in other.attributes {
            if let Some(column) = self.attributes.get_mut(&name) {
                column.extend(values);
            }
        }
        Ok(())
    }

    /// `[min_x, min_y, max_x, max_y]`, or `None` for an empty cloud.
    pub fn bounds(&self) -> Option<[f64; 4]> {
        if self.is_empty() {
            return None;
        }
        let (min_x, max_x) = min_max(&self.x);
        let (min_y, max_y) = min_max(&self.y);
        Some([min_x, min_y, max_x, max_y])
    }
}

pub(crate) fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PointCloud {
        let mut pc = PointCloud::new(
            vec![0.0, 1.0, 2.0],
            vec![5.0, 4.0, 3.0],
            vec![1.0, 2.0, 3.0],
        )
        .unwrap();
        pc.set_attribute("intensity", vec![10.0, 20.0, 30.0]).unwrap();
        pc
    }

    #[test]
    fn test_new_checks_lengths() {
        assert!(PointCloud::new(vec![0.0], vec![], vec![0.0]).is_err());
    }

    #[test]
    fn test_attribute_access() {
        let pc = sample();
        assert_eq!(pc.attribute("z").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(pc.attribute("intensity").unwrap(), &[10.0, 20.0, 30.0]);
        assert!(pc.require("gps_time").is_err());
        assert_eq!(pc.attribute_names().collect::<Vec<_>>(), vec!["intensity"]);
    }

    #[test]
    fn test_set_attribute_validates() {
        let mut pc = sample();
        assert!(pc.set_attribute("x", vec![0.0; 3]).is_err());
        assert!(pc.set_attribute("a", vec![0.0; 2]).is_err());
    }

    #[test]
    fn test_select() {
        let pc = sample().select(&[true, false, true]);
        assert_eq!(pc.x(), &[0.0, 2.0]);
        assert_eq!(pc.attribute("intensity").unwrap(), &[10.0, 30.0]);
    }

    #[test]
    fn test_append() {
        let mut pc = PointCloud::default();
        pc.append(sample()).unwrap();
        pc.append(sample()).unwrap();
        assert_eq!(pc.len(), 6);
        assert_eq!(pc.attribute("intensity").unwrap().len(), 6);

        let bare = PointCloud::new(vec![1.0], vec![1.0], vec![1.0]).unwrap();
        assert!(pc.append(bare).is_err());
    }

    #[test]
    fn test_bounds() {
        assert_eq!(sample().bounds(), Some([0.0, 3.0, 2.0, 5.0]));
        assert_eq!(PointCloud::default().bounds(), None);
    }

    #[test]
    fn test_attribute_selection_deserialize() {
        let all: AttributeSelection = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, AttributeSelection::All);
        let one: AttributeSelection = serde_json::from_str("\"intensity\"").unwrap();
        assert_eq!(one, AttributeSelection::Only(vec!["intensity".into()]));
        let many: AttributeSelection = serde_json::from_str("[\"a\", \"b\"]").unwrap();
        assert_eq!(many, AttributeSelection::Only(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_attribute_selection_resolve() {
        let pc = sample();
        assert_eq!(AttributeSelection::All.resolve(&pc).unwrap(), vec!["intensity"]);
        let only = AttributeSelection::Only(vec!["x".into(), "intensity".into()]);
        assert_eq!(only.resolve(&pc).unwrap(), vec!["intensity"]);
        let missing = AttributeSelection::Only(vec!["nope".into()]);
        assert!(missing.resolve(&pc).is_err());
    }
}
