//! Planar polygons from WKT or GeoJSON and point-in-polygon tests.

use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

/// Polygon with an outer ring and optional holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    exterior: Vec<[f64; 2]>,
    holes: Vec<Vec<[f64; 2]>>,
}

impl Polygon {
    pub fn new(exterior: Vec<[f64; 2]>, holes: Vec<Vec<[f64; 2]>>) -> Result<Self> {
        if exterior.len() < 3 {
            return Err(Error::InvalidInput(
                "polygon ring needs at least 3 vertices".to_string(),
            ));
        }
        Ok(Self { exterior, holes })
    }

    /// `[min_x, min_y, max_x, max_y]` of the outer ring.
    pub fn bbox(&self) -> [f64; 4] {
        self.exterior.iter().fold(
            [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY],
            |b, p| [b[0].min(p[0]), b[1].min(p[1]), b[2].max(p[0]), b[3].max(p[1])],
        )
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let b = self.bbox();
        if x < b[0] || x > b[2] || y < b[1] || y > b[3] {
            return false;
        }
        ring_contains(&self.exterior, x, y) && !self.holes.iter().any(|h| ring_contains(h, x, y))
    }
}

/// Even-odd ray casting.
fn ring_contains(ring: &[[f64; 2]], x: f64, y: f64) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// One or more polygons treated as a single region.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiPolygon(pub Vec<Polygon>);

impl MultiPolygon {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.0.iter().any(|p| p.contains(x, y))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combined bounding box, `None` when empty.
    pub fn bbox(&self) -> Option<[f64; 4]> {
        self.0.iter().map(Polygon::bbox).reduce(|a, b| {
            [a[0].min(b[0]), a[1].min(b[1]), a[2].max(b[2]), a[3].max(b[3])]
        })
    }

    /// Mask of the points that fall inside the region.
    pub fn contains_points(&self, xs: &[f64], ys: &[f64]) -> Vec<bool> {
        xs.iter().zip(ys).map(|(&x, &y)| self.contains(x, y)).collect()
    }

    /// Parse a WKT `POLYGON` or `MULTIPOLYGON`.
    pub fn from_wkt(wkt: &str) -> Result<Self> {
        let text = wkt.trim();
        let upper = text.to_ascii_uppercase();
        let bad = || Error::InvalidInput(format!("unsupported or malformed WKT: {}", wkt));

        if let Some(body) = upper.strip_prefix("MULTIPOLYGON") {
            let offset = text.len() - body.len();
            let groups = split_groups(strip_parens(text[offset..].trim()).ok_or_else(bad)?)
                .ok_or_else(bad)?;
            let polygons = groups
                .into_iter()
                .map(|g| parse_wkt_polygon(strip_parens(g.trim()).ok_or_else(bad)?))
                .collect::<Result<Vec<_>>>()?;
            Ok(MultiPolygon(polygons))
        } else if let Some(body) = upper.strip_prefix("POLYGON") {
            let offset = text.len() - body.len();
            let inner = strip_parens(text[offset..].trim()).ok_or_else(bad)?;
            Ok(MultiPolygon(vec![parse_wkt_polygon(inner)?]))
        } else {
            Err(bad())
        }
    }

    /// Read polygons from a GeoJSON file (geometry, feature or collection).
    pub fn from_geojson_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_geojson(&value)
    }

    pub fn from_geojson(value: &Value) -> Result<Self> {
        let mut polygons = Vec::new();
        collect_geojson(value, &mut polygons)?;
        Ok(MultiPolygon(polygons))
    }
}

fn strip_parens(s: &str) -> Option<&str> {
    s.strip_prefix('(')?.strip_suffix(')')
}

/// Split `(a), (b), (c)` at top-level commas.
fn split_groups(s: &str) -> Option<Vec<&str>> {
    let mut groups = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                groups.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return None;
        }
    }
    groups.push(&s[start..]);
    Some(groups)
}

fn parse_wkt_polygon(body: &str) -> Result<Polygon> {
    let bad = || Error::InvalidInput(format!("malformed WKT polygon: {}", body));
    let mut rings = split_groups(body)
        .ok_or_else(bad)?
        .into_iter()
        .map(|ring| {
            strip_parens(ring.trim())
                .ok_or_else(bad)?
                .split(',')
                .map(|pair| {
                    let mut coords = pair.split_whitespace().map(str::parse::<f64>);
                    match (coords.next(), coords.next()) {
                        (Some(Ok(x)), Some(Ok(y))) => Ok([x, y]),
                        _ => Err(bad()),
                    }
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let exterior = rings.next().ok_or_else(bad)?;
    Polygon::new(exterior, rings.collect())
}

fn geojson_ring(value: &Value) -> Result<Vec<[f64; 2]>> {
    let bad = || Error::InvalidInput("malformed GeoJSON ring".to_string());
    value
        .as_array()
        .ok_or_else(bad)?
        .iter()
        .map(|pos| {
            let pos = pos.as_array().ok_or_else(bad)?;
            match (pos.first().and_then(Value::as_f64), pos.get(1).and_then(Value::as_f64)) {
                (Some(x), Some(y)) => Ok([x, y]),
                _ => Err(bad()),
            }
        })
        .collect()
}

fn geojson_polygon(coordinates: &Value) -> Result<Polygon> {
    let rings = coordinates
        .as_array()
        .ok_or_else(|| Error::InvalidInput("malformed GeoJSON polygon".to_string()))?
        .iter()
        .map(geojson_ring)
        .collect::<Result<Vec<_>>>()?;
    let mut rings = rings.into_iter();
    let exterior = rings
        .next()
        .ok_or_else(|| Error::InvalidInput("GeoJSON polygon without rings".to_string()))?;
    Polygon::new(exterior, rings.collect())
}

fn collect_geojson(value: &Value, out: &mut Vec<Polygon>) -> Result<()> {
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            for feature in value
                .get("features")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                collect_geojson(feature, out)?;
            }
        }
        Some("Feature") => {
            if let Some(geometry) = value.get("geometry").filter(|g| !g.is_null()) {
                collect_geojson(geometry, out)?;
            }
        }
        Some("GeometryCollection") => {
            for geometry in value
                .get("geometries")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                collect_geojson(geometry, out)?;
            }
        }
        Some("Polygon") => out.push(geojson_polygon(&value["coordinates"])?),
        Some("MultiPolygon") => {
            for polygon in value["coordinates"].as_array().into_iter().flatten() {
                out.push(geojson_polygon(polygon)?);
            }
        }
        Some(other) => {
            tracing::debug!("Skipping non-polygonal GeoJSON geometry {}", other);
        }
        None => {
            return Err(Error::InvalidInput(
                "GeoJSON object without a type".to_string(),
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wkt_polygon_with_hole() {
        let region = MultiPolygon::from_wkt(
            "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (4 4, 6 4, 6 6, 4 6, 4 4))",
        )
        .unwrap();
        assert!(region.contains(1.0, 1.0));
        assert!(!region.contains(5.0, 5.0));
        assert!(!region.contains(11.0, 5.0));
    }

    #[test]
    fn test_wkt_multipolygon() {
        let region = MultiPolygon::from_wkt(
            "MULTIPOLYGON (((0 0, 1 0, 1 1, 0 1, 0 0)), ((5 5, 6 5, 6 6, 5 6, 5 5)))",
        )
        .unwrap();
        assert_eq!(region.0.len(), 2);
        assert_eq!(
            region.contains_points(&[0.5, 5.5, 3.0], &[0.5, 5.5, 3.0]),
            vec![true, true, false]
        );
        assert_eq!(region.bbox(), Some([0.0, 0.0, 6.0, 6.0]));
    }

    #[test]
    fn test_wkt_rejects_other_geometries() {
        assert!(MultiPolygon::from_wkt("POINT (1 2)").is_err());
        assert!(MultiPolygon::from_wkt("POLYGON ((0 0, 1 1))").is_err());
    }

    #[test]
    fn test_geojson_feature_collection() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[0, 0], [2, 0], [2, 2], [0, 2], [0, 0]]]}},
                {"type": "Feature", "properties": {},
                 "geometry": {"type": "Point", "coordinates": [9, 9]}}
            ]
        });
        let region = MultiPolygon::from_geojson(&value).unwrap();
        assert_eq!(region.0.len(), 1);
        assert!(region.contains(1.0, 1.0));
        assert!(!region.contains(3.0, 1.0));
    }
}
