//! Height normalization.

use std::collections::HashMap;

use super::point_cloud::{min_max, PointCloud};
use crate::error::{Error, Result};

/// Attribute added by [`normalize`].
pub const NORMALIZED_HEIGHT: &str = "normalized_height";

/// Add `normalized_height`: the height of each point above the lowest point
/// of its `cell_size x cell_size` cell.
///
/// Cells are aligned with the lower-left corner of the cloud.
pub fn normalize(cloud: &mut PointCloud, cell_size: f64) -> Result<()> {
    if !(cell_size > 0.0) {
        return Err(Error::InvalidInput("Cell size should be > 0.!".to_string()));
    }
    if cloud.is_empty() {
        return Err(Error::InvalidInput("Point cloud is empty!".to_string()));
    }

    let (min_x, _) = min_max(cloud.x());
    let (min_y, _) = min_max(cloud.y());
    let cell_of = |i: usize| {
        (
            ((cloud.x()[i] - min_x) / cell_size).floor() as i64,
            ((cloud.y()[i] - min_y) / cell_size).floor() as i64,
        )
    };

    let mut lowest: HashMap<(i64, i64), f64> = HashMap::new();
    for i in 0..cloud.len() {
        let z = cloud.z()[i];
        lowest
            .entry(cell_of(i))
            .and_modify(|m| *m = m.min(z))
            .or_insert(z);
    }

    let normalized: Vec<f64> = (0..cloud.len())
        .map(|i| cloud.z()[i] - lowest[&cell_of(i)])
        .collect();
    cloud.set_attribute(NORMALIZED_HEIGHT, normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_per_cell() {
        let mut pc = PointCloud::new(
            vec![0.1, 0.9, 1.1, 1.9],
            vec![0.1, 0.5, 0.1, 0.5],
            vec![10.0, 12.0, 20.0, 25.0],
        )
        .unwrap();
        normalize(&mut pc, 1.0).unwrap();
        assert_eq!(
            pc.attribute(NORMALIZED_HEIGHT).unwrap(),
            &[0.0, 2.0, 0.0, 5.0]
        );
    }

    #[test]
    fn test_normalize_single_cell() {
        let mut pc = PointCloud::new(vec![0.0, 5.0], vec![0.0, 5.0], vec![3.0, 4.0]).unwrap();
        normalize(&mut pc, 100.0).unwrap();
        assert_eq!(pc.attribute(NORMALIZED_HEIGHT).unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        let mut pc = PointCloud::new(vec![0.0], vec![0.0], vec![0.0]).unwrap();
        assert!(normalize(&mut pc, 0.0).is_err());
        assert!(normalize(&mut PointCloud::default(), 1.0).is_err());
    }
}
