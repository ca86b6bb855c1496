//! Neighborhood volumes and R-tree neighbor lookup.

use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};

use super::point_cloud::PointCloud;
use crate::error::{Error, Result};

/// Names accepted by [`Volume::build`].
pub const VOLUME_TYPES: [&str; 3] = ["infinite_cylinder", "sphere", "cell"];

/// Shape of the neighborhood around a target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Volume {
    /// All points within `radius` in the XY plane.
    InfiniteCylinder { radius: f64 },
    /// All points within `radius` in 3D.
    Sphere { radius: f64 },
    /// All points in the axis-aligned square of side `side_length`
    /// centered on the target.
    Cell { side_length: f64 },
}

impl Volume {
    pub fn build(volume_type: &str, size: f64) -> Result<Self> {
        if !(size > 0.0) {
            return Err(Error::InvalidInput(format!(
                "volume size must be > 0, got {}",
                size
            )));
        }
        match volume_type {
            "infinite_cylinder" => Ok(Volume::InfiniteCylinder { radius: size }),
            "sphere" => Ok(Volume::Sphere { radius: size }),
            "cell" => Ok(Volume::Cell { side_length: size }),
            other => Err(Error::InvalidInput(format!(
                "Invalid volume type: {}. Choose between: {}",
                other,
                VOLUME_TYPES.join(", ")
            ))),
        }
    }

    /// Footprint area for 2D volumes, volume for the sphere.
    pub fn measure(&self) -> f64 {
        match *self {
            Volume::InfiniteCylinder { radius } => std::f64::consts::PI * radius * radius,
            Volume::Sphere { radius } => 4.0 / 3.0 * std::f64::consts::PI * radius.powi(3),
            Volume::Cell { side_length } => side_length * side_length,
        }
    }
}

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// R-tree over the XY coordinates of a point cloud.
pub struct SpatialIndex {
    tree: RTree<IndexedPoint>,
    n_points: usize,
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("n_points", &self.n_points)
            .finish()
    }
}

impl SpatialIndex {
    pub fn build(cloud: &PointCloud) -> Self {
        let points: Vec<IndexedPoint> = cloud
            .x()
            .iter()
            .zip(cloud.y())
            .enumerate()
            .map(|(i, (&x, &y))| GeomWithData::new([x, y], i))
            .collect();
        tracing::debug!("Building spatial index over {} points", points.len());
        Self {
            tree: RTree::bulk_load(points),
            n_points: cloud.len(),
        }
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.n_points
    }

    pub fn is_empty(&self) -> bool {
        self.n_points == 0
    }

    /// Sorted indices of the points of `cloud` inside `volume` around
    /// `target`.
    pub fn neighbors(&self, cloud: &PointCloud, target: [f64; 3], volume: &Volume) -> Vec<usize> {
        let center = [target[0], target[1]];
        let mut found: Vec<usize> = match *volume {
            Volume::InfiniteCylinder { radius } => self
                .tree
                .locate_within_distance(center, radius * radius)
                .map(|p| p.data)
                .collect(),
            Volume::Sphere { radius } => self
                .tree
                .locate_within_distance(center, radius * radius)
                .map(|p| p.data)
                .filter(|&i| {
                    let [x, y, z] = cloud.point(i);
                    let d2 = (x - target[0]).powi(2)
                        + (y - target[1]).powi(2)
                        + (z - target[2]).powi(2);
                    d2 <= radius * radius
                })
                .collect(),
            Volume::Cell { side_length } => {
                let half = side_length / 2.0;
                let envelope = AABB::from_corners(
                    [center[0] - half, center[1] - half],
                    [center[0] + half, center[1] + half],
                );
                self.tree
                    .locate_in_envelope(&envelope)
                    .map(|p| p.data)
                    .collect()
            }
        };
        found.sort_unstable();
        found
    }
}

/// Neighborhood of every target point in `cloud`.
///
/// With `sample_size`, larger neighborhoods are thinned to that many points
/// with an even stride, so repeated runs give the same result.
pub fn compute_neighborhoods(
    cloud: &PointCloud,
    index: &SpatialIndex,
    targets: &PointCloud,
    volume: &Volume,
    sample_size: Option<usize>,
) -> Result<Vec<Vec<usize>>> {
    if index.len() != cloud.len() {
        return Err(Error::InvalidInput(
            "spatial index does not match the point cloud".to_string(),
        ));
    }
    if sample_size == Some(0) {
        return Err(Error::InvalidInput("sample size must be > 0".to_string()));
    }

    let neighborhoods = (0..targets.len())
        .into_par_iter()
        .map(|t| {
            let found = index.neighbors(cloud, targets.point(t), volume);
            match sample_size {
                Some(n) if found.len() > n => sample_evenly(&found, n),
                _ => found,
            }
        })
        .collect();
    Ok(neighborhoods)
}

fn sample_evenly(indices: &[usize], n: usize) -> Vec<usize> {
    let step = indices.len() as f64 / n as f64;
    (0..n)
        .map(|k| indices[((k as f64 * step) as usize).min(indices.len() - 1)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Regular grid of `n x n` points spaced by `spacing`, starting at
    /// `offset`, with z = 0.
    fn grid_cloud(n: usize, spacing: f64, offset: f64) -> PointCloud {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for j in 0..n {
            for i in 0..n {
                x.push(offset + i as f64 * spacing);
                y.push(offset + j as f64 * spacing);
            }
        }
        let z = vec![0.0; x.len()];
        PointCloud::new(x, y, z).unwrap()
    }

    #[test]
    fn test_build_volume() {
        assert_eq!(
            Volume::build("cell", 2.0).unwrap(),
            Volume::Cell { side_length: 2.0 }
        );
        assert!(Volume::build("cube", 2.0).is_err());
        assert!(Volume::build("sphere", 0.0).is_err());
    }

    #[test]
    fn test_cell_neighborhood() {
        let env = grid_cloud(10, 1.0, 0.5);
        let targets = grid_cloud(5, 2.0, 1.0);
        let index = SpatialIndex::build(&env);
        let volume = Volume::Cell { side_length: 2.0 };
        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, None).unwrap();
        assert_eq!(hoods.len(), 25);
        assert!(hoods.iter().all(|h| h.len() == 4));
    }

    #[test]
    fn test_cylinder_neighborhood() {
        let env = grid_cloud(3, 1.0, 0.0);
        let targets = PointCloud::new(vec![1.0], vec![1.0], vec![0.0]).unwrap();
        let index = SpatialIndex::build(&env);
        let volume = Volume::InfiniteCylinder { radius: 1.0 };
        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, None).unwrap();
        // center and its four direct neighbors
        assert_eq!(hoods[0], vec![1, 3, 4, 5, 7]);
    }

    #[test]
    fn test_sphere_uses_height() {
        let env = PointCloud::new(vec![0.0, 0.0], vec![0.0, 0.0], vec![0.5, 5.0]).unwrap();
        let targets = PointCloud::new(vec![0.0], vec![0.0], vec![0.0]).unwrap();
        let index = SpatialIndex::build(&env);
        let volume = Volume::Sphere { radius: 1.0 };
        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, None).unwrap();
        assert_eq!(hoods[0], vec![0]);
    }

    #[test]
    fn test_sample_size_limits_neighborhood() {
        let env = grid_cloud(10, 1.0, 0.5);
        let targets = grid_cloud(5, 2.0, 1.0);
        let index = SpatialIndex::build(&env);
        let volume = Volume::Cell { side_length: 2.0 };
        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, Some(1)).unwrap();
        assert!(hoods.iter().all(|h| h.len() == 1));
        assert!(compute_neighborhoods(&env, &index, &targets, &volume, Some(0)).is_err());
    }

    #[test]
    fn test_empty_cloud_gives_empty_neighborhoods() {
        let env = PointCloud::default();
        let targets = grid_cloud(2, 1.0, 0.0);
        let index = SpatialIndex::build(&env);
        let volume = Volume::Cell { side_length: 1.0 };
        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, None).unwrap();
        assert_eq!(hoods, vec![Vec::<usize>::new(); 4]);
    }
}
