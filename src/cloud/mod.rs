//! In-memory point clouds and the operations run on them: filtering,
//! height normalization, neighborhood lookup and feature extraction.

pub mod features;
pub mod filter;
pub mod neighborhood;
pub mod normalize;
mod point_cloud;
pub mod polygon;

pub use features::{compute_features, FeatureCatalog};
pub use filter::Filter;
pub use neighborhood::{compute_neighborhoods, SpatialIndex, Volume};
pub use normalize::normalize;
pub use point_cloud::{AttributeSelection, PointCloud, COORDINATES};
pub(crate) use point_cloud::min_max;
