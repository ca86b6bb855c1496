//! Feature extractors and the per-target feature computation.
//!
//! A [`FeatureCatalog`] maps feature names (`mean_z`, `perc_95_z`,
//! `point_density`, ...) to [`Extractor`]s. Parametrized extractors are
//! added at run time with [`FeatureCatalog::add_custom_feature`].

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::neighborhood::Volume;
use super::normalize::NORMALIZED_HEIGHT;
use super::point_cloud::PointCloud;
use crate::error::{Error, Result};

/// Names accepted by [`FeatureCatalog::add_custom_feature`].
pub const CUSTOM_EXTRACTORS: [&str; 2] = ["PercentileFeatureExtractor", "BandRatioFeatureExtractor"];

/// Classification code of ground returns.
const GROUND_CLASS: f64 = 2.0;

/// Thickness of the height layers used by the entropy feature.
const ENTROPY_LAYER: f64 = 0.5;

/// Attributes for which the default statistics are registered.
const DEFAULT_DATA_KEYS: [&str; 2] = ["z", NORMALIZED_HEIGHT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Mean,
    Median,
    Std,
    Var,
    Min,
    Max,
    Range,
    CoeffVar,
    Skew,
    Kurtosis,
    Entropy,
}

impl Statistic {
    pub const ALL: [Statistic; 11] = [
        Statistic::Mean,
        Statistic::Median,
        Statistic::Std,
        Statistic::Var,
        Statistic::Min,
        Statistic::Max,
        Statistic::Range,
        Statistic::CoeffVar,
        Statistic::Skew,
        Statistic::Kurtosis,
        Statistic::Entropy,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Median => "median",
            Statistic::Std => "std",
            Statistic::Var => "var",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Range => "range",
            Statistic::CoeffVar => "coeff_var",
            Statistic::Skew => "skew",
            Statistic::Kurtosis => "kurto",
            Statistic::Entropy => "entropy",
        }
    }

    fn compute(&self, values: &mut [f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Statistic::Mean => mean(values),
            Statistic::Median => percentile(values, 50.0),
            Statistic::Std => central_moment(values, 2).sqrt(),
            Statistic::Var => central_moment(values, 2),
            Statistic::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Statistic::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Statistic::Range => {
                let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                hi - lo
            }
            Statistic::CoeffVar => central_moment(values, 2).sqrt() / mean(values),
            Statistic::Skew => {
                let m2 = central_moment(values, 2);
                central_moment(values, 3) / m2.powf(1.5)
            }
            Statistic::Kurtosis => {
                let m2 = central_moment(values, 2);
                central_moment(values, 4) / (m2 * m2) - 3.0
            }
            Statistic::Entropy => entropy(values),
        }
    }
}

/// A single feature computed over the neighborhood of a target point.
#[derive(Debug, Clone, PartialEq)]
pub enum Extractor {
    /// Points per unit area (2D volumes) or volume (sphere).
    PointDensity,
    /// Fraction of ground returns.
    PulsePenetrationRatio,
    Statistic { stat: Statistic, data_key: String },
    /// Linear-interpolated percentile in `(0, 100]`.
    Percentile { percentile: f64, data_key: String },
    /// Fraction of points strictly between the limits.
    BandRatio {
        lower: Option<f64>,
        upper: Option<f64>,
        data_key: String,
    },
    /// Percentage of points above the neighborhood mean.
    DensityAbsoluteMean { data_key: String },
}

impl Extractor {
    /// Name of the attribute this extractor writes.
    pub fn name(&self) -> String {
        match self {
            Extractor::PointDensity => "point_density".to_string(),
            Extractor::PulsePenetrationRatio => "pulse_penetration_ratio".to_string(),
            Extractor::Statistic { stat, data_key } => format!("{}_{}", stat.prefix(), data_key),
            Extractor::Percentile {
                percentile,
                data_key,
            } => format!("perc_{}_{}", percentile, data_key),
            Extractor::BandRatio {
                lower,
                upper,
                data_key,
            } => {
                let mut name = "band_ratio_".to_string();
                if let Some(lower) = lower {
                    name.push_str(&format!("{}_", lower));
                }
                name.push_str(data_key);
                if let Some(upper) = upper {
                    name.push_str(&format!("_{}", upper));
                }
                name
            }
            Extractor::DensityAbsoluteMean { data_key } => {
                format!("density_absolute_mean_{}", data_key)
            }
        }
    }

    /// Attribute of the environment cloud read by this extractor.
    pub fn requires(&self) -> Option<&str> {
        match self {
            Extractor::PointDensity => None,
            Extractor::PulsePenetrationRatio => Some("raw_classification"),
            Extractor::Statistic { data_key, .. }
            | Extractor::Percentile { data_key, .. }
            | Extractor::BandRatio { data_key, .. }
            | Extractor::DensityAbsoluteMean { data_key } => Some(data_key),
        }
    }

    /// Build a parametrized extractor from its class-style name.
    pub fn custom(extractor_name: &str, parameters: Map<String, Value>) -> Result<Self> {
        match extractor_name {
            "PercentileFeatureExtractor" => {
                let p: PercentileParams = custom_params(extractor_name, parameters)?;
                if !(p.percentile > 0.0 && p.percentile <= 100.0) {
                    return Err(Error::InvalidInput(format!(
                        "percentile must be in (0, 100], got {}",
                        p.percentile
                    )));
                }
                Ok(Extractor::Percentile {
                    percentile: p.percentile,
                    data_key: p.data_key,
                })
            }
            "BandRatioFeatureExtractor" => {
                let p: BandRatioParams = custom_params(extractor_name, parameters)?;
                match (p.lower_limit, p.upper_limit) {
                    (None, None) => Err(Error::InvalidInput(
                        "band ratio needs at least one of lower_limit, upper_limit".to_string(),
                    )),
                    (Some(lo), Some(hi)) if lo >= hi => Err(Error::InvalidInput(format!(
                        "band ratio lower limit {} is not below upper limit {}",
                        lo, hi
                    ))),
                    (lower, upper) => Ok(Extractor::BandRatio {
                        lower,
                        upper,
                        data_key: p.data_key,
                    }),
                }
            }
            other => Err(Error::InvalidInput(format!(
                "Invalid attribute: {}. Choose between: {}",
                other,
                CUSTOM_EXTRACTORS.join(", ")
            ))),
        }
    }

    /// Evaluate over one neighborhood. `column` is the attribute named by
    /// [`requires`](Self::requires).
    fn evaluate(&self, column: Option<&[f64]>, neighborhood: &[usize], volume: &Volume) -> f64 {
        let gather = || -> Vec<f64> {
            column
                .map(|c| neighborhood.iter().map(|&i| c[i]).collect())
                .unwrap_or_default()
        };
        match self {
            Extractor::PointDensity => neighborhood.len() as f64 / volume.measure(),
            Extractor::PulsePenetrationRatio => {
                let ground = gather().into_iter().filter(|&c| c == GROUND_CLASS).count();
                ground as f64 / neighborhood.len().max(1) as f64
            }
            Extractor::Statistic { stat, .. } => stat.compute(&mut gather()),
            Extractor::Percentile { percentile: p, .. } => {
                let mut values = gather();
                if values.is_empty() {
                    f64::NAN
                } else {
                    percentile(&mut values, *p)
                }
            }
            Extractor::BandRatio { lower, upper, .. } => {
                let values = gather();
                if values.is_empty() {
                    return f64::NAN;
                }
                let inside = values
                    .iter()
                    .filter(|&&v| lower.map_or(true, |lo| v > lo) && upper.map_or(true, |hi| v < hi))
                    .count();
                inside as f64 / values.len() as f64
            }
            Extractor::DensityAbsoluteMean { .. } => {
                let values = gather();
                if values.is_empty() {
                    return f64::NAN;
                }
                let m = mean(&values);
                let above = values.iter().filter(|&&v| v > m).count();
                100.0 * above as f64 / values.len() as f64
            }
        }
    }
}

fn default_data_key() -> String {
    "z".to_string()
}

fn default_percentile() -> f64 {
    50.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PercentileParams {
    #[serde(default = "default_percentile")]
    percentile: f64,
    #[serde(default = "default_data_key")]
    data_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BandRatioParams {
    #[serde(default)]
    lower_limit: Option<f64>,
    #[serde(default)]
    upper_limit: Option<f64>,
    #[serde(default = "default_data_key")]
    data_key: String,
}

fn custom_params<T: DeserializeOwned>(name: &str, parameters: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(parameters)).map_err(|e| {
        Error::InvalidInput(format!("Wrong set of parameters for extractor {}: {}", name, e))
    })
}

/// Registry of the features that can be requested by name.
#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    extractors: BTreeMap<String, Extractor>,
}

impl Default for FeatureCatalog {
    fn default() -> Self {
        let mut catalog = Self {
            extractors: BTreeMap::new(),
        };
        catalog.register(Extractor::PointDensity);
        catalog.register(Extractor::PulsePenetrationRatio);
        for key in DEFAULT_DATA_KEYS {
            for stat in Statistic::ALL {
                catalog.register(Extractor::Statistic {
                    stat,
                    data_key: key.to_string(),
                });
            }
            for p in 1..=100 {
                catalog.register(Extractor::Percentile {
                    percentile: p as f64,
                    data_key: key.to_string(),
                });
            }
            catalog.register(Extractor::DensityAbsoluteMean {
                data_key: key.to_string(),
            });
        }
        catalog
    }
}

impl FeatureCatalog {
    /// Add an extractor, replacing any with the same name. Returns the name.
    pub fn register(&mut self, extractor: Extractor) -> String {
        let name = extractor.name();
        self.extractors.insert(name.clone(), extractor);
        name
    }

    pub fn add_custom_feature(
        &mut self,
        extractor_name: &str,
        parameters: Map<String, Value>,
    ) -> Result<String> {
        let extractor = Extractor::custom(extractor_name, parameters)?;
        Ok(self.register(extractor))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extractors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Extractor> {
        self.extractors
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("Feature not available: {}", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.extractors.keys().map(String::as_str)
    }

    /// Attributes needed in the environment cloud to compute `features`.
    pub fn required_attributes(&self, features: &[String]) -> Vec<String> {
        let mut required: Vec<String> = features
            .iter()
            .filter_map(|f| self.extractors.get(f))
            .filter_map(|e| e.requires().map(str::to_string))
            .collect();
        required.sort();
        required.dedup();
        required
    }
}

/// Compute `feature_names` for every target and store them as attributes of
/// `targets`.
pub fn compute_features(
    env: &PointCloud,
    neighborhoods: &[Vec<usize>],
    targets: &mut PointCloud,
    feature_names: &[String],
    volume: &Volume,
    catalog: &FeatureCatalog,
) -> Result<()> {
    if neighborhoods.len() != targets.len() {
        return Err(Error::InvalidInput(format!(
            "{} neighborhoods for {} targets",
            neighborhoods.len(),
            targets.len()
        )));
    }
    let extractors = feature_names
        .iter()
        .map(|name| catalog.get(name))
        .collect::<Result<Vec<_>>>()?;

    for extractor in extractors {
        let column = extractor.requires().map(|a| env.require(a)).transpose()?;
        let name = extractor.name();
        tracing::info!("Computing feature {}", name);
        let values: Vec<f64> = neighborhoods
            .par_iter()
            .map(|hood| extractor.evaluate(column, hood, volume))
            .collect();
        targets.set_attribute(name, values)?;
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn central_moment(values: &[f64], order: i32) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(order)).sum::<f64>() / values.len() as f64
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &mut [f64], p: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let rank = p / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
}

/// Shannon entropy (bits) of the distribution of values over layers of
/// [`ENTROPY_LAYER`] thickness.
fn entropy(values: &[f64]) -> f64 {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min).floor();
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max).ceil();
    let n_layers = ((hi - lo) / ENTROPY_LAYER).round();
    if n_layers < 1.0 {
        return 0.0;
    }
    // Sparse histogram: only occupied layers are stored.
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for v in values {
        let layer = ((v - lo) / ENTROPY_LAYER).floor().min(n_layers - 1.0);
        *counts.entry(layer as u64).or_default() += 1;
    }
    let total = values.len() as f64;
    -counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            p * p.log2()
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::neighborhood::{compute_neighborhoods, SpatialIndex};
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_default_catalog() {
        let catalog = FeatureCatalog::default();
        for name in ["point_density", "mean_z", "perc_95_z", "kurto_z", "std_normalized_height"] {
            assert!(catalog.contains(name), "{}", name);
        }
        assert!(catalog.get("perc_101_z").is_err());
    }

    #[test]
    fn test_statistics() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let eval = |stat: Statistic| stat.compute(&mut values.to_vec());
        assert!(close(eval(Statistic::Mean), 2.5));
        assert!(close(eval(Statistic::Median), 2.5));
        assert!(close(eval(Statistic::Var), 1.25));
        assert!(close(eval(Statistic::Range), 3.0));
        assert!(close(eval(Statistic::Skew), 0.0));
        assert!(close(eval(Statistic::Kurtosis), -1.36));
        assert!(eval(Statistic::Entropy) > 0.0);
        assert!(Statistic::Mean.compute(&mut []).is_nan());
    }

    #[test]
    fn test_entropy_with_outlier() {
        assert_eq!(entropy(&[3.0, 3.0]), 0.0);
        assert!(close(entropy(&[0.1, 0.2, 0.7, 0.9]), 1.0));
        // Two occupied layers across roughly 4e15 empty ones.
        assert!(close(entropy(&[0.1, 0.2, 0.3, 2.0e15]), 0.8112781244591328));
        assert!(close(entropy(&[0.1, 1.0e300]), 1.0));
    }

    #[test]
    fn test_percentile_interpolates() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert!(close(percentile(&mut values, 25.0), 1.75));
        assert!(close(percentile(&mut values, 100.0), 4.0));
    }

    #[test]
    fn test_custom_features() {
        let mut catalog = FeatureCatalog::default();
        let name = catalog
            .add_custom_feature(
                "BandRatioFeatureExtractor",
                params(json!({"upper_limit": 50, "data_key": "z"})),
            )
            .unwrap();
        assert_eq!(name, "band_ratio_z_50");
        let name = catalog
            .add_custom_feature(
                "PercentileFeatureExtractor",
                params(json!({"percentile": 12.5})),
            )
            .unwrap();
        assert_eq!(name, "perc_12.5_z");

        let err = catalog
            .add_custom_feature("PercentileFeatureExtractor", params(json!({"nope": 1})))
            .unwrap_err();
        assert!(err.to_string().contains("Wrong set of parameters"));
        assert!(catalog
            .add_custom_feature("BandRatioFeatureExtractor", Map::new())
            .is_err());
        assert!(catalog.add_custom_feature("EigenValues", Map::new()).is_err());
    }

    #[test]
    fn test_point_density_with_sample_size() {
        // 1 m spaced environment, 2 m cells around each target
        let mut x = Vec::new();
        let mut y = Vec::new();
        for j in 0..10 {
            for i in 0..10 {
                x.push(0.5 + i as f64);
                y.push(0.5 + j as f64);
            }
        }
        let env = PointCloud::new(x.clone(), y, vec![0.0; 100]).unwrap();
        let mut targets =
            PointCloud::new(vec![1.0, 5.0], vec![1.0, 5.0], vec![0.0, 0.0]).unwrap();
        let index = SpatialIndex::build(&env);
        let volume = Volume::build("cell", 2.0).unwrap();

        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, Some(1)).unwrap();
        let catalog = FeatureCatalog::default();
        compute_features(&env, &hoods, &mut targets, &names(&["point_density"]), &volume, &catalog)
            .unwrap();
        assert_eq!(targets.attribute("point_density").unwrap(), &[0.25, 0.25]);

        let hoods = compute_neighborhoods(&env, &index, &targets, &volume, None).unwrap();
        compute_features(&env, &hoods, &mut targets, &names(&["point_density"]), &volume, &catalog)
            .unwrap();
        assert_eq!(targets.attribute("point_density").unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_empty_neighborhoods() {
        let env = PointCloud::default();
        let mut targets = PointCloud::new(vec![0.0], vec![0.0], vec![0.0]).unwrap();
        let volume = Volume::Cell { side_length: 1.0 };
        let catalog = FeatureCatalog::default();
        compute_features(
            &env,
            &[vec![]],
            &mut targets,
            &names(&["point_density", "mean_z"]),
            &volume,
            &catalog,
        )
        .unwrap();
        assert_eq!(targets.attribute("point_density").unwrap(), &[0.0]);
        assert!(targets.attribute("mean_z").unwrap()[0].is_nan());
    }

    #[test]
    fn test_missing_attribute_and_feature() {
        let env = PointCloud::new(vec![0.0], vec![0.0], vec![0.0]).unwrap();
        let mut targets = env.clone();
        let volume = Volume::Cell { side_length: 1.0 };
        let catalog = FeatureCatalog::default();
        let hoods = vec![vec![0]];
        assert!(compute_features(
            &env,
            &hoods,
            &mut targets,
            &names(&["pulse_penetration_ratio"]),
            &volume,
            &catalog
        )
        .is_err());
        assert!(compute_features(&env, &hoods, &mut targets, &names(&["foo"]), &volume, &catalog)
            .is_err());
    }

    #[test]
    fn test_pulse_penetration_and_band_ratio() {
        let mut env = PointCloud::new(vec![0.0; 4], vec![0.0; 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        env.set_attribute("raw_classification", vec![2.0, 2.0, 1.0, 6.0])
            .unwrap();
        let hood = [0, 1, 2, 3];
        let volume = Volume::Cell { side_length: 1.0 };
        let ppr = Extractor::PulsePenetrationRatio;
        assert!(close(
            ppr.evaluate(env.attribute("raw_classification"), &hood, &volume),
            0.5
        ));
        let band = Extractor::BandRatio {
            lower: Some(1.0),
            upper: Some(4.0),
            data_key: "z".into(),
        };
        assert!(close(band.evaluate(env.attribute("z"), &hood, &volume), 0.5));
        assert_eq!(band.name(), "band_ratio_1_z_4");
        let dam = Extractor::DensityAbsoluteMean {
            data_key: "z".into(),
        };
        assert!(close(dam.evaluate(env.attribute("z"), &hood, &volume), 50.0));
    }
}
