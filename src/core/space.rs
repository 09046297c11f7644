/// Bucket space definition: dimensions, levels, weights and minimums.
///
/// Loaded once at startup and shared by reference. Every invariant the
/// coverage math depends on is checked here, so an invalid space never
/// reaches the selector.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::schema::bucket::{AuthenticityTier, BucketKey};
use crate::schema::dimension::{Dimension, DimensionKind, Level, ScalarRange};

/// Allowed deviation of a dimension's frequency sum from 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Capacity scale assumed when the capacity dimension declares no domain.
pub const DEFAULT_CAPACITY_DOMAIN: ScalarRange = ScalarRange { min: 0.0, max: 10.0 };

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),
    #[error("bucket {bucket} names unknown level '{level}' for dimension '{dimension}'")]
    UnknownLevel {
        bucket: BucketKey,
        dimension: String,
        level: String,
    },
    #[error("bucket {0} has the wrong number of levels for this space")]
    BucketShape(BucketKey),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

fn invalid(msg: impl Into<String>) -> SpaceError {
    SpaceError::ConfigurationInvalid(msg.into())
}

/// The validated cross-product definition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BucketSpace {
    dimensions: Vec<Dimension>,
}

// The RON file uses tuples for ranges and a signed minimum so that a
// negative value is reported as a configuration error rather than a
// parse error.

#[derive(Debug, Deserialize)]
#[serde(rename = "Space")]
struct RonSpace {
    dimensions: Vec<RonDimension>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Dimension")]
struct RonDimension {
    name: String,
    #[serde(default)]
    kind: DimensionKind,
    #[serde(default)]
    domain: Option<(f64, f64)>,
    levels: Vec<RonLevel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Level")]
struct RonLevel {
    name: String,
    #[serde(default)]
    range: Option<(f64, f64)>,
    frequency: f64,
    #[serde(default)]
    min_examples: i64,
    #[serde(default)]
    description: Option<String>,
}

impl BucketSpace {
    /// Build a space, failing fast on any invalid definition.
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self, SpaceError> {
        validate_dimensions(&dimensions)?;
        Ok(Self { dimensions })
    }

    /// Load a bucket space from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Self, SpaceError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a bucket space from a RON string.
    pub fn parse_ron(input: &str) -> Result<Self, SpaceError> {
        let raw: RonSpace = ron::from_str(input)?;
        let mut dimensions = Vec::with_capacity(raw.dimensions.len());

        for dim in raw.dimensions {
            let mut levels = Vec::with_capacity(dim.levels.len());
            for level in dim.levels {
                if level.min_examples < 0 {
                    return Err(invalid(format!(
                        "level '{}' of dimension '{}' has negative min_examples {}",
                        level.name, dim.name, level.min_examples
                    )));
                }
                let min_examples = u32::try_from(level.min_examples).map_err(|_| {
                    invalid(format!(
                        "level '{}' of dimension '{}' has min_examples out of range",
                        level.name, dim.name
                    ))
                })?;
                levels.push(Level {
                    name: level.name,
                    range: level.range.map(|(lo, hi)| ScalarRange::new(lo, hi)),
                    frequency: level.frequency,
                    min_examples,
                    description: level.description,
                });
            }
            dimensions.push(Dimension {
                name: dim.name,
                kind: dim.kind,
                domain: dim.domain.map(|(lo, hi)| ScalarRange::new(lo, hi)),
                levels,
            });
        }

        Self::new(dimensions)
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Position and definition of the dimension playing the given role.
    pub fn dimension_of_kind(&self, kind: DimensionKind) -> Option<(usize, &Dimension)> {
        self.dimensions
            .iter()
            .enumerate()
            .find(|(_, d)| d.kind == kind)
    }

    /// Check that a bucket has one known level per dimension.
    pub fn check_bucket(&self, bucket: &BucketKey) -> Result<(), SpaceError> {
        if bucket.len() != self.dimensions.len() {
            return Err(SpaceError::BucketShape(bucket.clone()));
        }
        for (dim, level) in self.dimensions.iter().zip(bucket.levels()) {
            if dim.level(level).is_none() {
                return Err(SpaceError::UnknownLevel {
                    bucket: bucket.clone(),
                    dimension: dim.name.clone(),
                    level: level.clone(),
                });
            }
        }
        Ok(())
    }

    /// The level a bucket selects along one dimension.
    pub fn level_of(&self, bucket: &BucketKey, dimension_index: usize) -> Option<&Level> {
        let dim = self.dimensions.get(dimension_index)?;
        dim.level(bucket.level(dimension_index)?)
    }

    /// Minimum examples owed to a bucket: the strictest per-level minimum
    /// among its levels. Minimums are never multiplied across the
    /// cross-product.
    pub fn minimum_required(&self, bucket: &BucketKey) -> u32 {
        (0..self.dimensions.len())
            .filter_map(|i| self.level_of(bucket, i))
            .map(|l| l.min_examples)
            .max()
            .unwrap_or(0)
    }

    /// Number of buckets in the cross-product.
    pub fn bucket_count(&self) -> usize {
        if self.dimensions.is_empty() {
            return 0;
        }
        self.dimensions.iter().map(|d| d.levels.len()).product()
    }

    /// Enumerate the full cross-product in definition order. Empty when
    /// the space has no dimensions.
    pub fn buckets(&self) -> Vec<BucketKey> {
        if self.dimensions.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<Vec<String>> = vec![Vec::new()];
        for dim in &self.dimensions {
            let mut next = Vec::with_capacity(out.len() * dim.levels.len());
            for prefix in &out {
                for level in &dim.levels {
                    let mut key = prefix.clone();
                    key.push(level.name.clone());
                    next.push(key);
                }
            }
            out = next;
        }
        out.into_iter().map(BucketKey).collect()
    }

    /// Sum bucket counts into per-level totals.
    pub fn level_totals<'a, I>(&self, counts: I) -> LevelTotals
    where
        I: IntoIterator<Item = (&'a BucketKey, u64)>,
    {
        let mut totals: Vec<Vec<u64>> = self
            .dimensions
            .iter()
            .map(|d| vec![0; d.levels.len()])
            .collect();

        for (bucket, count) in counts {
            if bucket.len() != self.dimensions.len() {
                continue;
            }
            for (i, dim) in self.dimensions.iter().enumerate() {
                let Some(name) = bucket.level(i) else { continue };
                if let Some(pos) = dim.levels.iter().position(|l| l.name == name) {
                    totals[i][pos] += count;
                }
            }
        }

        LevelTotals { totals }
    }

    /// How far a bucket is below its minimum, if it is a coverage gap.
    ///
    /// A bucket is a gap when at least one of its levels has not reached
    /// its corpus-wide minimum and the bucket itself holds fewer examples
    /// than `minimum_required`.
    pub fn bucket_shortfall(&self, bucket: &BucketKey, count: u64, totals: &LevelTotals) -> Option<u32> {
        if bucket.len() != self.dimensions.len() || self.dimensions.is_empty() {
            return None;
        }
        let any_unmet = self.dimensions.iter().enumerate().any(|(i, dim)| {
            bucket
                .level(i)
                .and_then(|name| dim.levels.iter().position(|l| l.name == name))
                .map(|pos| totals.totals[i][pos] < u64::from(dim.levels[pos].min_examples))
                .unwrap_or(false)
        });
        if !any_unmet {
            return None;
        }
        let required = u64::from(self.minimum_required(bucket));
        if count < required {
            Some((required - count) as u32)
        } else {
            None
        }
    }

    /// Uncovered stretches between level ranges, for linting. Ranges may
    /// abut or leave gaps; gaps are reported but never rejected.
    pub fn range_gaps(&self) -> Vec<String> {
        let mut gaps = Vec::new();
        for dim in &self.dimensions {
            let mut ranges: Vec<(&str, ScalarRange)> = dim
                .levels
                .iter()
                .filter_map(|l| l.range.map(|r| (l.name.as_str(), r)))
                .collect();
            ranges.sort_by(|a, b| a.1.min.total_cmp(&b.1.min));
            for pair in ranges.windows(2) {
                let (left_name, left) = pair[0];
                let (right_name, right) = pair[1];
                if right.min > left.max {
                    gaps.push(format!(
                        "{}: ({:.2}, {:.2}) between '{}' and '{}' is not covered",
                        dim.name, left.max, right.min, left_name, right_name
                    ));
                }
            }
        }
        gaps
    }
}

/// Examples counted per level, indexed like the space's dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelTotals {
    totals: Vec<Vec<u64>>,
}

impl LevelTotals {
    pub fn get(&self, dimension_index: usize, level_index: usize) -> u64 {
        self.totals
            .get(dimension_index)
            .and_then(|d| d.get(level_index))
            .copied()
            .unwrap_or(0)
    }

    /// Flatten into `(dimension, level) -> total`.
    pub fn by_name(&self, space: &BucketSpace) -> FxHashMap<(String, String), u64> {
        let mut out = FxHashMap::default();
        for (i, dim) in space.dimensions().iter().enumerate() {
            for (j, level) in dim.levels.iter().enumerate() {
                out.insert((dim.name.clone(), level.name.clone()), self.get(i, j));
            }
        }
        out
    }
}

fn validate_dimensions(dimensions: &[Dimension]) -> Result<(), SpaceError> {
    let mut dim_names = FxHashSet::default();
    let mut kinds = FxHashSet::default();

    for dim in dimensions {
        if dim.name.is_empty() {
            return Err(invalid("dimension with empty name"));
        }
        if !dim_names.insert(dim.name.as_str()) {
            return Err(invalid(format!("duplicate dimension '{}'", dim.name)));
        }
        if dim.kind != DimensionKind::Other && !kinds.insert(dim.kind) {
            return Err(invalid(format!(
                "more than one {:?} dimension (second is '{}')",
                dim.kind, dim.name
            )));
        }
        if dim.levels.is_empty() {
            return Err(invalid(format!("dimension '{}' has no levels", dim.name)));
        }
        if let Some(domain) = dim.domain {
            if !(domain.min.is_finite() && domain.max.is_finite()) || domain.min > domain.max {
                return Err(invalid(format!("dimension '{}' has an invalid domain", dim.name)));
            }
        }

        let mut level_names = FxHashSet::default();
        let mut weight_sum = 0.0;
        for level in &dim.levels {
            if !level_names.insert(level.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate level '{}' in dimension '{}'",
                    level.name, dim.name
                )));
            }
            if !level.frequency.is_finite() || level.frequency < 0.0 {
                return Err(invalid(format!(
                    "level '{}' of dimension '{}' has invalid frequency {}",
                    level.name, dim.name, level.frequency
                )));
            }
            weight_sum += level.frequency;

            if let Some(range) = level.range {
                if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                    return Err(invalid(format!(
                        "level '{}' of dimension '{}' has an inverted range",
                        level.name, dim.name
                    )));
                }
                let domain = match (dim.domain, dim.kind) {
                    (Some(domain), _) => Some(domain),
                    (None, DimensionKind::Capacity) => Some(DEFAULT_CAPACITY_DOMAIN),
                    (None, _) => None,
                };
                if let Some(domain) = domain {
                    if !range.is_within(&domain) {
                        return Err(invalid(format!(
                            "level '{}' range ({}, {}) lies outside domain ({}, {}) of '{}'",
                            level.name, range.min, range.max, domain.min, domain.max, dim.name
                        )));
                    }
                }
            }

            if dim.kind == DimensionKind::Authenticity
                && AuthenticityTier::from_level_name(&level.name).is_none()
            {
                return Err(invalid(format!(
                    "authenticity level '{}' is not one of failed, struggling, authentic, excellent",
                    level.name
                )));
            }
        }

        if (weight_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(invalid(format!(
                "frequencies of dimension '{}' sum to {}, expected 1.0",
                dim.name, weight_sum
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(name: &str, frequency: f64, min_examples: u32) -> Level {
        Level {
            name: name.to_string(),
            range: None,
            frequency,
            min_examples,
            description: None,
        }
    }

    fn two_by_two() -> BucketSpace {
        BucketSpace::new(vec![
            Dimension {
                name: "capacity_level".to_string(),
                kind: DimensionKind::Capacity,
                domain: None,
                levels: vec![level("low", 0.5, 1), level("high", 0.5, 3)],
            },
            Dimension {
                name: "complexity_type".to_string(),
                kind: DimensionKind::Complexity,
                domain: None,
                levels: vec![level("baseline", 0.7, 2), level("mixed_emotions", 0.3, 0)],
            },
        ])
        .unwrap()
    }

    #[test]
    fn load_test_space_from_ron() {
        let path = std::path::PathBuf::from("tests/fixtures/test_space.ron");
        let space = BucketSpace::load_from_ron(&path).unwrap();
        assert_eq!(space.dimensions().len(), 2);
        assert_eq!(space.bucket_count(), 16);
        let (idx, auth) = space.dimension_of_kind(DimensionKind::Authenticity).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(auth.levels[0].name, "failed");
        assert_eq!(auth.levels[0].range, Some(ScalarRange::new(0.2, 0.4)));
    }

    #[test]
    fn default_space_is_valid() {
        let path = std::path::PathBuf::from("space_data/default_space.ron");
        let space = BucketSpace::load_from_ron(&path).unwrap();
        assert_eq!(space.bucket_count(), 4 * 4 * 8);
        assert!(space.dimension_of_kind(DimensionKind::Complexity).is_some());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let path = std::path::PathBuf::from("tests/fixtures/bad_weights_space.ron");
        let err = BucketSpace::load_from_ron(&path).unwrap_err();
        assert!(matches!(err, SpaceError::ConfigurationInvalid(_)), "{err}");
    }

    #[test]
    fn weights_within_tolerance_accepted() {
        let space = BucketSpace::new(vec![Dimension {
            name: "d".to_string(),
            kind: DimensionKind::Other,
            domain: None,
            levels: vec![level("a", 0.3333333, 0), level("b", 0.3333333, 0), level("c", 0.3333334, 0)],
        }]);
        assert!(space.is_ok());
    }

    #[test]
    fn negative_minimum_rejected() {
        let input = r#"Space(dimensions: [
            Dimension(name: "d", levels: [
                Level(name: "a", frequency: 1.0, min_examples: -1),
            ]),
        ])"#;
        let err = BucketSpace::parse_ron(input).unwrap_err();
        assert!(matches!(err, SpaceError::ConfigurationInvalid(_)));
    }

    #[test]
    fn range_outside_domain_rejected() {
        let input = r#"Space(dimensions: [
            Dimension(name: "capacity_level", kind: Capacity, domain: Some((0.0, 10.0)), levels: [
                Level(name: "over", range: Some((9.0, 11.0)), frequency: 1.0),
            ]),
        ])"#;
        assert!(matches!(
            BucketSpace::parse_ron(input),
            Err(SpaceError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn capacity_range_checked_against_default_domain() {
        let input = r#"Space(dimensions: [
            Dimension(name: "capacity_level", kind: Capacity, levels: [
                Level(name: "below_zero", range: Some((-2.0, 1.0)), frequency: 1.0),
            ]),
        ])"#;
        assert!(matches!(
            BucketSpace::parse_ron(input),
            Err(SpaceError::ConfigurationInvalid(_))
        ));

        let other = r#"Space(dimensions: [
            Dimension(name: "mood", levels: [
                Level(name: "sour", range: Some((-2.0, 1.0)), frequency: 1.0),
            ]),
        ])"#;
        assert!(BucketSpace::parse_ron(other).is_ok());
    }

    #[test]
    fn unknown_authenticity_tier_rejected() {
        let input = r#"Space(dimensions: [
            Dimension(name: "authenticity_target", kind: Authenticity, levels: [
                Level(name: "heroic", frequency: 1.0),
            ]),
        ])"#;
        assert!(matches!(
            BucketSpace::parse_ron(input),
            Err(SpaceError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn duplicate_kind_rejected() {
        let err = BucketSpace::new(vec![
            Dimension {
                name: "a".to_string(),
                kind: DimensionKind::Complexity,
                domain: None,
                levels: vec![level("x", 1.0, 0)],
            },
            Dimension {
                name: "b".to_string(),
                kind: DimensionKind::Complexity,
                domain: None,
                levels: vec![level("y", 1.0, 0)],
            },
        ])
        .unwrap_err();
        assert!(matches!(err, SpaceError::ConfigurationInvalid(_)));
    }

    #[test]
    fn empty_space_has_no_buckets() {
        let space = BucketSpace::new(Vec::new()).unwrap();
        assert!(space.is_empty());
        assert!(space.buckets().is_empty());
        assert_eq!(space.bucket_count(), 0);
    }

    #[test]
    fn minimum_required_is_strictest_level() {
        let space = two_by_two();
        assert_eq!(space.minimum_required(&BucketKey::new(["high", "mixed_emotions"])), 3);
        assert_eq!(space.minimum_required(&BucketKey::new(["low", "baseline"])), 2);
        assert_eq!(space.minimum_required(&BucketKey::new(["low", "mixed_emotions"])), 1);
    }

    #[test]
    fn buckets_enumerate_cross_product() {
        let space = two_by_two();
        let buckets = space.buckets();
        assert_eq!(
            buckets,
            vec![
                BucketKey::new(["low", "baseline"]),
                BucketKey::new(["low", "mixed_emotions"]),
                BucketKey::new(["high", "baseline"]),
                BucketKey::new(["high", "mixed_emotions"]),
            ]
        );
    }

    #[test]
    fn check_bucket_reports_unknown_levels() {
        let space = two_by_two();
        assert!(space.check_bucket(&BucketKey::new(["low", "baseline"])).is_ok());
        assert!(matches!(
            space.check_bucket(&BucketKey::new(["low"])),
            Err(SpaceError::BucketShape(_))
        ));
        assert!(matches!(
            space.check_bucket(&BucketKey::new(["medium", "baseline"])),
            Err(SpaceError::UnknownLevel { .. })
        ));
    }

    #[test]
    fn shortfall_tracks_unmet_levels() {
        let space = two_by_two();
        let low_base = BucketKey::new(["low", "baseline"]);
        let high_mixed = BucketKey::new(["high", "mixed_emotions"]);

        let counts = vec![(&low_base, 2u64)];
        let totals = space.level_totals(counts);
        // low (min 1) and baseline (min 2) are both met
        assert_eq!(space.bucket_shortfall(&low_base, 2, &totals), None);
        // high is unmet, bucket minimum is 3
        assert_eq!(space.bucket_shortfall(&high_mixed, 0, &totals), Some(3));

        let by_name = totals.by_name(&space);
        assert_eq!(by_name[&("capacity_level".to_string(), "low".to_string())], 2);
        assert_eq!(by_name[&("complexity_type".to_string(), "mixed_emotions".to_string())], 0);
    }

    #[test]
    fn range_gaps_are_reported() {
        let path = std::path::PathBuf::from("space_data/default_space.ron");
        let space = BucketSpace::load_from_ron(&path).unwrap();
        let gaps = space.range_gaps();
        assert!(gaps.iter().any(|g| g.contains("'crisis' and 'low'")));
        // authenticity ranges abut exactly
        assert!(!gaps.iter().any(|g| g.starts_with("authenticity_target")));
    }
}
