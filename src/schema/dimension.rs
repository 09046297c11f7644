use serde::{Deserialize, Serialize};

/// Which role a dimension plays. The calculator and validator look up the
/// capacity, authenticity and complexity axes by kind; `Other` axes only
/// take part in selection and coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DimensionKind {
    Capacity,
    Authenticity,
    Complexity,
    #[default]
    Other,
}

/// A closed interval on a dimension's scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarRange {
    pub min: f64,
    pub max: f64,
}

impl ScalarRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn is_within(&self, outer: &ScalarRange) -> bool {
        self.min >= outer.min && self.max <= outer.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

/// One value of a dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub name: String,
    /// Sub-range of the dimension scalar this level covers, if the
    /// dimension has one.
    pub range: Option<ScalarRange>,
    /// Relative weight for frequency-weighted selection.
    pub frequency: f64,
    /// Examples owed to this level across the whole corpus.
    pub min_examples: u32,
    /// Free text made available to prompt templates.
    pub description: Option<String>,
}

/// One axis of variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    pub domain: Option<ScalarRange>,
    pub levels: Vec<Level>,
}

impl Dimension {
    pub fn level(&self, name: &str) -> Option<&Level> {
        self.levels.iter().find(|l| l.name == name)
    }

    pub fn level_names(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().map(|l| l.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_containment() {
        let domain = ScalarRange::new(0.0, 10.0);
        let crisis = ScalarRange::new(0.5, 1.5);
        assert!(crisis.is_within(&domain));
        assert!(!ScalarRange::new(9.0, 10.5).is_within(&domain));
        assert!(crisis.contains(1.5));
        assert!(!crisis.contains(1.51));
        assert_eq!(domain.clamp(12.0), 10.0);
        assert_eq!(domain.clamp(-1.0), 0.0);
    }

    #[test]
    fn level_lookup_by_name() {
        let dim = Dimension {
            name: "capacity_level".to_string(),
            kind: DimensionKind::Capacity,
            domain: Some(ScalarRange::new(0.0, 10.0)),
            levels: vec![Level {
                name: "low".to_string(),
                range: Some(ScalarRange::new(2.0, 4.0)),
                frequency: 1.0,
                min_examples: 3,
                description: None,
            }],
        };
        assert_eq!(dim.level("low").map(|l| l.min_examples), Some(3));
        assert!(dim.level("high").is_none());
    }
}
