use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one point in the cross-product of dimensions: the ordered
/// level names, one per dimension, in bucket-space order.
///
/// Ordering is lexical over the tuple, which is what every deterministic
/// tie-break in the crate relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(pub Vec<String>);

impl BucketKey {
    pub fn new<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(levels.into_iter().map(Into::into).collect())
    }

    pub fn levels(&self) -> &[String] {
        &self.0
    }

    /// Level name at the given dimension position.
    pub fn level(&self, dimension_index: usize) -> Option<&str> {
        self.0.get(dimension_index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable identifier used in prompts, batch files and logs.
    pub fn scenario_id(&self) -> String {
        self.0.join("_")
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" / "))
    }
}

/// A bucket chosen for the next generation step, annotated with why it
/// was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedBucket {
    pub key: BucketKey,
    /// True when picked because some constituent level is below its
    /// corpus-wide minimum; false for a frequency-weighted draw.
    pub is_gap_fill: bool,
}

/// Named authenticity outcomes. Each maps to a band for the gap between
/// support needed and effective capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthenticityTier {
    Failed,
    Struggling,
    Authentic,
    Excellent,
}

impl AuthenticityTier {
    pub fn from_level_name(name: &str) -> Option<Self> {
        match name {
            "failed" => Some(Self::Failed),
            "struggling" => Some(Self::Struggling),
            "authentic" => Some(Self::Authentic),
            "excellent" => Some(Self::Excellent),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Struggling => "struggling",
            Self::Authentic => "authentic",
            Self::Excellent => "excellent",
        }
    }

    /// Band for the drawn gap. For every tier except `Excellent` the gap is
    /// `support - capacity`; for `Excellent` it is `capacity - support`.
    pub fn gap_band(&self) -> (f64, f64) {
        match self {
            Self::Failed => (4.0, 6.0),
            Self::Struggling => (1.5, 3.0),
            Self::Authentic => (-0.5, 1.5),
            Self::Excellent => (1.0, 2.0),
        }
    }

    /// Whether support needed sits below capacity for this tier.
    pub fn support_below_capacity(&self) -> bool {
        matches!(self, Self::Excellent)
    }
}
