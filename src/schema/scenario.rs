use serde::{Deserialize, Serialize};

use super::bucket::BucketKey;
use super::dimension::ScalarRange;

/// Concrete numbers handed to the prompt for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParameters {
    pub bucket: BucketKey,
    pub is_gap_fill: bool,
    pub capacity_level: Option<String>,
    pub effective_capacity: f64,
    pub support_needed: f64,
    /// The gap drawn from the authenticity tier's band.
    pub support_gap: f64,
    pub authenticity_target: Option<String>,
    pub authenticity_range: Option<ScalarRange>,
    pub complexity_type: Option<String>,
    /// Set when the band could not be honoured inside the domain and
    /// support was clamped instead.
    pub clamped: bool,
}

impl ScenarioParameters {
    pub fn scenario_id(&self) -> String {
        if self.is_gap_fill {
            format!("{}_gap", self.bucket.scenario_id())
        } else {
            self.bucket.scenario_id()
        }
    }

    /// Highest support this participant can realistically give.
    pub fn support_ceiling(&self, headroom: f64) -> f64 {
        self.effective_capacity + headroom
    }
}
