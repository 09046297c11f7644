use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bucket::BucketKey;

/// One generated training sample. The payload is whatever the model
/// returned and stays opaque; the remaining fields are provenance the
/// validator and batch writer rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub scenario_id: String,
    pub bucket: BucketKey,
    pub is_gap_fill: bool,
    /// Authenticity score the model actually produced, in [0, 1].
    pub authenticity_score: f64,
    pub effective_capacity: f64,
    pub support_level_needed: f64,
    pub response_text: String,
    pub generated_at: DateTime<Utc>,
    pub attempts: u32,
    pub payload: serde_json::Value,
}

/// Examples produced in one generation cycle, in production order.
pub type Batch = Vec<Example>;
