use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bucket::BucketKey;

/// Persistent coverage row for one bucket. Only the coverage store
/// creates or changes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub bucket: BucketKey,
    pub generated_count: u64,
    pub first_generated_at: DateTime<Utc>,
    pub last_generated_at: DateTime<Utc>,
}

/// Outcome of validating one finished batch, kept alongside coverage so
/// quality can be tracked across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchQuality {
    pub batch_id: String,
    pub recorded_at: DateTime<Utc>,
    pub total_examples: usize,
    pub passed: bool,
    pub failed_checks: Vec<String>,
}
