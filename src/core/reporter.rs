/// Read-only coverage summaries over the store and the bucket space.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::core::space::BucketSpace;
use crate::core::store::{CoverageStore, StoreError};
use crate::schema::bucket::BucketKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCoverage {
    pub bucket: BucketKey,
    pub count: u64,
    pub minimum_required: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelCoverage {
    pub dimension: String,
    pub level: String,
    pub total: u64,
    pub min_examples: u32,
}

impl LevelCoverage {
    pub fn is_met(&self) -> bool {
        self.total >= u64::from(self.min_examples)
    }
}

/// A bucket the selector would still treat as a gap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnderfilledBucket {
    pub bucket: BucketKey,
    pub count: u64,
    pub required: u32,
    pub shortfall: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    /// Every bucket of the space, lexical order, including zero counts.
    pub per_bucket: Vec<BucketCoverage>,
    pub per_dimension_level: Vec<LevelCoverage>,
    pub underfilled: Vec<UnderfilledBucket>,
    pub total_examples: u64,
    /// Stored records, including any from an earlier space layout.
    pub buckets_tracked: usize,
}

impl CoverageReport {
    /// Fraction of the space's buckets with at least one example.
    pub fn covered_fraction(&self) -> f64 {
        if self.per_bucket.is_empty() {
            return 0.0;
        }
        let covered = self.per_bucket.iter().filter(|b| b.count > 0).count();
        covered as f64 / self.per_bucket.len() as f64
    }
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Coverage Report ===")?;
        writeln!(f, "Total examples: {}", self.total_examples)?;
        writeln!(
            f,
            "Buckets covered: {:.1}% of {} ({} tracked)",
            self.covered_fraction() * 100.0,
            self.per_bucket.len(),
            self.buckets_tracked
        )?;

        writeln!(f)?;
        writeln!(f, "Levels:")?;
        let mut current = "";
        for level in &self.per_dimension_level {
            if level.dimension != current {
                writeln!(f, "  {}", level.dimension)?;
                current = level.dimension.as_str();
            }
            let mark = if level.is_met() { " " } else { "!" };
            writeln!(
                f,
                "   {} {:<24} {:>5} / {}",
                mark, level.level, level.total, level.min_examples
            )?;
        }

        writeln!(f)?;
        if self.underfilled.is_empty() {
            writeln!(f, "No underfilled buckets.")?;
        } else {
            writeln!(f, "Underfilled buckets ({}):", self.underfilled.len())?;
            for u in &self.underfilled {
                writeln!(
                    f,
                    "  {:<48} {} / {} (short {})",
                    u.bucket.to_string(),
                    u.count,
                    u.required,
                    u.shortfall
                )?;
            }
        }
        Ok(())
    }
}

pub struct CoverageReporter {
    space: Arc<BucketSpace>,
    store: Arc<dyn CoverageStore>,
}

impl CoverageReporter {
    pub fn new(space: Arc<BucketSpace>, store: Arc<dyn CoverageStore>) -> Self {
        Self { space, store }
    }

    pub fn report(&self) -> Result<CoverageReport, StoreError> {
        let records = self.store.snapshot()?;
        let totals = self
            .space
            .level_totals(records.iter().map(|(k, r)| (k, r.generated_count)));

        let mut buckets = self.space.buckets();
        buckets.sort();

        let mut per_bucket = Vec::with_capacity(buckets.len());
        let mut underfilled = Vec::new();
        for bucket in buckets {
            let count = records.get(&bucket).map(|r| r.generated_count).unwrap_or(0);
            let minimum_required = self.space.minimum_required(&bucket);
            if let Some(shortfall) = self.space.bucket_shortfall(&bucket, count, &totals) {
                underfilled.push(UnderfilledBucket {
                    bucket: bucket.clone(),
                    count,
                    required: minimum_required,
                    shortfall,
                });
            }
            per_bucket.push(BucketCoverage {
                bucket,
                count,
                minimum_required,
            });
        }

        let mut per_dimension_level = Vec::new();
        for (i, dim) in self.space.dimensions().iter().enumerate() {
            for (j, level) in dim.levels.iter().enumerate() {
                per_dimension_level.push(LevelCoverage {
                    dimension: dim.name.clone(),
                    level: level.name.clone(),
                    total: totals.get(i, j),
                    min_examples: level.min_examples,
                });
            }
        }

        Ok(CoverageReport {
            per_bucket,
            per_dimension_level,
            underfilled,
            total_examples: records.values().map(|r| r.generated_count).sum(),
            buckets_tracked: records.len(),
        })
    }
}
