/// Bucket selection: gap-fill first, frequency-weighted draws after.
///
/// Gap buckets come from the store's least-covered ordering. When the store
/// cannot be read the selector keeps producing buckets from weighted draws
/// alone, so a flaky database slows coverage down but never stalls
/// generation.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use crate::core::space::BucketSpace;
use crate::core::store::{CoverageStore, StoreError};
use crate::core::validator::LevelShortfall;
use crate::schema::bucket::{BucketKey, SelectedBucket};

pub struct BucketSelector {
    space: Arc<BucketSpace>,
    store: Arc<dyn CoverageStore>,
    rng: StdRng,
    weights: Vec<Option<WeightedIndex<f64>>>,
}

impl BucketSelector {
    pub fn new(space: Arc<BucketSpace>, store: Arc<dyn CoverageStore>, seed: u64) -> Self {
        // A dimension whose weights are all zero cannot be sampled; draws
        // along it fall back to the first level.
        let weights = space
            .dimensions()
            .iter()
            .map(|d| WeightedIndex::new(d.levels.iter().map(|l| l.frequency)).ok())
            .collect();
        Self {
            space,
            store,
            rng: StdRng::seed_from_u64(seed),
            weights,
        }
    }

    /// Choose the next `n` buckets to generate.
    pub fn select_next(&mut self, n: usize) -> Vec<SelectedBucket> {
        if n == 0 || self.space.is_empty() {
            return Vec::new();
        }

        let mut selected = match self.gap_buckets(n) {
            Ok(gaps) => gaps,
            Err(e) => {
                tracing::warn!(error = %e, "coverage store unavailable, using weighted selection only");
                Vec::new()
            }
        };

        while selected.len() < n {
            let key = self.weighted_bucket(&[]);
            selected.push(SelectedBucket {
                key,
                is_gap_fill: false,
            });
        }

        let gap_count = selected.iter().filter(|s| s.is_gap_fill).count();
        tracing::debug!(requested = n, gap_fill = gap_count, "buckets selected");
        selected
    }

    /// Buckets aimed at levels a validation run reported short: one
    /// gap-fill bucket per missing example, containing the short level with
    /// the other dimensions drawn by weight. Any remainder up to `n` comes
    /// from `select_next`.
    pub fn select_for_shortfalls(
        &mut self,
        shortfalls: &[LevelShortfall],
        n: usize,
    ) -> Vec<SelectedBucket> {
        if n == 0 || self.space.is_empty() {
            return Vec::new();
        }

        let mut selected = Vec::new();
        'outer: for shortfall in shortfalls {
            let Some(dim_index) = self
                .space
                .dimensions()
                .iter()
                .position(|d| d.name == shortfall.dimension)
            else {
                tracing::warn!(dimension = %shortfall.dimension, "shortfall names unknown dimension");
                continue;
            };
            if self.space.dimensions()[dim_index].level(&shortfall.level).is_none() {
                tracing::warn!(
                    dimension = %shortfall.dimension,
                    level = %shortfall.level,
                    "shortfall names unknown level"
                );
                continue;
            }
            for _ in 0..shortfall.shortfall {
                if selected.len() >= n {
                    break 'outer;
                }
                let key = self.weighted_bucket(&[(dim_index, shortfall.level.as_str())]);
                selected.push(SelectedBucket {
                    key,
                    is_gap_fill: true,
                });
            }
        }

        if selected.len() < n {
            let rest = self.select_next(n - selected.len());
            selected.extend(rest);
        }
        selected
    }

    fn gap_buckets(&self, n: usize) -> Result<Vec<SelectedBucket>, StoreError> {
        let records = self.store.snapshot()?;
        let totals = self
            .space
            .level_totals(records.iter().map(|(k, r)| (k, r.generated_count)));
        let ordered = self.store.least_covered(self.space.bucket_count())?;

        Ok(ordered
            .into_iter()
            .filter(|bucket| {
                let count = records.get(bucket).map(|r| r.generated_count).unwrap_or(0);
                self.space.bucket_shortfall(bucket, count, &totals).is_some()
            })
            .take(n)
            .map(|key| SelectedBucket {
                key,
                is_gap_fill: true,
            })
            .collect())
    }

    /// One bucket composed of independent per-dimension draws, with some
    /// positions pinned to a fixed level.
    fn weighted_bucket(&mut self, pinned: &[(usize, &str)]) -> BucketKey {
        let mut levels = Vec::with_capacity(self.space.dimensions().len());
        for (i, dim) in self.space.dimensions().iter().enumerate() {
            if let Some((_, name)) = pinned.iter().find(|(idx, _)| *idx == i) {
                levels.push((*name).to_string());
                continue;
            }
            let pos = match &self.weights[i] {
                Some(dist) => dist.sample(&mut self.rng),
                None => 0,
            };
            levels.push(dim.levels[pos].name.clone());
        }
        BucketKey(levels)
    }
}
