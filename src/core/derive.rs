/// Derived-parameter calculator: turns a bucket into concrete scenario
/// numbers.
///
/// Capacity is drawn inside the capacity level's range. The gap between
/// support needed and capacity is drawn from the authenticity tier's band,
/// restricted to the part of the band that keeps support inside the domain.
/// Only when no such part exists is support clamped, and the parameters are
/// then flagged `clamped`.

use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;

use crate::core::space::{BucketSpace, SpaceError, DEFAULT_CAPACITY_DOMAIN};
use crate::schema::bucket::{AuthenticityTier, BucketKey};
use crate::schema::dimension::{DimensionKind, ScalarRange};
use crate::schema::scenario::ScenarioParameters;

/// A participant with capacity `c` can realistically support up to
/// `c + CAPACITY_HEADROOM`.
pub const CAPACITY_HEADROOM: f64 = 2.0;

pub struct ScenarioCalculator {
    space: Arc<BucketSpace>,
}

impl ScenarioCalculator {
    pub fn new(space: Arc<BucketSpace>) -> Self {
        Self { space }
    }

    pub fn derive(
        &self,
        bucket: &BucketKey,
        is_gap_fill: bool,
        rng: &mut StdRng,
    ) -> Result<ScenarioParameters, SpaceError> {
        self.space.check_bucket(bucket)?;

        let (domain, capacity_level, capacity_range) =
            match self.space.dimension_of_kind(DimensionKind::Capacity) {
                Some((idx, dim)) => {
                    let domain = dim.domain.unwrap_or(DEFAULT_CAPACITY_DOMAIN);
                    let level = self.space.level_of(bucket, idx);
                    let range = level.and_then(|l| l.range).unwrap_or(domain);
                    (domain, level.map(|l| l.name.clone()), range)
                }
                None => {
                    let mid = DEFAULT_CAPACITY_DOMAIN.midpoint();
                    (DEFAULT_CAPACITY_DOMAIN, None, ScalarRange::new(mid, mid))
                }
            };

        let authenticity = self
            .space
            .dimension_of_kind(DimensionKind::Authenticity)
            .and_then(|(idx, _)| self.space.level_of(bucket, idx));

        let complexity_type = self
            .space
            .dimension_of_kind(DimensionKind::Complexity)
            .and_then(|(idx, _)| bucket.level(idx))
            .map(str::to_string);

        let Some(level) = authenticity else {
            let capacity = draw(rng, capacity_range.min, capacity_range.max);
            return Ok(ScenarioParameters {
                bucket: bucket.clone(),
                is_gap_fill,
                capacity_level,
                effective_capacity: capacity,
                support_needed: capacity,
                support_gap: 0.0,
                authenticity_target: None,
                authenticity_range: None,
                complexity_type,
                clamped: false,
            });
        };

        let tier = AuthenticityTier::from_level_name(&level.name).ok_or_else(|| {
            SpaceError::ConfigurationInvalid(format!(
                "authenticity level '{}' is not a known tier",
                level.name
            ))
        })?;

        let (capacity, offset, clamped) = draw_capacity_and_offset(rng, tier, capacity_range, domain);
        if clamped {
            tracing::warn!(
                bucket = %bucket,
                tier = tier.name(),
                "gap band cannot be honoured inside the domain, support clamped"
            );
        }

        let support = domain.clamp(capacity + offset);
        let support_gap = if tier.support_below_capacity() {
            -offset
        } else {
            offset
        };

        Ok(ScenarioParameters {
            bucket: bucket.clone(),
            is_gap_fill,
            capacity_level,
            effective_capacity: capacity,
            support_needed: support,
            support_gap,
            authenticity_target: Some(level.name.clone()),
            authenticity_range: level.range,
            complexity_type,
            clamped,
        })
    }
}

/// Draw capacity and the signed offset `support - capacity`.
///
/// The offset is first narrowed to values some capacity in the level range
/// can pair with while keeping support in the domain; capacity is then
/// drawn from the matching part of the level range.
fn draw_capacity_and_offset(
    rng: &mut StdRng,
    tier: AuthenticityTier,
    level: ScalarRange,
    domain: ScalarRange,
) -> (f64, f64, bool) {
    let (band_lo, band_hi) = tier.gap_band();
    let (offset_lo, offset_hi) = if tier.support_below_capacity() {
        (-band_hi, -band_lo)
    } else {
        (band_lo, band_hi)
    };

    let lo = offset_lo.max(domain.min - level.max);
    let hi = offset_hi.min(domain.max - level.min);
    if lo > hi {
        let capacity = draw(rng, level.min, level.max);
        let offset = draw(rng, offset_lo, offset_hi);
        return (capacity, offset, true);
    }

    let offset = draw(rng, lo, hi);
    let c_lo = level.min.max(domain.min - offset);
    let c_hi = level.max.min(domain.max - offset);
    (draw(rng, c_lo, c_hi), offset, false)
}

fn draw(rng: &mut StdRng, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}
