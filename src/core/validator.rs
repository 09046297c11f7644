/// Spectrum validator: checks a finished batch for coverage and
/// distribution shape.
///
/// Every check reads only the batch and the bucket space. A failing batch is
/// an ordinary report value; the production loop decides what to do with
/// it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::derive::CAPACITY_HEADROOM;
use crate::core::space::BucketSpace;
use crate::schema::dimension::DimensionKind;
use crate::schema::example::Example;

pub const CHECK_PER_LEVEL_MINIMUM: &str = "per_level_minimum";
pub const CHECK_MAX_EXCELLENT_SHARE: &str = "max_excellent_share";
pub const CHECK_SCORE_VARIANCE: &str = "score_variance";
pub const CHECK_CAPACITY_CONSTRAINT: &str = "capacity_constraint";
pub const CHECK_COMPLEXITY_VARIETY: &str = "complexity_variety";
pub const CHECK_TARGET_ADHERENCE: &str = "target_adherence";
pub const CHECK_REALISTIC_RESPONSES: &str = "realistic_responses";

/// Phrases that show a response acknowledges a limitation.
pub const DEFAULT_LIMITATION_PHRASES: &[&str] = &[
    "can't",
    "cannot",
    "unable",
    "sorry",
    "don't have",
    "need to",
    "have to",
    "later",
    "tomorrow",
    "not right now",
    "too much",
    "overwhelmed",
    "exhausted",
    "wiped",
    "running on empty",
    "barely",
    "can barely",
];

/// Eager agreement that rings false from someone with almost nothing left.
pub const DEFAULT_RESILIENCE_PHRASES: &[&str] =
    &["of course", "no problem", "happy to", "glad to", "definitely"];

pub const DEFAULT_MELODRAMA_PHRASES: &[&str] = &[
    "absolutely devastated",
    "completely destroyed",
    "utterly impossible",
    "totally broken",
    "entirely shattered",
];

/// Capacity below which, with need above `RESILIENCE_NEED_FLOOR`, eager
/// agreement counts as unrealistic.
pub const RESILIENCE_CAPACITY_CEILING: f64 = 3.0;
pub const RESILIENCE_NEED_FLOOR: f64 = 7.0;

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationThresholds {
    pub max_excellent_share: f64,
    pub min_score_variance: f64,
    pub capacity_violation_tolerance: f64,
    pub limitation_phrases: Vec<String>,
    pub min_complexity_types: usize,
    pub max_baseline_share: f64,
    pub max_target_miss_rate: f64,
    pub resilience_phrases: Vec<String>,
    pub max_resilience_rate: f64,
    pub melodrama_phrases: Vec<String>,
    pub max_melodrama_rate: f64,
    /// Authenticity level counted by the excellent-share ceiling.
    pub excellent_level: String,
    /// Complexity level counted by the baseline-share ceiling.
    pub baseline_level: String,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            max_excellent_share: 0.4,
            min_score_variance: 0.02,
            capacity_violation_tolerance: 0.1,
            limitation_phrases: phrases(DEFAULT_LIMITATION_PHRASES),
            min_complexity_types: 5,
            max_baseline_share: 0.3,
            max_target_miss_rate: 0.25,
            resilience_phrases: phrases(DEFAULT_RESILIENCE_PHRASES),
            max_resilience_rate: 0.05,
            melodrama_phrases: phrases(DEFAULT_MELODRAMA_PHRASES),
            max_melodrama_rate: 0.05,
            excellent_level: "excellent".to_string(),
            baseline_level: "baseline".to_string(),
        }
    }
}

impl ValidationThresholds {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("max_excellent_share", self.max_excellent_share),
            ("capacity_violation_tolerance", self.capacity_violation_tolerance),
            ("max_baseline_share", self.max_baseline_share),
            ("max_target_miss_rate", self.max_target_miss_rate),
            ("max_resilience_rate", self.max_resilience_rate),
            ("max_melodrama_rate", self.max_melodrama_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} {} outside [0, 1]", name, value));
            }
        }
        if self.min_score_variance.is_nan() || self.min_score_variance < 0.0 {
            return Err(format!(
                "min_score_variance {} must be non-negative",
                self.min_score_variance
            ));
        }
        Ok(())
    }
}

/// A level whose batch count fell below its minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelShortfall {
    pub dimension: String,
    pub level: String,
    pub required: u32,
    pub actual: u32,
    pub shortfall: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    fn new(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub per_check: BTreeMap<String, CheckOutcome>,
    pub shortfalls: Vec<LevelShortfall>,
}

impl ValidationReport {
    pub fn failed_checks(&self) -> Vec<String> {
        self.per_check
            .iter()
            .filter(|(_, o)| !o.passed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn check(&self, name: &str) -> Option<&CheckOutcome> {
        self.per_check.get(name)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Validation: {}",
            if self.passed { "PASSED" } else { "FAILED" }
        )?;
        for (name, outcome) in &self.per_check {
            let mark = if outcome.passed { "ok" } else { "FAIL" };
            writeln!(f, "  [{:>4}] {}: {}", mark, name, outcome.detail)?;
        }
        for s in &self.shortfalls {
            writeln!(
                f,
                "  short: {}={} has {}/{} (needs {} more)",
                s.dimension, s.level, s.actual, s.required, s.shortfall
            )?;
        }
        Ok(())
    }
}

/// Whether an example asks for more than its character can give without
/// the response acknowledging it.
pub fn capacity_violation(example: &Example, phrases: &[String]) -> bool {
    if example.support_level_needed <= example.effective_capacity + CAPACITY_HEADROOM {
        return false;
    }
    !contains_any(&example.response_text, phrases)
}

/// Whether a near-empty participant facing a heavy request answers with
/// eager agreement.
pub fn unrealistic_resilience(example: &Example, phrases: &[String]) -> bool {
    if example.effective_capacity >= RESILIENCE_CAPACITY_CEILING
        || example.support_level_needed <= RESILIENCE_NEED_FLOOR
    {
        return false;
    }
    contains_any(&example.response_text, phrases)
}

pub fn melodramatic(example: &Example, phrases: &[String]) -> bool {
    contains_any(&example.response_text, phrases)
}

fn contains_any(text: &str, phrases: &[String]) -> bool {
    let text = text.to_lowercase();
    phrases.iter().any(|p| text.contains(&p.to_lowercase()))
}

/// Sample variance (n - 1 denominator). `None` below two values.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    Some(values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0))
}

pub struct SpectrumValidator {
    space: Arc<BucketSpace>,
    thresholds: ValidationThresholds,
}

impl SpectrumValidator {
    pub fn new(space: Arc<BucketSpace>, thresholds: ValidationThresholds) -> Self {
        Self { space, thresholds }
    }

    pub fn thresholds(&self) -> &ValidationThresholds {
        &self.thresholds
    }

    pub fn validate(&self, batch: &[Example]) -> ValidationReport {
        let mut per_check = BTreeMap::new();

        let shortfalls = self.level_shortfalls(batch);
        let minimum = if shortfalls.is_empty() {
            CheckOutcome::new(true, "every level meets its minimum")
        } else {
            let items: Vec<String> = shortfalls
                .iter()
                .map(|s| {
                    format!(
                        "{}={} short {} ({}/{})",
                        s.dimension, s.level, s.shortfall, s.actual, s.required
                    )
                })
                .collect();
            CheckOutcome::new(false, items.join("; "))
        };
        per_check.insert(CHECK_PER_LEVEL_MINIMUM.to_string(), minimum);
        per_check.insert(CHECK_MAX_EXCELLENT_SHARE.to_string(), self.excellent_share(batch));
        per_check.insert(CHECK_SCORE_VARIANCE.to_string(), self.score_variance(batch));
        per_check.insert(CHECK_CAPACITY_CONSTRAINT.to_string(), self.capacity_constraint(batch));
        per_check.insert(CHECK_REALISTIC_RESPONSES.to_string(), self.realistic_responses(batch));
        if let Some(outcome) = self.complexity_variety(batch) {
            per_check.insert(CHECK_COMPLEXITY_VARIETY.to_string(), outcome);
        }
        per_check.insert(CHECK_TARGET_ADHERENCE.to_string(), self.target_adherence(batch));

        let passed = per_check.values().all(|o| o.passed);
        tracing::info!(
            examples = batch.len(),
            passed,
            shortfalls = shortfalls.len(),
            "batch validated"
        );

        ValidationReport {
            passed,
            per_check,
            shortfalls,
        }
    }

    fn level_shortfalls(&self, batch: &[Example]) -> Vec<LevelShortfall> {
        let mut out = Vec::new();
        for (i, dim) in self.space.dimensions().iter().enumerate() {
            for level in &dim.levels {
                let actual = batch
                    .iter()
                    .filter(|e| e.bucket.level(i) == Some(level.name.as_str()))
                    .count() as u32;
                if actual < level.min_examples {
                    out.push(LevelShortfall {
                        dimension: dim.name.clone(),
                        level: level.name.clone(),
                        required: level.min_examples,
                        actual,
                        shortfall: level.min_examples - actual,
                    });
                }
            }
        }
        out
    }

    fn excellent_share(&self, batch: &[Example]) -> CheckOutcome {
        let Some((idx, _)) = self.space.dimension_of_kind(DimensionKind::Authenticity) else {
            return CheckOutcome::new(true, "no authenticity dimension");
        };
        if batch.is_empty() {
            return CheckOutcome::new(true, "empty batch");
        }
        let excellent = batch
            .iter()
            .filter(|e| e.bucket.level(idx) == Some(self.thresholds.excellent_level.as_str()))
            .count();
        let share = excellent as f64 / batch.len() as f64;
        CheckOutcome::new(
            share <= self.thresholds.max_excellent_share,
            format!(
                "{:.1}% excellent (ceiling {:.1}%)",
                share * 100.0,
                self.thresholds.max_excellent_share * 100.0
            ),
        )
    }

    fn score_variance(&self, batch: &[Example]) -> CheckOutcome {
        let scores: Vec<f64> = batch.iter().map(|e| e.authenticity_score).collect();
        match sample_variance(&scores) {
            None => CheckOutcome::new(true, "fewer than two examples, skipped"),
            Some(var) => CheckOutcome::new(
                var >= self.thresholds.min_score_variance,
                format!(
                    "variance {:.4} (floor {:.4})",
                    var, self.thresholds.min_score_variance
                ),
            ),
        }
    }

    fn capacity_constraint(&self, batch: &[Example]) -> CheckOutcome {
        if batch.is_empty() {
            return CheckOutcome::new(true, "empty batch");
        }
        let violations = batch
            .iter()
            .filter(|e| capacity_violation(e, &self.thresholds.limitation_phrases))
            .count();
        let rate = violations as f64 / batch.len() as f64;
        CheckOutcome::new(
            rate <= self.thresholds.capacity_violation_tolerance,
            format!(
                "{} of {} examples exceed capacity without acknowledging it",
                violations,
                batch.len()
            ),
        )
    }

    fn realistic_responses(&self, batch: &[Example]) -> CheckOutcome {
        if batch.is_empty() {
            return CheckOutcome::new(true, "empty batch");
        }
        let t = &self.thresholds;
        let resilient = batch
            .iter()
            .filter(|e| unrealistic_resilience(e, &t.resilience_phrases))
            .count();
        let melodrama = batch
            .iter()
            .filter(|e| melodramatic(e, &t.melodrama_phrases))
            .count();
        let total = batch.len() as f64;
        let resilience_rate = resilient as f64 / total;
        let melodrama_rate = melodrama as f64 / total;
        CheckOutcome::new(
            resilience_rate <= t.max_resilience_rate && melodrama_rate <= t.max_melodrama_rate,
            format!(
                "{} unrealistically resilient ({:.1}%, ceiling {:.1}%), {} melodramatic ({:.1}%, ceiling {:.1}%)",
                resilient,
                resilience_rate * 100.0,
                t.max_resilience_rate * 100.0,
                melodrama,
                melodrama_rate * 100.0,
                t.max_melodrama_rate * 100.0
            ),
        )
    }

    fn complexity_variety(&self, batch: &[Example]) -> Option<CheckOutcome> {
        let (idx, dim) = self.space.dimension_of_kind(DimensionKind::Complexity)?;
        if batch.is_empty() {
            return Some(CheckOutcome::new(true, "empty batch"));
        }

        let mut seen: Vec<&str> = batch.iter().filter_map(|e| e.bucket.level(idx)).collect();
        seen.sort_unstable();
        seen.dedup();
        let required = self.thresholds.min_complexity_types.min(dim.levels.len());

        let baseline = batch
            .iter()
            .filter(|e| e.bucket.level(idx) == Some(self.thresholds.baseline_level.as_str()))
            .count();
        let baseline_share = baseline as f64 / batch.len() as f64;

        Some(CheckOutcome::new(
            seen.len() >= required && baseline_share <= self.thresholds.max_baseline_share,
            format!(
                "{} distinct types (need {}), baseline {:.1}% (ceiling {:.1}%)",
                seen.len(),
                required,
                baseline_share * 100.0,
                self.thresholds.max_baseline_share * 100.0
            ),
        ))
    }

    fn target_adherence(&self, batch: &[Example]) -> CheckOutcome {
        let Some((idx, dim)) = self.space.dimension_of_kind(DimensionKind::Authenticity) else {
            return CheckOutcome::new(true, "no authenticity dimension");
        };
        let ranged: Vec<(&Example, _)> = batch
            .iter()
            .filter_map(|e| {
                let range = e.bucket.level(idx).and_then(|l| dim.level(l))?.range?;
                Some((e, range))
            })
            .collect();
        if ranged.is_empty() {
            return CheckOutcome::new(true, "no examples with a target range");
        }
        let misses = ranged
            .iter()
            .filter(|(e, r)| !r.contains(e.authenticity_score))
            .count();
        let rate = misses as f64 / ranged.len() as f64;
        CheckOutcome::new(
            rate <= self.thresholds.max_target_miss_rate,
            format!("{} of {} scores outside their target range", misses, ranged.len()),
        )
    }
}
