/// Pipeline integration tests — end-to-end coverage-driven generation with
/// an in-process backend.

use corpus_forge::core::backend::{BackendError, GenerationRequest, TextBackend};
use corpus_forge::core::pipeline::CorpusEngine;
use corpus_forge::core::prompt::PromptTemplate;
use corpus_forge::core::settings::Settings;
use corpus_forge::core::space::BucketSpace;
use corpus_forge::core::store::{CoverageStore, MemoryCoverageStore, SqliteCoverageStore, StoreError};
use corpus_forge::schema::bucket::BucketKey;
use corpus_forge::schema::coverage::CoverageRecord;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Answers with a score inside the tier named in the prompt, varied a
/// little per call.
struct TierBackend {
    calls: AtomicUsize,
}

impl TierBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

impl TextBackend for TierBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let tier = request.prompt.split('|').nth(1).unwrap_or("authentic");
        let mid = match tier {
            "failed" => 0.3,
            "struggling" => 0.5,
            "authentic" => 0.7,
            _ => 0.9,
        };
        let score = mid + [-0.05, 0.0, 0.05][n % 3];
        Ok(format!(
            "<think>tier {tier}</think>\n```json\n{{\"character_response\": {{\"dialogue\": \"I can't do all of it, but I can help tomorrow.\"}}, \"training_metadata\": {{\"authenticity_score\": {score:.2}}}}}\n```"
        ))
    }
}

struct DownBackend;

impl TextBackend for DownBackend {
    fn generate(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
        Err(BackendError::Rejected(503))
    }
}

struct BrokenStore;

impl CoverageStore for BrokenStore {
    fn get_count(&self, _bucket: &BucketKey) -> Result<u64, StoreError> {
        Err(StoreError::StoreUnavailable("disk gone".to_string()))
    }
    fn increment(&self, _bucket: &BucketKey) -> Result<(), StoreError> {
        Err(StoreError::StoreUnavailable("disk gone".to_string()))
    }
    fn least_covered(&self, _limit: usize) -> Result<Vec<BucketKey>, StoreError> {
        Err(StoreError::StoreUnavailable("disk gone".to_string()))
    }
    fn snapshot(&self) -> Result<BTreeMap<BucketKey, CoverageRecord>, StoreError> {
        Err(StoreError::StoreUnavailable("disk gone".to_string()))
    }
}

fn test_space() -> Arc<BucketSpace> {
    Arc::new(BucketSpace::load_from_ron(Path::new("tests/fixtures/test_space.ron")).unwrap())
}

fn template() -> PromptTemplate {
    PromptTemplate::parse("{capacity_level}|{authenticity_target}|{effective_capacity}|{support_needed}")
        .unwrap()
}

fn settings(batch_size: usize) -> Settings {
    let mut settings = Settings::default();
    settings.generation.batch_size = batch_size;
    settings.generation.max_rounds = 10;
    settings.generation.retry_backoff_ms = 0;
    settings.generation.max_backoff_ms = 0;
    settings
}

#[test]
fn cycle_fills_every_level_of_small_space() {
    let dir = tempfile::tempdir().unwrap();
    let space = test_space();
    let store = Arc::new(
        SqliteCoverageStore::open(&dir.path().join("coverage.db"), Arc::clone(&space)).unwrap(),
    );

    let mut engine = CorpusEngine::builder()
        .settings(settings(4))
        .seed(42)
        .with_space(Arc::clone(&space))
        .with_store(store.clone())
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();

    let outcome = engine.run_cycle(16).unwrap();
    assert_eq!(outcome.batch.len(), 16);
    assert_eq!(outcome.failures, 0);
    assert!(outcome.validation.passed, "{}", outcome.validation);

    let coverage = outcome.coverage.unwrap();
    assert!(coverage.underfilled.is_empty());
    assert_eq!(coverage.total_examples, 16);

    assert_eq!(outcome.attempts.len(), 16);
    assert!(engine.attempt_log().is_empty());

    let history = store.batch_history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].passed);
}

#[test]
fn selection_loop_terminates_with_no_underfilled_buckets() {
    let space = test_space();
    let store = Arc::new(MemoryCoverageStore::new(Arc::clone(&space)));
    let mut engine = CorpusEngine::builder()
        .settings(settings(1))
        .with_space(Arc::clone(&space))
        .with_store(store)
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();

    let mut rounds = 0;
    while !engine.coverage_report().unwrap().underfilled.is_empty() {
        let outcome = engine.run_round(1).unwrap();
        assert_eq!(outcome.examples.len(), 1);
        assert!(outcome.examples[0].is_gap_fill);
        rounds += 1;
        assert!(rounds <= 16, "gap filling did not converge");
    }
    // Lexical tie-breaks visit every crisis bucket first, then one bucket
    // for each remaining capacity level
    assert_eq!(rounds, 7);
}

#[test]
fn shortfalls_trigger_gap_round() {
    let space = test_space();
    let store = Arc::new(MemoryCoverageStore::new(Arc::clone(&space)));
    let mut engine = CorpusEngine::builder()
        .settings(settings(4))
        .with_space(Arc::clone(&space))
        .with_store(store)
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();

    // Four examples reach every authenticity level but only one capacity
    let outcome = engine.run_cycle(4).unwrap();
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.gap_rounds, 1);
    assert_eq!(outcome.batch.len(), 7);
    assert!(outcome.validation.shortfalls.is_empty());
    assert!(outcome.batch[4..].iter().all(|e| e.is_gap_fill));
}

#[test]
fn failed_generations_are_not_counted() {
    let space = test_space();
    let store = Arc::new(MemoryCoverageStore::new(Arc::clone(&space)));
    let mut engine = CorpusEngine::builder()
        .settings(settings(3))
        .with_space(Arc::clone(&space))
        .with_store(store.clone())
        .with_backend(Arc::new(DownBackend))
        .with_template(template())
        .build()
        .unwrap();

    let outcome = engine.run_round(3).unwrap();
    assert!(outcome.examples.is_empty());
    assert_eq!(outcome.failed.len(), 3);
    assert!(store.snapshot().unwrap().is_empty());
    // Three attempts per bucket, all logged
    assert_eq!(engine.attempt_log().len(), 9);
}

#[test]
fn unavailable_store_still_generates() {
    let mut engine = CorpusEngine::builder()
        .settings(settings(5))
        .with_space(test_space())
        .with_store(Arc::new(BrokenStore))
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();

    let outcome = engine.run_round(5).unwrap();
    assert_eq!(outcome.examples.len(), 5);
    assert!(outcome.examples.iter().all(|e| !e.is_gap_fill));
    assert!(engine.coverage_report().is_err());
}

#[test]
fn stop_flag_ends_round_before_next_bucket() {
    let space = test_space();
    let store = Arc::new(MemoryCoverageStore::new(Arc::clone(&space)));
    let mut engine = CorpusEngine::builder()
        .settings(settings(4))
        .with_space(Arc::clone(&space))
        .with_store(store.clone())
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();

    engine.stop_handle().store(true, Ordering::SeqCst);
    let outcome = engine.run_cycle(8).unwrap();
    assert!(outcome.stopped);
    assert!(outcome.batch.is_empty());
    assert_eq!(outcome.gap_rounds, 0);
    assert!(store.snapshot().unwrap().is_empty());
}

#[test]
fn same_seed_same_buckets() {
    let run = || {
        let space = test_space();
        let mut engine = CorpusEngine::builder()
            .settings(settings(6))
            .seed(1234)
            .with_space(Arc::clone(&space))
            .with_store(Arc::new(MemoryCoverageStore::new(space)))
            .with_backend(TierBackend::new())
            .with_template(template())
            .build()
            .unwrap();
        let mut buckets = Vec::new();
        for _ in 0..5 {
            let outcome = engine.run_round(6).unwrap();
            buckets.extend(outcome.examples.into_iter().map(|e| e.bucket));
        }
        buckets
    };
    assert_eq!(run(), run());
}

#[test]
fn settings_file_feeds_the_engine() {
    let space = test_space();
    let engine = CorpusEngine::builder()
        .settings_file("space_data/settings.ron")
        .unwrap()
        .with_space(Arc::clone(&space))
        .with_store(Arc::new(MemoryCoverageStore::new(space)))
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();
    assert_eq!(engine.settings().generation.batch_size, 12);
    assert_eq!(engine.settings().backend.model, "qwen3:8b");
}

#[test]
fn attempt_log_is_drained_each_cycle() {
    let space = test_space();
    let mut engine = CorpusEngine::builder()
        .settings(settings(4))
        .with_space(Arc::clone(&space))
        .with_store(Arc::new(MemoryCoverageStore::new(space)))
        .with_backend(Arc::new(DownBackend))
        .with_template(template())
        .build()
        .unwrap();

    let first = engine.run_cycle(2).unwrap();
    assert_eq!(first.failures, first.attempts.len() / 3);
    assert!(engine.attempt_log().is_empty());

    let second = engine.run_cycle(2).unwrap();
    assert_eq!(second.attempts.len(), first.attempts.len());
    assert!(second.attempts.iter().all(|a| a.attempt <= 3));
}

#[test]
fn external_stop_flag_is_honoured() {
    let space = test_space();
    let flag = Arc::new(AtomicBool::new(false));
    let mut engine = CorpusEngine::builder()
        .settings(settings(2))
        .stop_flag(Arc::clone(&flag))
        .with_space(Arc::clone(&space))
        .with_store(Arc::new(MemoryCoverageStore::new(space)))
        .with_backend(TierBackend::new())
        .with_template(template())
        .build()
        .unwrap();

    assert_eq!(engine.run_round(2).unwrap().examples.len(), 2);
    flag.store(true, Ordering::SeqCst);
    let outcome = engine.run_round(2).unwrap();
    assert!(outcome.stopped);
    assert!(outcome.examples.is_empty());
}
