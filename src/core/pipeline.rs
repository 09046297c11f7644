/// The production loop: Select → Derive → Generate → Record → Validate.
///
/// Wires the bucket selector, scenario calculator, generation adapter,
/// coverage store and spectrum validator into rounds and cycles. Validator
/// shortfalls drive extra gap-filling rounds before a batch is final.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::backend::{BackendError, OllamaBackend, TextBackend};
use crate::core::batch_writer::BatchWriteError;
use crate::core::derive::ScenarioCalculator;
use crate::core::generation::{AttemptRecord, GenerationAdapter, GenerationError, RetryPolicy};
use crate::core::prompt::{PromptError, PromptTemplate};
use crate::core::reporter::{CoverageReport, CoverageReporter};
use crate::core::selector::BucketSelector;
use crate::core::settings::{Settings, SettingsError};
use crate::core::space::{BucketSpace, SpaceError};
use crate::core::store::{CoverageStore, SqliteCoverageStore, StoreError};
use crate::core::validator::{SpectrumValidator, ValidationReport};
use crate::schema::bucket::{BucketKey, SelectedBucket};
use crate::schema::coverage::BatchQuality;
use crate::schema::example::{Batch, Example};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("space error: {0}")]
    Space(#[from] SpaceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("batch write error: {0}")]
    BatchWrite(#[from] BatchWriteError),
}

/// Examples produced by one round, plus the buckets that failed.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    pub examples: Vec<Example>,
    pub failed: Vec<BucketKey>,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub batch: Batch,
    pub validation: ValidationReport,
    /// Absent when the store could not be read after the cycle.
    pub coverage: Option<CoverageReport>,
    pub rounds: usize,
    pub gap_rounds: usize,
    pub failures: usize,
    pub stopped: bool,
    /// Every generation attempt made since the previous cycle.
    pub attempts: Vec<AttemptRecord>,
}

/// The coverage-driven generation engine. Built via `CorpusEngine::builder()`.
pub struct CorpusEngine {
    store: Arc<dyn CoverageStore>,
    selector: BucketSelector,
    calculator: ScenarioCalculator,
    adapter: GenerationAdapter,
    validator: SpectrumValidator,
    reporter: CoverageReporter,
    settings: Settings,
    rng: StdRng,
    stop: Arc<AtomicBool>,
    cycle_count: u64,
}

/// Builder for constructing a `CorpusEngine`.
pub struct CorpusEngineBuilder {
    settings: Settings,
    seed: Option<u64>,
    stop: Option<Arc<AtomicBool>>,
    /// Directly provided space (for testing without files).
    space: Option<Arc<BucketSpace>>,
    /// Directly provided store (for testing without a database file).
    store: Option<Arc<dyn CoverageStore>>,
    /// Directly provided backend (for testing without a model server).
    backend: Option<Arc<dyn TextBackend>>,
    /// Directly provided prompt template (for testing without files).
    template: Option<PromptTemplate>,
}

impl CorpusEngine {
    pub fn builder() -> CorpusEngineBuilder {
        CorpusEngineBuilder {
            settings: Settings::default(),
            seed: None,
            stop: None,
            space: None,
            store: None,
            backend: None,
            template: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared flag; setting it stops the loop before the next bucket.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Attempts not yet handed out by `run_cycle`.
    pub fn attempt_log(&self) -> &[AttemptRecord] {
        self.adapter.attempt_log()
    }

    pub fn coverage_report(&self) -> Result<CoverageReport, StoreError> {
        self.reporter.report()
    }

    /// Select `n` buckets and generate one example for each.
    pub fn run_round(&mut self, n: usize) -> Result<RoundOutcome, PipelineError> {
        let selected = self.selector.select_next(n);
        self.produce(selected)
    }

    /// Produce up to `target` examples, validate them, and spend up to
    /// `max_gap_rounds` extra rounds on whatever levels came up short.
    pub fn run_cycle(&mut self, target: usize) -> Result<CycleOutcome, PipelineError> {
        self.cycle_count += 1;
        let batch_size = self.settings.generation.batch_size.max(1);
        let max_rounds = self.settings.generation.max_rounds;

        let mut batch: Batch = Vec::with_capacity(target);
        let mut rounds = 0;
        let mut failures = 0;
        let mut stopped = false;

        while batch.len() < target && rounds < max_rounds {
            let n = batch_size.min(target - batch.len());
            let outcome = self.run_round(n)?;
            rounds += 1;
            failures += outcome.failed.len();
            batch.extend(outcome.examples);
            tracing::info!(round = rounds, produced = batch.len(), target, "round complete");
            if outcome.stopped {
                stopped = true;
                break;
            }
        }

        let mut validation = self.validator.validate(&batch);
        let mut gap_rounds = 0;
        while !stopped
            && !validation.passed
            && !validation.shortfalls.is_empty()
            && gap_rounds < self.settings.generation.max_gap_rounds
        {
            let needed: usize = validation
                .shortfalls
                .iter()
                .map(|s| s.shortfall as usize)
                .sum();
            let selected = self.selector.select_for_shortfalls(&validation.shortfalls, needed);
            let outcome = self.produce(selected)?;
            gap_rounds += 1;
            failures += outcome.failed.len();
            stopped = outcome.stopped;
            batch.extend(outcome.examples);
            validation = self.validator.validate(&batch);
            tracing::info!(
                gap_round = gap_rounds,
                produced = batch.len(),
                shortfalls = validation.shortfalls.len(),
                "gap round complete"
            );
        }

        let quality = BatchQuality {
            batch_id: format!("cycle{:04}", self.cycle_count),
            recorded_at: chrono::Utc::now(),
            total_examples: batch.len(),
            passed: validation.passed,
            failed_checks: validation.failed_checks(),
        };
        if let Err(e) = self.store.record_batch_quality(&quality) {
            tracing::warn!(error = %e, "could not record batch quality");
        }

        let coverage = match self.reporter.report() {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "coverage report unavailable");
                None
            }
        };

        tracing::info!(
            examples = batch.len(),
            rounds,
            gap_rounds,
            failures,
            passed = validation.passed,
            "cycle complete"
        );

        Ok(CycleOutcome {
            batch,
            validation,
            coverage,
            rounds,
            gap_rounds,
            failures,
            stopped,
            attempts: self.adapter.take_attempt_log(),
        })
    }

    fn produce(&mut self, selected: Vec<SelectedBucket>) -> Result<RoundOutcome, PipelineError> {
        let mut outcome = RoundOutcome::default();

        for pick in selected {
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!("stop requested, ending round early");
                outcome.stopped = true;
                break;
            }

            let params = self
                .calculator
                .derive(&pick.key, pick.is_gap_fill, &mut self.rng)?;

            let example = match self.adapter.generate(&params) {
                Ok(example) => example,
                Err(GenerationError::GenerationFailed {
                    bucket,
                    attempts,
                    reason,
                }) => {
                    tracing::warn!(bucket = %bucket, attempts, reason = %reason, "generation failed, skipping bucket");
                    outcome.failed.push(bucket);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = self.store.increment(&pick.key) {
                tracing::warn!(bucket = %pick.key, error = %e, "coverage increment failed");
            }
            outcome.examples.push(example);
        }

        Ok(outcome)
    }
}

impl CorpusEngineBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Load settings from a RON file.
    pub fn settings_file(mut self, path: &str) -> Result<Self, PipelineError> {
        self.settings = Settings::load_from_ron(Path::new(path))?;
        Ok(self)
    }

    /// Overrides the seed from settings.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Provide the bucket space directly (for testing without files).
    pub fn with_space(mut self, space: Arc<BucketSpace>) -> Self {
        self.space = Some(space);
        self
    }

    /// Provide the coverage store directly (for testing without files).
    pub fn with_store(mut self, store: Arc<dyn CoverageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Provide the text backend directly (for testing without a server).
    pub fn with_backend(mut self, backend: Arc<dyn TextBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Provide the prompt template directly (for testing without files).
    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn build(self) -> Result<CorpusEngine, PipelineError> {
        let settings = self.settings;
        settings.validate()?;
        let generation = &settings.generation;

        let space = match self.space {
            Some(space) => space,
            None => Arc::new(BucketSpace::load_from_ron(Path::new(&generation.space_path))?),
        };

        let store: Arc<dyn CoverageStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteCoverageStore::open(
                Path::new(&generation.coverage_db),
                Arc::clone(&space),
            )?),
        };

        let backend: Arc<dyn TextBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(OllamaBackend::new(&settings.backend)?),
        };

        let template = match self.template {
            Some(template) => template,
            None => match &generation.prompt_path {
                Some(path) if Path::new(path).exists() => {
                    PromptTemplate::load_from_ron(Path::new(path))?
                }
                _ => PromptTemplate::builtin()?,
            },
        };

        let seed = self.seed.unwrap_or(generation.seed);
        let adapter = GenerationAdapter::new(
            Arc::clone(&backend),
            template,
            Arc::clone(&space),
            &settings.backend,
            RetryPolicy::from_settings(generation),
        )?;

        tracing::info!(
            backend = %backend.describe(),
            buckets = space.bucket_count(),
            seed,
            "corpus engine ready"
        );

        Ok(CorpusEngine {
            selector: BucketSelector::new(Arc::clone(&space), Arc::clone(&store), seed),
            calculator: ScenarioCalculator::new(Arc::clone(&space)),
            validator: SpectrumValidator::new(Arc::clone(&space), settings.validation.clone()),
            reporter: CoverageReporter::new(Arc::clone(&space), Arc::clone(&store)),
            adapter,
            store,
            // Prime offset keeps scenario draws independent of bucket draws
            rng: StdRng::seed_from_u64(seed.wrapping_add(7919)),
            stop: self.stop.unwrap_or_default(),
            cycle_count: 0,
            settings,
        })
    }
}
