/// Generation adapter: scenario parameters in, one validated example out.
///
/// Each attempt moves through an explicit state machine:
///
/// ```text
/// Pending ── backend ok ──▶ Parsing ── sample ok ──▶ Accepted
///    │                         │
///    └── backend error ──┐     └── extract error ──▶ FailedRetryable
///                        ▼
///        FailedRetryable | FailedPermanent
/// ```
///
/// Retryable failures are retried with exponential backoff up to the
/// attempt limit. Every attempt is appended to the adapter's attempt log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::backend::{GenerationRequest, TextBackend};
use crate::core::extract::parse_sample;
use crate::core::prompt::{PromptError, PromptTemplate};
use crate::core::settings::{BackendSettings, GenerationSettings};
use crate::core::space::BucketSpace;
use crate::schema::bucket::BucketKey;
use crate::schema::example::Example;
use crate::schema::scenario::ScenarioParameters;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation failed for {bucket} after {attempts} attempts: {reason}")]
    GenerationFailed {
        bucket: BucketKey,
        attempts: u32,
        reason: String,
    },
    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptState {
    Pending,
    Parsing,
    Accepted,
    FailedRetryable,
    FailedPermanent,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::FailedRetryable | Self::FailedPermanent
        )
    }
}

/// One attempt as it went through the state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub scenario_id: String,
    pub attempt: u32,
    pub transitions: Vec<AttemptState>,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl AttemptRecord {
    fn new(scenario_id: &str, attempt: u32) -> Self {
        Self {
            scenario_id: scenario_id.to_string(),
            attempt,
            transitions: vec![AttemptState::Pending],
            detail: None,
            started_at: Utc::now(),
        }
    }

    fn advance(&mut self, state: AttemptState) {
        self.transitions.push(state);
    }

    pub fn final_state(&self) -> AttemptState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(AttemptState::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.retry_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

pub struct GenerationAdapter {
    backend: Arc<dyn TextBackend>,
    template: PromptTemplate,
    space: Arc<BucketSpace>,
    policy: RetryPolicy,
    temperature: f64,
    max_tokens: u32,
    attempt_log: Vec<AttemptRecord>,
}

impl GenerationAdapter {
    pub fn new(
        backend: Arc<dyn TextBackend>,
        template: PromptTemplate,
        space: Arc<BucketSpace>,
        backend_settings: &BackendSettings,
        policy: RetryPolicy,
    ) -> Result<Self, PromptError> {
        template.check(&space)?;
        Ok(Self {
            backend,
            template,
            space,
            policy,
            temperature: backend_settings.temperature,
            max_tokens: backend_settings.max_tokens,
            attempt_log: Vec::new(),
        })
    }

    pub fn attempt_log(&self) -> &[AttemptRecord] {
        &self.attempt_log
    }

    pub fn take_attempt_log(&mut self) -> Vec<AttemptRecord> {
        std::mem::take(&mut self.attempt_log)
    }

    pub fn generate(&mut self, params: &ScenarioParameters) -> Result<Example, GenerationError> {
        let prompt = self.template.render(params, &self.space)?;
        let request = GenerationRequest {
            prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let scenario_id = params.scenario_id();

        let mut backoff = self.policy.initial_backoff;
        let mut last_reason = String::from("no attempts made");
        let mut attempts = 0;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 && !backoff.is_zero() {
                tracing::debug!(
                    scenario = %scenario_id,
                    attempt,
                    max = self.policy.max_attempts,
                    ?backoff,
                    "retrying generation"
                );
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(self.policy.max_backoff);
            }
            attempts = attempt;

            let mut record = AttemptRecord::new(&scenario_id, attempt);
            let raw = match self.backend.generate(&request) {
                Ok(raw) => raw,
                Err(e) => {
                    let state = if e.is_retryable() {
                        AttemptState::FailedRetryable
                    } else {
                        AttemptState::FailedPermanent
                    };
                    record.advance(state);
                    record.detail = Some(e.to_string());
                    last_reason = e.to_string();
                    tracing::debug!(scenario = %scenario_id, attempt, error = %e, "backend call failed");
                    self.attempt_log.push(record);
                    if state == AttemptState::FailedPermanent {
                        break;
                    }
                    continue;
                }
            };

            record.advance(AttemptState::Parsing);
            match parse_sample(&raw) {
                Ok(sample) => {
                    record.advance(AttemptState::Accepted);
                    self.attempt_log.push(record);
                    tracing::debug!(scenario = %scenario_id, attempt, "sample accepted");
                    return Ok(Example {
                        scenario_id,
                        bucket: params.bucket.clone(),
                        is_gap_fill: params.is_gap_fill,
                        authenticity_score: sample.authenticity_score,
                        effective_capacity: sample
                            .effective_capacity
                            .unwrap_or(params.effective_capacity),
                        support_level_needed: sample
                            .support_needed
                            .unwrap_or(params.support_needed),
                        response_text: sample.response_text,
                        generated_at: Utc::now(),
                        attempts: attempt,
                        payload: sample.payload,
                    });
                }
                Err(e) => {
                    record.advance(AttemptState::FailedRetryable);
                    record.detail = Some(e.to_string());
                    last_reason = e.to_string();
                    tracing::debug!(scenario = %scenario_id, attempt, error = %e, "model output rejected");
                    self.attempt_log.push(record);
                }
            }
        }

        Err(GenerationError::GenerationFailed {
            bucket: params.bucket.clone(),
            attempts,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::BackendError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, BackendError>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    impl TextBackend for Scripted {
        fn generate(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(BackendError::EmptyOutput))
        }
    }

    const GOOD: &str = r#"{"training_metadata": {"authenticity_score": 0.35},
        "character_response": {"dialogue": "Sorry, I can't take that on tonight."}}"#;

    fn adapter(backend: Arc<Scripted>, attempts: u32) -> GenerationAdapter {
        let space = Arc::new(
            BucketSpace::load_from_ron(std::path::Path::new("tests/fixtures/test_space.ron"))
                .unwrap(),
        );
        let template = PromptTemplate::parse("{capacity_level} {authenticity_target}").unwrap();
        GenerationAdapter::new(
            backend,
            template,
            space,
            &BackendSettings::default(),
            RetryPolicy::immediate(attempts),
        )
        .unwrap()
    }

    fn params() -> ScenarioParameters {
        ScenarioParameters {
            bucket: BucketKey::new(["low", "failed"]),
            is_gap_fill: true,
            capacity_level: Some("low".to_string()),
            effective_capacity: 3.0,
            support_needed: 7.5,
            support_gap: 4.5,
            authenticity_target: Some("failed".to_string()),
            authenticity_range: None,
            complexity_type: None,
            clamped: false,
        }
    }

    #[test]
    fn accepted_on_first_attempt() {
        let mut a = adapter(Scripted::new(vec![Ok(GOOD.to_string())]), 3);
        let ex = a.generate(&params()).unwrap();
        assert_eq!(ex.attempts, 1);
        assert_eq!(ex.scenario_id, "low_failed_gap");
        assert_eq!(ex.effective_capacity, 3.0);
        assert_eq!(ex.support_level_needed, 7.5);
        assert_eq!(
            a.attempt_log()[0].transitions,
            vec![
                AttemptState::Pending,
                AttemptState::Parsing,
                AttemptState::Accepted
            ]
        );
    }

    #[test]
    fn malformed_output_is_retried() {
        let backend = Scripted::new(vec![
            Ok("I'd rather not answer in JSON.".to_string()),
            Err(BackendError::Timeout),
            Ok(GOOD.to_string()),
        ]);
        let mut a = adapter(backend, 3);
        let ex = a.generate(&params()).unwrap();
        assert_eq!(ex.attempts, 3);
        let log = a.take_attempt_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].final_state(), AttemptState::FailedRetryable);
        assert_eq!(log[1].transitions, vec![AttemptState::Pending, AttemptState::FailedRetryable]);
        assert!(a.attempt_log().is_empty());
    }

    #[test]
    fn exhausted_attempts_fail() {
        let backend = Scripted::new(vec![
            Ok("{}".to_string()),
            Ok("{}".to_string()),
        ]);
        let mut a = adapter(backend, 2);
        match a.generate(&params()) {
            Err(GenerationError::GenerationFailed { attempts, bucket, reason }) => {
                assert_eq!(attempts, 2);
                assert_eq!(bucket, BucketKey::new(["low", "failed"]));
                assert!(reason.contains("authenticity_score"));
            }
            other => panic!("expected GenerationFailed, got {:?}", other.map(|e| e.scenario_id)),
        }
    }

    #[test]
    fn permanent_rejection_stops_early() {
        let backend = Scripted::new(vec![
            Err(BackendError::Rejected(404)),
            Ok(GOOD.to_string()),
        ]);
        let mut a = adapter(backend, 5);
        let err = a.generate(&params()).unwrap_err();
        assert!(matches!(err, GenerationError::GenerationFailed { attempts: 1, .. }));
        assert_eq!(a.attempt_log()[0].final_state(), AttemptState::FailedPermanent);
    }

    #[test]
    fn template_must_fit_space() {
        let space = Arc::new(
            BucketSpace::load_from_ron(std::path::Path::new("tests/fixtures/test_space.ron"))
                .unwrap(),
        );
        let template = PromptTemplate::parse("{complexity_type}").unwrap();
        let result = GenerationAdapter::new(
            Scripted::new(vec![]),
            template,
            space,
            &BackendSettings::default(),
            RetryPolicy::immediate(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn backoff_policy_from_settings() {
        let policy = RetryPolicy::from_settings(&GenerationSettings::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert!(AttemptState::Accepted.is_terminal());
        assert!(!AttemptState::Parsing.is_terminal());
    }
}
