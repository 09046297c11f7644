/// Run configuration loaded from RON. Every field has a default, so a
/// settings file only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::core::validator::ValidationThresholds;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// Text backend connection and sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub top_k: u32,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "qwen3:8b".to_string(),
            timeout_secs: 300,
            temperature: 0.92,
            max_tokens: 4000,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

/// Production loop sizing, retry policy and file locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Buckets selected per round.
    pub batch_size: usize,
    /// Examples a cycle aims to produce before validating.
    pub target_examples: usize,
    /// Rounds allowed before a cycle stops short of its target.
    pub max_rounds: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Extra rounds spent on validator shortfalls before a batch is final.
    pub max_gap_rounds: usize,
    pub seed: u64,
    pub space_path: String,
    pub prompt_path: Option<String>,
    pub coverage_db: String,
    pub output_dir: String,
    pub output_prefix: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            batch_size: 12,
            target_examples: 48,
            max_rounds: 20,
            max_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8000,
            max_gap_rounds: 3,
            seed: 42,
            space_path: "space_data/default_space.ron".to_string(),
            prompt_path: Some("space_data/prompts.ron".to_string()),
            coverage_db: "coverage.db".to_string(),
            output_dir: "output".to_string(),
            output_prefix: "emotional_authenticity".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename = "Settings", default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub generation: GenerationSettings,
    pub validation: ValidationThresholds,
}

impl Settings {
    pub fn load_from_ron(path: &Path) -> Result<Settings, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn parse_ron(input: &str) -> Result<Settings, SettingsError> {
        let settings: Settings = ron::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let g = &self.generation;
        if g.batch_size == 0 {
            return Err(SettingsError::Invalid("batch_size must be at least 1".into()));
        }
        if g.max_attempts == 0 {
            return Err(SettingsError::Invalid("max_attempts must be at least 1".into()));
        }
        if g.max_backoff_ms < g.retry_backoff_ms {
            return Err(SettingsError::Invalid(
                "max_backoff_ms must not be below retry_backoff_ms".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return Err(SettingsError::Invalid(format!(
                "temperature {} outside [0, 2]",
                self.backend.temperature
            )));
        }
        self.validation.validate().map_err(SettingsError::Invalid)
    }
}
