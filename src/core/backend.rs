/// Text backends: the single seam between the engine and a language model.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::settings::BackendSettings;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend timed out")]
    Timeout,
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned empty output")]
    EmptyOutput,
    #[error("backend rejected the request with HTTP {0}")]
    Rejected(u16),
    #[error("backend response could not be read: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether a later attempt could succeed. Client errors other than
    /// rate limiting will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected(status) => *status == 429 || *status >= 500,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Produces raw text for a prompt.
pub trait TextBackend: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "text backend".to_string()
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
    num_predict: u32,
    top_p: f64,
    top_k: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

/// Ollama-compatible `/api/generate` client.
pub struct OllamaBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    top_p: f64,
    top_k: u32,
}

impl OllamaBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", settings.url.trim_end_matches('/')),
            model: settings.model.clone(),
            top_p: settings.top_p,
            top_k: settings.top_k,
        })
    }
}

impl TextBackend for OllamaBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                top_p: self.top_p,
                top_k: self.top_k,
            },
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Unreachable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Rejected(status.as_u16()));
        }

        let parsed: OllamaResponse = resp.json().map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::InvalidResponse(e.to_string())
            }
        })?;

        if parsed.response.trim().is_empty() {
            return Err(BackendError::EmptyOutput);
        }
        Ok(parsed.response)
    }

    fn describe(&self) -> String {
        format!("ollama {} at {}", self.model, self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(BackendError::Timeout.is_retryable());
        assert!(BackendError::EmptyOutput.is_retryable());
        assert!(BackendError::Rejected(503).is_retryable());
        assert!(BackendError::Rejected(429).is_retryable());
        assert!(!BackendError::Rejected(404).is_retryable());
        assert!(!BackendError::Rejected(400).is_retryable());
    }

    #[test]
    fn request_body_matches_generate_api() {
        let body = OllamaRequest {
            model: "qwen3:8b",
            prompt: "hi",
            stream: false,
            options: OllamaOptions {
                temperature: 0.92,
                num_predict: 4000,
                top_p: 0.9,
                top_k: 40,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 4000);
        assert_eq!(json["model"], "qwen3:8b");
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let settings = BackendSettings {
            url: "http://127.0.0.1:11434/".to_string(),
            ..BackendSettings::default()
        };
        let backend = OllamaBackend::new(&settings).unwrap();
        assert_eq!(backend.endpoint, "http://127.0.0.1:11434/api/generate");
    }

    #[test]
    fn unreachable_host_maps_to_backend_error() {
        let settings = BackendSettings {
            // Port 9 (discard) on loopback refuses connections
            url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..BackendSettings::default()
        };
        let backend = OllamaBackend::new(&settings).unwrap();
        let err = backend
            .generate(&GenerationRequest {
                prompt: "hi".to_string(),
                temperature: 0.5,
                max_tokens: 10,
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_) | BackendError::Timeout));
    }
}
