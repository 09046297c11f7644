/// Writes finished batches as JSON files named
/// `<prefix>_batch<NNNN>_<timestamp>.json`.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::validator::ValidationReport;
use crate::schema::example::Example;

pub const FORMAT_VERSION: &str = "1.0";
pub const GENERATION_METHOD: &str = "coverage_guided";

#[derive(Debug, Error)]
pub enum BatchWriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct BatchFile<'a> {
    format_version: &'static str,
    generation_method: &'static str,
    data_type: &'a str,
    batch_number: u32,
    timestamp: String,
    sample_count: usize,
    gap_fill_count: usize,
    validation: Option<&'a ValidationReport>,
    samples: &'a [Example],
}

pub struct BatchWriter {
    output_dir: PathBuf,
    prefix: String,
    next_batch: u32,
}

impl BatchWriter {
    /// Create the output directory if needed. Numbering continues after the
    /// highest batch already present for this prefix.
    pub fn new(output_dir: &Path, prefix: &str) -> Result<Self, BatchWriteError> {
        std::fs::create_dir_all(output_dir)?;
        let marker = format!("{}_batch", prefix);
        let mut highest = 0;
        for entry in std::fs::read_dir(output_dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&marker) else { continue };
            if let Ok(n) = rest.chars().take(4).collect::<String>().parse::<u32>() {
                highest = highest.max(n);
            }
        }
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            prefix: prefix.to_string(),
            next_batch: highest + 1,
        })
    }

    pub fn next_batch_number(&self) -> u32 {
        self.next_batch
    }

    pub fn write(
        &mut self,
        batch: &[Example],
        validation: Option<&ValidationReport>,
    ) -> Result<PathBuf, BatchWriteError> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let batch_number = self.next_batch;
        let path = self.output_dir.join(format!(
            "{}_batch{:04}_{}.json",
            self.prefix, batch_number, timestamp
        ));

        let file = BatchFile {
            format_version: FORMAT_VERSION,
            generation_method: GENERATION_METHOD,
            data_type: &self.prefix,
            batch_number,
            timestamp,
            sample_count: batch.len(),
            gap_fill_count: batch.iter().filter(|e| e.is_gap_fill).count(),
            validation,
            samples: batch,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;
        self.next_batch += 1;

        tracing::info!(file = %path.display(), samples = batch.len(), "batch written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bucket::BucketKey;

    fn example(gap: bool) -> Example {
        Example {
            scenario_id: "low_failed".to_string(),
            bucket: BucketKey::new(["low", "failed"]),
            is_gap_fill: gap,
            authenticity_score: 0.3,
            effective_capacity: 3.0,
            support_level_needed: 7.5,
            response_text: "I can't tonight.".to_string(),
            generated_at: Utc::now(),
            attempts: 1,
            payload: serde_json::json!({"character_response": {"dialogue": "I can't tonight."}}),
        }
    }

    #[test]
    fn writes_numbered_json_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BatchWriter::new(dir.path(), "emotional_authenticity").unwrap();

        let path = writer.write(&[example(true), example(false)], None).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("emotional_authenticity_batch0001_"));
        assert!(name.ends_with(".json"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["sample_count"], 2);
        assert_eq!(value["gap_fill_count"], 1);
        assert_eq!(value["samples"][0]["bucket"][0], "low");
        assert!(value["validation"].is_null());
        assert_eq!(writer.next_batch_number(), 2);
    }

    #[test]
    fn numbering_resumes_from_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ea_batch0007_20240101_000000.json"), "{}").unwrap();
        std::fs::write(dir.path().join("other_batch0042_20240101_000000.json"), "{}").unwrap();
        let writer = BatchWriter::new(dir.path(), "ea").unwrap();
        assert_eq!(writer.next_batch_number(), 8);
    }
}
