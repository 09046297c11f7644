/// Prompt templates: parsing, checking against a bucket space, rendering.
///
/// Placeholders name scenario values (`{effective_capacity}`), dimension
/// levels (`{capacity_level}`) or level fields (`{capacity_level.range}`).

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::core::derive::CAPACITY_HEADROOM;
use crate::core::space::BucketSpace;
use crate::schema::scenario::ScenarioParameters;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template parse error: {0}")]
    TemplateParse(String),
    #[error("unknown template parameter '{0}'")]
    UnknownParameter(String),
    #[error("unknown field '{field}' on parameter '{name}'")]
    UnknownField { name: String, field: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// Scenario values every template may use, besides dimension names.
pub const SCENARIO_PARAMETERS: &[&str] = &[
    "scenario_id",
    "effective_capacity",
    "support_needed",
    "support_gap",
    "capacity_ceiling",
];

const LEVEL_FIELDS: &[&str] = &["description", "range"];

pub const DEFAULT_TEMPLATE: &str = "\
Write one training example of a character answering a request for support.

Character effective capacity: {effective_capacity} out of 10 ({capacity_level}: {capacity_level.description}).
Support the other person needs: {support_needed} out of 10.
The most this character can realistically offer is {capacity_ceiling}.
Target authenticity: {authenticity_target} ({authenticity_target.description}), score range {authenticity_target.range}.
Behavioral pattern: {complexity_type} ({complexity_type.description}).

When the request exceeds what the character can give, the response must say so plainly.

Return only JSON in this shape:
{{
  \"scenario_id\": \"{scenario_id}\",
  \"character_state\": {{ \"effective_capacity\": {effective_capacity} }},
  \"situation\": {{ \"support_needed\": {support_needed}, \"request\": \"...\" }},
  \"character_response\": {{ \"dialogue\": \"...\", \"internal_reasoning\": \"...\" }},
  \"training_metadata\": {{ \"authenticity_score\": 0.0 }}
}}
";

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateSegment {
    Literal(String),
    /// `{name}` or `{name.field}`.
    Param { name: String, field: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub segments: Vec<TemplateSegment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Prompt")]
struct RonPrompt {
    text: String,
}

impl PromptTemplate {
    /// Parse a template string.
    ///
    /// - `{name}` / `{name.field}` → `Param`
    /// - `{{` and `}}` → literal braces
    pub fn parse(input: &str) -> Result<PromptTemplate, PromptError> {
        let mut segments = Vec::new();
        let mut literal_buf = String::new();
        let chars: Vec<char> = input.chars().collect();
        let len = chars.len();
        let mut i = 0;

        while i < len {
            match chars[i] {
                '{' if i + 1 < len && chars[i + 1] == '{' => {
                    literal_buf.push('{');
                    i += 2;
                }
                '{' => {
                    if !literal_buf.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut literal_buf)));
                    }
                    let start = i + 1;
                    let mut end = start;
                    while end < len && chars[end] != '}' {
                        if chars[end] == '{' {
                            return Err(PromptError::TemplateParse(
                                "nested braces are not allowed".to_string(),
                            ));
                        }
                        end += 1;
                    }
                    if end >= len {
                        return Err(PromptError::TemplateParse("unclosed brace".to_string()));
                    }
                    let content: String = chars[start..end].iter().collect();
                    segments.push(Self::parse_param(content.trim())?);
                    i = end + 1;
                }
                '}' if i + 1 < len && chars[i + 1] == '}' => {
                    literal_buf.push('}');
                    i += 2;
                }
                '}' => {
                    return Err(PromptError::TemplateParse(
                        "unmatched closing brace".to_string(),
                    ));
                }
                c => {
                    literal_buf.push(c);
                    i += 1;
                }
            }
        }

        if !literal_buf.is_empty() {
            segments.push(TemplateSegment::Literal(literal_buf));
        }
        Ok(PromptTemplate { segments })
    }

    fn parse_param(content: &str) -> Result<TemplateSegment, PromptError> {
        if content.is_empty() {
            return Err(PromptError::TemplateParse("empty braces".to_string()));
        }
        match content.split_once('.') {
            Some((name, field)) => {
                if name.is_empty() || field.is_empty() || field.contains('.') {
                    return Err(PromptError::TemplateParse(format!(
                        "malformed parameter '{}'",
                        content
                    )));
                }
                Ok(TemplateSegment::Param {
                    name: name.to_string(),
                    field: Some(field.to_string()),
                })
            }
            None => Ok(TemplateSegment::Param {
                name: content.to_string(),
                field: None,
            }),
        }
    }

    /// Load a template from a RON file of the form `Prompt(text: "...")`.
    pub fn load_from_ron(path: &Path) -> Result<PromptTemplate, PromptError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn parse_ron(input: &str) -> Result<PromptTemplate, PromptError> {
        let raw: RonPrompt = ron::from_str(input)?;
        Self::parse(&raw.text)
    }

    /// Built-in template used when no prompt file is configured.
    pub fn builtin() -> Result<PromptTemplate, PromptError> {
        Self::parse(DEFAULT_TEMPLATE)
    }

    /// Names of the parameters the template uses, in order of appearance.
    pub fn parameters(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                TemplateSegment::Param { name, field: None } => Some(name.clone()),
                TemplateSegment::Param {
                    name,
                    field: Some(field),
                } => Some(format!("{}.{}", name, field)),
                TemplateSegment::Literal(_) => None,
            })
            .collect()
    }

    /// Verify that every placeholder resolves against the space.
    pub fn check(&self, space: &BucketSpace) -> Result<(), PromptError> {
        for segment in &self.segments {
            if let TemplateSegment::Param { name, field } = segment {
                check_param(space, name, field.as_deref())?;
            }
        }
        Ok(())
    }

    /// Render against one scenario.
    pub fn render(
        &self,
        params: &ScenarioParameters,
        space: &BucketSpace,
    ) -> Result<String, PromptError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => out.push_str(text),
                TemplateSegment::Param { name, field } => {
                    out.push_str(&resolve(params, space, name, field.as_deref())?);
                }
            }
        }
        Ok(out)
    }
}

fn check_param(space: &BucketSpace, name: &str, field: Option<&str>) -> Result<(), PromptError> {
    let is_dimension = space.dimensions().iter().any(|d| d.name == name);
    match field {
        None if is_dimension || SCENARIO_PARAMETERS.contains(&name) => Ok(()),
        None => Err(PromptError::UnknownParameter(name.to_string())),
        Some(f) if is_dimension && LEVEL_FIELDS.contains(&f) => Ok(()),
        Some(f) if is_dimension => Err(PromptError::UnknownField {
            name: name.to_string(),
            field: f.to_string(),
        }),
        Some(_) => Err(PromptError::UnknownParameter(name.to_string())),
    }
}

fn resolve(
    params: &ScenarioParameters,
    space: &BucketSpace,
    name: &str,
    field: Option<&str>,
) -> Result<String, PromptError> {
    if field.is_none() {
        match name {
            "scenario_id" => return Ok(params.scenario_id()),
            "effective_capacity" => return Ok(format!("{:.1}", params.effective_capacity)),
            "support_needed" => return Ok(format!("{:.1}", params.support_needed)),
            "support_gap" => return Ok(format!("{:.1}", params.support_gap)),
            "capacity_ceiling" => {
                return Ok(format!("{:.1}", params.support_ceiling(CAPACITY_HEADROOM)))
            }
            _ => {}
        }
    }

    let Some(idx) = space.dimensions().iter().position(|d| d.name == name) else {
        return Err(PromptError::UnknownParameter(name.to_string()));
    };
    let Some(level) = space.level_of(&params.bucket, idx) else {
        return Err(PromptError::UnknownParameter(name.to_string()));
    };

    match field {
        None => Ok(level.name.clone()),
        Some("description") => Ok(level.description.clone().unwrap_or_default()),
        Some("range") => Ok(level
            .range
            .map(|r| format!("{:.1}-{:.1}", r.min, r.max))
            .unwrap_or_default()),
        Some(other) => Err(PromptError::UnknownField {
            name: name.to_string(),
            field: other.to_string(),
        }),
    }
}
