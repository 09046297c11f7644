/// Pulls a generated sample out of raw model output.
///
/// Models wrap JSON in reasoning blocks, code fences and prose, and now and
/// then emit trailing commas or typographic quotes. Extraction strips the
/// wrapping, parses, and only rewrites the text when the first parse fails.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no JSON value found in model output")]
    NoJson,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("model returned an empty JSON array")]
    EmptyArray,
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("generated sample is missing '{0}'")]
    MissingField(&'static str),
    #[error("authenticity score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),
}

/// Typed view of one parsed sample. `payload` keeps the full object.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSample {
    pub payload: Value,
    pub authenticity_score: f64,
    pub response_text: String,
    pub effective_capacity: Option<f64>,
    pub support_needed: Option<f64>,
}

const SCORE_PATHS: &[&str] = &["/training_metadata/authenticity_score", "/authenticity_score"];
const TEXT_PATHS: &[&str] = &[
    "/character_response/dialogue",
    "/character_response/response",
    "/character_response",
    "/response_text",
    "/dialogue",
    "/response",
];
const CAPACITY_PATHS: &[&str] = &["/character_state/effective_capacity", "/effective_capacity"];
const SUPPORT_PATHS: &[&str] = &[
    "/situation/support_needed",
    "/support_level_needed",
    "/support_needed",
];

/// Drop `<think>…</think>` blocks. An unterminated block drops everything
/// after its opening tag.
pub fn strip_reasoning(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Remove Markdown code-fence lines.
pub fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The span from the first opening bracket to the last matching closing
/// bracket of the same kind.
pub fn locate_json(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c == '{' || c == '[')?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Replace typographic quotes and drop commas that directly precede a
/// closing bracket. Commas inside strings are left alone.
pub fn repair_json(raw: &str) -> String {
    let normalized: String = raw
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();

    let chars: Vec<char> = normalized.chars().collect();
    let mut out = String::with_capacity(normalized.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Extract the first JSON object from model output. An array yields its
/// first element.
pub fn extract_object(output: &str) -> Result<Value, ExtractError> {
    let cleaned = strip_code_fences(&strip_reasoning(output));
    let span = locate_json(&cleaned).ok_or(ExtractError::NoJson)?;

    let value = match serde_json::from_str::<Value>(span) {
        Ok(v) => v,
        Err(_) => serde_json::from_str::<Value>(&repair_json(span))
            .map_err(|e| ExtractError::Malformed(e.to_string()))?,
    };

    match value {
        Value::Object(_) => Ok(value),
        Value::Array(mut items) => {
            if items.is_empty() {
                return Err(ExtractError::EmptyArray);
            }
            match items.swap_remove(0) {
                obj @ Value::Object(_) => Ok(obj),
                other => Err(ExtractError::NotAnObject(kind_name(&other))),
            }
        }
        other => Err(ExtractError::NotAnObject(kind_name(&other))),
    }
}

/// Extract and type one generated sample.
pub fn parse_sample(output: &str) -> Result<GeneratedSample, ExtractError> {
    let payload = extract_object(output)?;

    let authenticity_score = first_number(&payload, SCORE_PATHS)
        .ok_or(ExtractError::MissingField("authenticity_score"))?;
    if !(0.0..=1.0).contains(&authenticity_score) {
        return Err(ExtractError::ScoreOutOfRange(authenticity_score));
    }

    let response_text = TEXT_PATHS
        .iter()
        .filter_map(|p| payload.pointer(p).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(ExtractError::MissingField("response text"))?;

    Ok(GeneratedSample {
        effective_capacity: first_number(&payload, CAPACITY_PATHS),
        support_needed: first_number(&payload, SUPPORT_PATHS),
        authenticity_score,
        response_text,
        payload,
    })
}

fn first_number(value: &Value, paths: &[&str]) -> Option<f64> {
    paths
        .iter()
        .filter_map(|p| value.pointer(p).and_then(Value::as_f64))
        .find(|n| n.is_finite())
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = r#"{
        "scenario_id": "low_failed",
        "character_state": {"effective_capacity": 3.1},
        "situation": {"support_needed": 7.9},
        "character_response": {"dialogue": "Sure, I'll handle all of it."},
        "training_metadata": {"authenticity_score": 0.3}
    }"#;

    #[test]
    fn strips_reasoning_blocks() {
        let text = "<think>maybe a list?</think>{\"a\": 1}<think>unfinished";
        assert_eq!(strip_reasoning(text), "{\"a\": 1}");
    }

    #[test]
    fn locates_json_inside_prose() {
        let text = "Here you go:\n```json\n{\"a\": [1, 2]}\n```\nHope that helps.";
        let cleaned = strip_code_fences(text);
        assert_eq!(locate_json(&cleaned), Some("{\"a\": [1, 2]}"));
        assert_eq!(locate_json("no json here"), None);
    }

    #[test]
    fn repairs_trailing_commas_outside_strings() {
        let repaired = repair_json(r#"{"a": [1, 2,], "b": "x,}",}"#);
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["b"], "x,}");
        assert_eq!(value["a"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn repairs_smart_quotes() {
        let value = extract_object("{\u{201C}a\u{201D}: 1,}").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn parses_nested_sample() {
        let output = format!("<think>planning</think>\n```json\n{}\n```", NESTED);
        let sample = parse_sample(&output).unwrap();
        assert_eq!(sample.authenticity_score, 0.3);
        assert_eq!(sample.response_text, "Sure, I'll handle all of it.");
        assert_eq!(sample.effective_capacity, Some(3.1));
        assert_eq!(sample.support_needed, Some(7.9));
        assert_eq!(sample.payload["scenario_id"], "low_failed");
    }

    #[test]
    fn parses_flat_sample_from_array() {
        let output = r#"[{"authenticity_score": 0.7, "response": "I can't tonight, but tomorrow works."}, {}]"#;
        let sample = parse_sample(output).unwrap();
        assert_eq!(sample.authenticity_score, 0.7);
        assert!(sample.effective_capacity.is_none());
    }

    #[test]
    fn parses_flat_string_response() {
        let output = r#"{"effective_capacity": 3.0, "support_level_needed": 9.0,
            "character_response": "I'm sorry, I can't tonight, I'm wiped.",
            "authenticity_score": 0.7}"#;
        let sample = parse_sample(output).unwrap();
        assert_eq!(sample.response_text, "I'm sorry, I can't tonight, I'm wiped.");
        assert_eq!(sample.effective_capacity, Some(3.0));
        assert_eq!(sample.support_needed, Some(9.0));
    }

    #[test]
    fn nested_dialogue_wins_over_object_lookup() {
        let output = r#"{"character_response": {"dialogue": "Not tonight."},
            "training_metadata": {"authenticity_score": 0.5}}"#;
        assert_eq!(parse_sample(output).unwrap().response_text, "Not tonight.");
    }

    #[test]
    fn missing_fields_fail() {
        let err = parse_sample(r#"{"response": "hello"}"#).unwrap_err();
        assert!(matches!(err, ExtractError::MissingField("authenticity_score")));

        let err = parse_sample(r#"{"authenticity_score": 0.5, "response": "   "}"#).unwrap_err();
        assert!(matches!(err, ExtractError::MissingField("response text")));
    }

    #[test]
    fn rejects_out_of_range_score_and_non_objects() {
        let err = parse_sample(r#"{"authenticity_score": 1.4, "response": "x"}"#).unwrap_err();
        assert!(matches!(err, ExtractError::ScoreOutOfRange(_)));
        assert!(matches!(extract_object("[]"), Err(ExtractError::EmptyArray)));
        assert!(matches!(extract_object("[1, 2]"), Err(ExtractError::NotAnObject(_))));
        assert!(matches!(extract_object("nothing"), Err(ExtractError::NoJson)));
    }
}
