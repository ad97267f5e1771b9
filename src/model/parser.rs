//! ActionBatchParser (§4.10): turns a raw LLM completion into an
//! `ActionBatch`, tolerating code fences, preamble text, and the legacy
//! bare-Action wire shape, then validates and normalizes the result.
//!
//! The JSON-recovery ladder here generalizes the teacher's `extract_json`
//! helper: try the text as-is, then a fenced ` ```json ` block, then a
//! generic fenced block, then the first `{` found anywhere.

use crate::types::{Action, ActionBatch, ActionKind, BoundingBox, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON object found in model response")]
    NoJsonFound,
    #[error("response JSON did not match either accepted action shape")]
    UnrecognizedShape,
    #[error("batch size {0} outside the allowed range {MIN_BATCH_SIZE}-{MAX_BATCH_SIZE}")]
    BatchSizeOutOfRange(usize),
    #[error("action {index}: {reason}")]
    InvalidAction { index: usize, reason: String },
}

/// A single OCR hit, as produced by whatever OCR pass ran over the screen
/// (§4.6's optional OCR block). `ocr_<i>` references in `target_identifier`
/// resolve against this slice by position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub bounding_box: BoundingBox,
}

pub struct ActionBatchParser;

impl ActionBatchParser {
    /// Parses a raw model completion into a validated, normalized batch.
    /// `ocr_results` resolves `ocr_<i>` target identifiers to bounding boxes;
    /// pass an empty slice when OCR did not run for this screen.
    pub fn parse(raw: &str, ocr_results: &[OcrResult]) -> Result<ActionBatch, ParseError> {
        let json_str = extract_json(raw).ok_or(ParseError::NoJsonFound)?;
        let mut batch = Self::decode_shape(&json_str)?;
        Self::resolve_ocr_references(&mut batch, ocr_results);
        Self::validate(&batch)?;
        Ok(batch)
    }

    /// Accepts either the full batch shape (`{actions, exploration_journal,
    /// signup_completed?}`) or a legacy bare single `Action`, which is lifted
    /// into a one-element batch with an empty journal entry.
    fn decode_shape(json_str: &str) -> Result<ActionBatch, ParseError> {
        if let Ok(batch) = serde_json::from_str::<ActionBatch>(json_str) {
            return Ok(batch);
        }
        if let Ok(action) = serde_json::from_str::<Action>(json_str) {
            debug!("model returned a legacy bare action, lifting into a single-action batch");
            return Ok(ActionBatch {
                actions: vec![action],
                exploration_journal: String::new(),
                signup_completed: None,
            });
        }
        // Loose fallback: pull out whatever fields are actually present,
        // tolerating partial/malformed batches rather than rejecting them
        // outright.
        let value: Value = serde_json::from_str(json_str).map_err(|_| ParseError::UnrecognizedShape)?;
        if let Some(actions_val) = value.get("actions") {
            let actions: Vec<Action> =
                serde_json::from_value(actions_val.clone()).map_err(|_| ParseError::UnrecognizedShape)?;
            let exploration_journal = value
                .get("exploration_journal")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let signup_completed = value.get("signup_completed").and_then(Value::as_bool);
            return Ok(ActionBatch { actions, exploration_journal, signup_completed });
        }
        Err(ParseError::UnrecognizedShape)
    }

    fn resolve_ocr_references(batch: &mut ActionBatch, ocr_results: &[OcrResult]) {
        for action in &mut batch.actions {
            let Some(identifier) = &action.target_identifier else { continue };
            let Some(idx) = identifier.strip_prefix("ocr_").and_then(|n| n.parse::<usize>().ok()) else {
                continue;
            };
            match ocr_results.get(idx) {
                Some(hit) => {
                    action.target_bounding_box = Some(hit.bounding_box);
                }
                None => {
                    warn!("ocr reference {identifier} out of range ({} results available)", ocr_results.len());
                    action.target_bounding_box = None;
                }
            }
        }
    }

    fn validate(batch: &ActionBatch) -> Result<(), ParseError> {
        if batch.actions.len() < MIN_BATCH_SIZE || batch.actions.len() > MAX_BATCH_SIZE {
            return Err(ParseError::BatchSizeOutOfRange(batch.actions.len()));
        }
        for (index, action) in batch.actions.iter().enumerate() {
            Self::validate_action(index, action)?;
        }
        Ok(())
    }

    fn validate_action(index: usize, action: &Action) -> Result<(), ParseError> {
        if action.reasoning.trim().is_empty() {
            return Err(ParseError::InvalidAction { index, reason: "reasoning must not be empty".into() });
        }
        if !action.action.is_global() && action.target_identifier.is_none() && action.target_bounding_box.is_none()
        {
            return Err(ParseError::InvalidAction {
                index,
                reason: format!("{} requires a target_identifier or target_bounding_box", action.action.as_str()),
            });
        }
        if action.action.requires_input_text() && action.input_text.as_deref().unwrap_or("").is_empty() {
            return Err(ParseError::InvalidAction {
                index,
                reason: format!("{} requires non-empty input_text", action.action.as_str()),
            });
        }
        if let Some(bbox) = &action.target_bounding_box {
            if !bbox.top_left.iter().chain(&bbox.bottom_right).all(|v| v.is_finite()) {
                return Err(ParseError::InvalidAction { index, reason: "target_bounding_box has non-finite coordinates".into() });
            }
        }
        Ok(())
    }
}

/// JSON-recovery ladder: (1) if the text starts with `{`, brace-depth-count
/// to the matching close; (2) else look for a fenced ` ```json ` block; (3)
/// else a generic fenced block whose trimmed body starts with `{`; (4) else
/// the first `{` found anywhere, brace-depth-counted from there.
fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = matching_brace_end(trimmed, 0) {
            return Some(trimmed[..=end].to_string());
        }
    }

    if let Some(body) = fenced_block(trimmed, "```json") {
        if body.trim_start().starts_with('{') {
            return Some(body.trim().to_string());
        }
    }

    if let Some(body) = fenced_block(trimmed, "```") {
        let body_trimmed = body.trim();
        if body_trimmed.starts_with('{') {
            return Some(body_trimmed.to_string());
        }
    }

    let start = trimmed.find('{')?;
    let end = matching_brace_end(trimmed, start)?;
    Some(trimmed[start..=end].to_string())
}

fn fenced_block<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

fn matching_brace_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_json() {
        let raw = r#"{"actions": [], "exploration_journal": "x"}"#;
        assert_eq!(extract_json(raw).unwrap(), raw);
    }

    #[test]
    fn extracts_from_json_fence() {
        let raw = "here's my plan\n```json\n{\"actions\": [], \"exploration_journal\": \"y\"}\n```\ndone";
        let extracted = extract_json(raw).unwrap();
        assert!(extracted.starts_with('{'));
        assert!(extracted.contains("exploration_journal"));
    }

    #[test]
    fn extracts_from_generic_fence() {
        let raw = "```\n{\"actions\": [], \"exploration_journal\": \"z\"}\n```";
        let extracted = extract_json(raw).unwrap();
        assert!(extracted.starts_with('{'));
    }

    #[test]
    fn extracts_first_brace_with_preamble() {
        let raw = "I'll tap the login button. {\"actions\": [], \"exploration_journal\": \"w\"} trailing text";
        let extracted = extract_json(raw).unwrap();
        assert!(extracted.starts_with('{'));
        assert!(extracted.ends_with('}'));
    }

    #[test]
    fn parses_full_batch() {
        let raw = r#"{
            "actions": [{"action": "click", "target_identifier": "login_btn", "reasoning": "start login"}],
            "exploration_journal": "tapped login"
        }"#;
        let batch = ActionBatchParser::parse(raw, &[]).unwrap();
        assert_eq!(batch.actions.len(), 1);
        assert_eq!(batch.exploration_journal, "tapped login");
    }

    #[test]
    fn lifts_legacy_bare_action() {
        let raw = r#"{"action": "back", "reasoning": "dismiss dialog"}"#;
        let batch = ActionBatchParser::parse(raw, &[]).unwrap();
        assert_eq!(batch.actions.len(), 1);
        assert_eq!(batch.actions[0].action, ActionKind::Back);
    }

    #[test]
    fn rejects_empty_batch() {
        let raw = r#"{"actions": [], "exploration_journal": "nothing"}"#;
        assert!(matches!(ActionBatchParser::parse(raw, &[]), Err(ParseError::BatchSizeOutOfRange(0))));
    }

    #[test]
    fn rejects_missing_target_on_non_global_action() {
        let raw = r#"{"actions": [{"action": "click", "reasoning": "tap something"}], "exploration_journal": "j"}"#;
        assert!(ActionBatchParser::parse(raw, &[]).is_err());
    }

    #[test]
    fn global_actions_need_no_target() {
        let raw = r#"{"actions": [{"action": "back", "reasoning": "go back"}], "exploration_journal": "j"}"#;
        assert!(ActionBatchParser::parse(raw, &[]).is_ok());
    }

    #[test]
    fn resolves_ocr_reference_in_range() {
        let raw = r#"{"actions": [{"action": "click", "target_identifier": "ocr_0", "reasoning": "tap detected text"}], "exploration_journal": "j"}"#;
        let ocr = vec![OcrResult {
            text: "Sign in".into(),
            bounding_box: BoundingBox { top_left: [10.0, 20.0], bottom_right: [100.0, 50.0] },
        }];
        let batch = ActionBatchParser::parse(raw, &ocr).unwrap();
        assert!(batch.actions[0].target_bounding_box.is_some());
    }

    #[test]
    fn ocr_reference_out_of_range_leaves_bbox_null() {
        let raw = r#"{"actions": [{"action": "click", "target_identifier": "ocr_5", "reasoning": "tap detected text"}], "exploration_journal": "j"}"#;
        let err = ActionBatchParser::parse(raw, &[]);
        // Still has target_identifier so validation passes; bbox stays None.
        assert!(err.is_ok());
    }

    #[test]
    fn rejects_batch_over_max_size() {
        let actions: Vec<String> = (0..13)
            .map(|i| format!(r#"{{"action": "back", "reasoning": "step {i}"}}"#))
            .collect();
        let raw = format!(r#"{{"actions": [{}], "exploration_journal": "j"}}"#, actions.join(","));
        assert!(matches!(ActionBatchParser::parse(&raw, &[]), Err(ParseError::BatchSizeOutOfRange(13))));
    }
}
