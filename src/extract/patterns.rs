//! Deterministic pattern extraction with per-intent refinement.

use std::sync::OnceLock;

use regex::Regex;

use crate::actions::ActionSchema;
use crate::types::{ParamValue, Params, TurnContext};
use crate::util::{contains_phrase, normalize_text};

/// Confidence of a clean pattern match.
pub const PATTERN_CONFIDENCE: f64 = 0.9;
/// Deducted when a captured id is not in the entity context list.
const ID_MISMATCH_PENALTY: f64 = 0.2;

const HIGH_PRIORITY_WORDS: &[&str] = &["urgent", "asap", "important", "high priority", "critical"];
const LOW_PRIORITY_WORDS: &[&str] = &["someday", "whenever", "no rush", "low priority", "eventually"];

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub params: Params,
    pub confidence: f64,
    pub notes: Vec<String>,
}

fn numeric_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#?\d{1,12}$").expect("valid id regex"))
}

/// Run the schema's patterns in order; the first match wins.
pub fn match_patterns(schema: &ActionSchema, text: &str, ctx: &TurnContext) -> Option<PatternMatch> {
    let text = text.trim();
    let (re, caps) = schema
        .patterns
        .iter()
        .find_map(|re| re.captures(text).map(|caps| (re, caps)))?;

    let mut params = Params::new();
    for name in re.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            let value = m.as_str().trim();
            if !value.is_empty() {
                params.insert(name.to_string(), ParamValue::text(value));
            }
        }
    }

    let mut result = PatternMatch {
        params,
        confidence: PATTERN_CONFIDENCE,
        notes: vec![format!("matched pattern for {}", schema.intent)],
    };
    refine(schema, text, ctx, &mut result);
    Some(result)
}

/// Intent-specific cleanup of raw captures.
fn refine(schema: &ActionSchema, text: &str, ctx: &TurnContext, result: &mut PatternMatch) {
    parse_numeric_ids(schema, &mut result.params);

    if schema.all_params().any(|p| p == "priority") {
        if let Some(priority) = infer_priority(text) {
            result
                .params
                .entry("priority".to_string())
                .or_insert_with(|| ParamValue::text(priority));
        }
    }

    for (param, key) in &schema.entity_params {
        let Some(ParamValue::Integer(id)) = result.params.get(param) else {
            continue;
        };
        let known = ctx.entities(key);
        if known.is_empty() {
            continue;
        }
        let id_matches = known.iter().any(|e| e.key == id.to_string());
        // A small number may be a position in the entity context list
        let is_position = *id >= 1 && (*id as usize) <= known.len();
        if !id_matches && !is_position {
            result.confidence = (result.confidence - ID_MISMATCH_PENALTY).max(0.0);
            result
                .notes
                .push(format!("{} {} not found in {}", param, id, key));
        }
    }
}

/// Entity references and `*_id` params that look like `#12` or `12`
/// become integers.
pub(super) fn parse_numeric_ids(schema: &ActionSchema, params: &mut Params) {
    for (name, value) in params.iter_mut() {
        let is_id_param = schema.entity_params.contains_key(name) || name.ends_with("_id");
        if !is_id_param {
            continue;
        }
        let parsed = value
            .as_text()
            .map(str::trim)
            .filter(|s| numeric_id_regex().is_match(s))
            .and_then(|s| s.trim_start_matches('#').parse::<i64>().ok());
        if let Some(n) = parsed {
            *value = ParamValue::Integer(n);
        }
    }
}

/// "urgent" → high, "no rush" → low.
pub fn infer_priority(text: &str) -> Option<&'static str> {
    let normalized = normalize_text(text);
    if HIGH_PRIORITY_WORDS.iter().any(|w| contains_phrase(&normalized, w)) {
        Some("high")
    } else if LOW_PRIORITY_WORDS.iter().any(|w| contains_phrase(&normalized, w)) {
        Some("low")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionRegistry, EMAIL_SEND, SHEET_UPDATE, TODO_ADD, TODO_COMPLETE};
    use crate::types::EntityRecord;

    fn registry() -> ActionRegistry {
        ActionRegistry::builtin()
    }

    #[test]
    fn test_todo_add_captures_title_and_due_date() {
        let reg = registry();
        let m = match_patterns(
            reg.get(TODO_ADD).unwrap(),
            "add a task to call the dentist by friday",
            &TurnContext::default(),
        )
        .unwrap();
        assert_eq!(m.params.get("title"), Some(&ParamValue::text("call the dentist")));
        assert_eq!(m.params.get("due_date"), Some(&ParamValue::text("friday")));
        assert!((m.confidence - PATTERN_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn test_priority_inferred() {
        let reg = registry();
        let m = match_patterns(
            reg.get(TODO_ADD).unwrap(),
            "remind me to file taxes asap",
            &TurnContext::default(),
        )
        .unwrap();
        assert_eq!(m.params.get("priority"), Some(&ParamValue::text("high")));
        assert_eq!(infer_priority("no rush on this"), Some("low"));
        assert_eq!(infer_priority("buy milk"), None);
    }

    #[test]
    fn test_numeric_reference_parsed() {
        let reg = registry();
        let m = match_patterns(
            reg.get(TODO_COMPLETE).unwrap(),
            "mark #2 done",
            &TurnContext::default(),
        )
        .unwrap();
        assert_eq!(m.params.get("task_ref"), Some(&ParamValue::Integer(2)));
    }

    #[test]
    fn test_unknown_id_lowers_confidence() {
        let reg = registry();
        let ctx = TurnContext::default().with_entities(
            "active_tasks",
            vec![EntityRecord::new("41", "a"), EntityRecord::new("42", "b")],
        );
        let hit = match_patterns(reg.get(TODO_COMPLETE).unwrap(), "mark 42 done", &ctx).unwrap();
        assert!((hit.confidence - 0.9).abs() < 1e-9);

        let miss = match_patterns(reg.get(TODO_COMPLETE).unwrap(), "mark 99 done", &ctx).unwrap();
        assert!((miss.confidence - 0.7).abs() < 1e-9);
        assert_eq!(miss.params.get("task_ref"), Some(&ParamValue::Integer(99)));
    }

    #[test]
    fn test_list_position_is_not_an_id_mismatch() {
        let reg = registry();
        let ctx = TurnContext::default().with_entities(
            "active_tasks",
            vec![EntityRecord::new("41", "a"), EntityRecord::new("42", "b")],
        );
        let second = match_patterns(reg.get(TODO_COMPLETE).unwrap(), "mark #2 done", &ctx).unwrap();
        assert!((second.confidence - 0.9).abs() < 1e-9);

        let past_end = match_patterns(reg.get(TODO_COMPLETE).unwrap(), "mark #3 done", &ctx).unwrap();
        assert!((past_end.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_text_reference_stays_text() {
        let reg = registry();
        let m = match_patterns(
            reg.get(TODO_COMPLETE).unwrap(),
            "mark the report task done",
            &TurnContext::default(),
        )
        .unwrap();
        assert_eq!(m.params.get("task_ref"), Some(&ParamValue::text("the report task")));
    }

    #[test]
    fn test_email_and_sheet_patterns() {
        let reg = registry();
        let ctx = TurnContext::default();
        let m = match_patterns(
            reg.get(EMAIL_SEND).unwrap(),
            "send an email to sam@example.com about the Q3 plan",
            &ctx,
        )
        .unwrap();
        assert_eq!(m.params.get("recipient"), Some(&ParamValue::text("sam@example.com")));
        assert_eq!(m.params.get("subject"), Some(&ParamValue::text("the Q3 plan")));

        let m = match_patterns(
            reg.get(SHEET_UPDATE).unwrap(),
            "set B4 in budget sheet to 1200",
            &ctx,
        )
        .unwrap();
        assert_eq!(m.params.get("cell"), Some(&ParamValue::text("B4")));
        assert_eq!(m.params.get("value"), Some(&ParamValue::text("1200")));
    }

    #[test]
    fn test_no_match() {
        let reg = registry();
        assert!(match_patterns(
            reg.get(EMAIL_SEND).unwrap(),
            "hello there",
            &TurnContext::default()
        )
        .is_none());
    }
}
