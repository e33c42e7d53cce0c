//! Pre-execution gate.
//!
//! Checks run in a fixed order and the first failing one decides the
//! outcome: missing params, low confidence, high risk, ambiguity.

use std::sync::Arc;

use serde::Serialize;

use crate::actions::{ActionRegistry, ActionSchema};
use crate::types::{AwaitingKind, EntityRecord, ParamValue, Params, TurnContext};
use crate::util::{humanize, render_template};

const UNDONE_PHRASE: &str = "This cannot be undone.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub can_execute: bool,
    pub kind: Option<AwaitingKind>,
    pub message: Option<String>,
    /// Candidates shown for an ambiguous parameter, in display order.
    pub options: Vec<EntityRecord>,
    /// The parameter an ambiguity is about.
    pub ambiguous_param: Option<String>,
}

impl ValidationOutcome {
    fn execute() -> Self {
        Self {
            can_execute: true,
            kind: None,
            message: None,
            options: Vec::new(),
            ambiguous_param: None,
        }
    }

    fn ask(kind: AwaitingKind, message: String) -> Self {
        Self {
            can_execute: false,
            kind: Some(kind),
            message: Some(message),
            options: Vec::new(),
            ambiguous_param: None,
        }
    }
}

pub struct ActionValidator {
    registry: Arc<ActionRegistry>,
    confidence_threshold: f64,
}

impl ActionValidator {
    pub fn new(registry: Arc<ActionRegistry>, confidence_threshold: f64) -> Self {
        Self {
            registry,
            confidence_threshold,
        }
    }

    pub fn validate(
        &self,
        intent: &str,
        params: &Params,
        missing: &[String],
        confidence: f64,
        ctx: &TurnContext,
    ) -> ValidationOutcome {
        let Some(schema) = self.registry.get(intent) else {
            return ValidationOutcome {
                can_execute: false,
                kind: None,
                message: Some("That isn't something I can handle here.".to_string()),
                options: Vec::new(),
                ambiguous_param: None,
            };
        };

        if let Some(first) = missing.first() {
            return ValidationOutcome::ask(AwaitingKind::MissingParams, missing_question(first, &missing[1..]));
        }

        if !ctx.user_confirmed {
            if confidence < self.confidence_threshold {
                // One "yes" answers both checks
                let message = if schema.is_high_risk() {
                    high_risk_message(schema, params)
                } else {
                    format!("Just to confirm, you want me to {}?", summarize(schema, params))
                };
                return ValidationOutcome::ask(AwaitingKind::LowConfidence, message);
            }
            if schema.is_high_risk() {
                return ValidationOutcome::ask(AwaitingKind::HighRisk, high_risk_message(schema, params));
            }
        }

        if let Some((param, candidates)) = params.iter().find_map(|(name, value)| match value {
            ParamValue::Candidates(c) if c.len() > 1 => Some((name, c)),
            _ => None,
        }) {
            return ValidationOutcome {
                can_execute: false,
                kind: Some(AwaitingKind::Ambiguous),
                message: Some(numbered_question(param, candidates)),
                options: candidates.clone(),
                ambiguous_param: Some(param.clone()),
            };
        }

        ValidationOutcome::execute()
    }
}

/// Question for a missing parameter, by the kind of thing it names.
pub fn missing_question(param: &str, others: &[String]) -> String {
    let question = match param {
        "title" => "What should the task say?".to_string(),
        "due_date" => "When is it due?".to_string(),
        "priority" => "How important is it?".to_string(),
        "task_ref" => "Which task do you mean?".to_string(),
        "recipient" => "Who should I send it to?".to_string(),
        "subject" => "What's the subject?".to_string(),
        "body" => "What should it say?".to_string(),
        "email_ref" => "Which email do you mean?".to_string(),
        "query" => "What should I search for?".to_string(),
        "sheet_ref" => "Which spreadsheet?".to_string(),
        "cell" => "Which cell?".to_string(),
        "value" => "What value should I set?".to_string(),
        "channel" => "Which channel should I post to?".to_string(),
        "message" => "What should the message say?".to_string(),
        "workflow_action" => "What should I do with your current workflow?".to_string(),
        other => format!("What {} should I use?", humanize(other)),
    };
    if others.is_empty() {
        question
    } else {
        let rest: Vec<String> = others.iter().map(|o| humanize(o)).collect();
        format!("{} (I'll also need the {}.)", question, rest.join(", "))
    }
}

/// Short description of what the action will do with these params.
pub fn summarize(schema: &ActionSchema, params: &Params) -> String {
    schema
        .summary_template
        .as_deref()
        .and_then(|t| render_template(t, |name| params.get(name).map(ParamValue::display)))
        .unwrap_or_else(|| schema.description.clone())
}

fn high_risk_message(schema: &ActionSchema, params: &Params) -> String {
    let rendered = render_template(&schema.confirmation_template, |name| {
        params.get(name).map(ParamValue::display)
    })
    .unwrap_or_else(|| format!("I'm about to {}. Continue?", schema.description));
    if rendered.contains("cannot be undone") {
        rendered
    } else {
        format!("{} {}", rendered, UNDONE_PHRASE)
    }
}

/// "Which task did you mean?" with a 1-based list.
pub fn numbered_question(param: &str, candidates: &[EntityRecord]) -> String {
    let mut out = format!("Which {} did you mean?", noun_for(param));
    for (i, c) in candidates.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, c.display));
    }
    out
}

fn noun_for(param: &str) -> String {
    let stripped = param.strip_suffix("_ref").unwrap_or(param);
    humanize(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;
    use crate::actions::{EMAIL_SEND, SHEET_UPDATE, TODO_ADD, TODO_COMPLETE};

    fn validator() -> ActionValidator {
        ActionValidator::new(Arc::new(ActionRegistry::builtin()), 0.70)
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::text(*v)))
            .collect()
    }

    #[test]
    fn test_todo_add_confident_executes() {
        let outcome = validator().validate(
            TODO_ADD,
            &params(&[("title", "buy milk")]),
            &[],
            0.95,
            &TurnContext::default(),
        );
        assert!(outcome.can_execute);
        assert!(outcome.kind.is_none());
    }

    #[test]
    fn test_email_send_requires_confirmation() {
        let outcome = validator().validate(
            EMAIL_SEND,
            &params(&[("recipient", "sam"), ("subject", "budget")]),
            &[],
            0.95,
            &TurnContext::default(),
        );
        assert!(!outcome.can_execute);
        assert_eq!(outcome.kind, Some(AwaitingKind::HighRisk));
        let msg = outcome.message.unwrap();
        assert!(msg.contains("sam"));
        assert!(msg.contains("cannot be undone"));
    }

    #[test]
    fn test_confirmed_high_risk_executes() {
        let ctx = TurnContext {
            user_confirmed: true,
            ..Default::default()
        };
        let outcome = validator().validate(
            EMAIL_SEND,
            &params(&[("recipient", "sam"), ("subject", "budget")]),
            &[],
            0.4,
            &ctx,
        );
        assert!(outcome.can_execute);
    }

    #[test]
    fn test_missing_beats_everything() {
        let ctx = TurnContext {
            user_confirmed: true,
            ..Default::default()
        };
        let outcome = validator().validate(
            EMAIL_SEND,
            &params(&[("subject", "budget")]),
            &["recipient".to_string()],
            0.1,
            &ctx,
        );
        assert_eq!(outcome.kind, Some(AwaitingKind::MissingParams));
        assert_eq!(outcome.message.as_deref(), Some("Who should I send it to?"));
    }

    #[test]
    fn test_generic_missing_question_lists_others() {
        let q = missing_question("start_time", &["end_time".to_string()]);
        assert_eq!(q, "What start time should I use? (I'll also need the end time.)");
    }

    #[test]
    fn test_low_confidence_uses_summary() {
        let outcome = validator().validate(
            TODO_ADD,
            &params(&[("title", "buy milk")]),
            &[],
            0.5,
            &TurnContext::default(),
        );
        assert_eq!(outcome.kind, Some(AwaitingKind::LowConfidence));
        assert_eq!(
            outcome.message.as_deref(),
            Some("Just to confirm, you want me to add a task \"buy milk\"?")
        );
    }

    #[test]
    fn test_low_confidence_checked_before_risk() {
        let outcome = validator().validate(
            EMAIL_SEND,
            &params(&[("recipient", "sam"), ("subject", "budget")]),
            &[],
            0.5,
            &TurnContext::default(),
        );
        assert_eq!(outcome.kind, Some(AwaitingKind::LowConfidence));
        let msg = outcome.message.unwrap();
        assert!(msg.contains("sam"));
        assert!(msg.contains("cannot be undone"));
    }

    #[test]
    fn test_ambiguous_candidates_numbered() {
        let mut p = Params::new();
        p.insert(
            "task_ref".into(),
            ParamValue::Candidates(vec![
                EntityRecord::new("5", "Write report"),
                EntityRecord::new("7", "Review report"),
            ]),
        );
        let outcome = validator().validate(TODO_COMPLETE, &p, &[], 0.9, &TurnContext::default());
        assert_eq!(outcome.kind, Some(AwaitingKind::Ambiguous));
        assert_eq!(outcome.options.len(), 2);
        assert_eq!(outcome.ambiguous_param.as_deref(), Some("task_ref"));
        assert_eq!(
            outcome.message.as_deref(),
            Some("Which task did you mean?\n1. Write report\n2. Review report")
        );
    }

    #[test]
    fn test_confirmation_does_not_skip_ambiguity() {
        let mut p = Params::new();
        p.insert(
            "task_ref".into(),
            ParamValue::Candidates(vec![EntityRecord::new("5", "A"), EntityRecord::new("7", "B")]),
        );
        let ctx = TurnContext {
            user_confirmed: true,
            ..Default::default()
        };
        let outcome = validator().validate(TODO_COMPLETE, &p, &[], 0.9, &ctx);
        assert_eq!(outcome.kind, Some(AwaitingKind::Ambiguous));
    }

    #[test]
    fn test_unknown_intent_not_handled() {
        let outcome = validator().validate("NOPE", &Params::new(), &[], 1.0, &TurnContext::default());
        assert!(!outcome.can_execute);
        assert!(outcome.kind.is_none());
        assert!(outcome.message.is_some());
    }

    #[test]
    fn test_every_schema_executes_when_clean() {
        let registry = ActionRegistry::builtin();
        let v = validator();
        for schema in registry.schemas() {
            if schema.risk == RiskLevel::High {
                continue;
            }
            let p: Params = schema
                .required_params
                .iter()
                .map(|name| (name.clone(), ParamValue::text("x")))
                .collect();
            let outcome = v.validate(&schema.intent, &p, &[], 0.9, &TurnContext::default());
            assert!(outcome.can_execute, "{} should execute", schema.intent);
        }
        // MEDIUM risk needs no confirmation
        assert_eq!(registry.get(SHEET_UPDATE).unwrap().risk, RiskLevel::Medium);
    }
}
