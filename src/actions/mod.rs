//! Action schemas: what each intent needs before it can run.
//!
//! The built-in registry is embedded from `config/actions.json`. A custom
//! registry can be loaded from a file with the same shape.

mod schema;

use std::collections::HashMap;
use std::path::Path;

pub use schema::{ActionSchema, ActionSchemaDoc, FallbackStrategy};

const BUILTIN_ACTIONS: &str = include_str!("../../config/actions.json");

// Intent ids referenced from code. Everything else is data.
pub const TODO_ADD: &str = "TODO_ADD";
pub const TODO_COMPLETE: &str = "TODO_COMPLETE";
pub const TODO_DELETE: &str = "TODO_DELETE";
pub const TODO_LIST: &str = "TODO_LIST";
pub const EMAIL_SEND: &str = "EMAIL_SEND";
pub const EMAIL_REPLY: &str = "EMAIL_REPLY";
pub const EMAIL_SEARCH: &str = "EMAIL_SEARCH";
pub const DOC_SEARCH: &str = "DOC_SEARCH";
pub const SHEET_UPDATE: &str = "SHEET_UPDATE";
pub const MESSAGE_SEND: &str = "MESSAGE_SEND";
pub const DIGEST_SHOW: &str = "DIGEST_SHOW";
pub const WORKFLOW_ADVANCE: &str = "WORKFLOW_ADVANCE";
pub const HELP: &str = "HELP";

/// Action schemas keyed by intent id.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    schemas: HashMap<String, ActionSchema>,
}

impl ActionRegistry {
    /// The embedded schema set.
    pub fn builtin() -> Self {
        match Self::from_json(BUILTIN_ACTIONS) {
            Ok(registry) => registry,
            Err(e) => {
                log::warn!("Embedded action schemas failed to parse: {}", e);
                Self::default()
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let docs: Vec<ActionSchemaDoc> =
            serde_json::from_str(json).map_err(|e| format!("Failed to parse action schemas: {}", e))?;
        let mut schemas = HashMap::new();
        for doc in docs {
            validate_schema(&doc)?;
            let schema = ActionSchema::from_doc(doc);
            schemas.insert(schema.intent.clone(), schema);
        }
        Ok(Self { schemas })
    }

    /// Load a custom schema file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read action schemas: {}", e))?;
        Self::from_json(&content)
    }

    pub fn get(&self, intent: &str) -> Option<&ActionSchema> {
        self.schemas.get(intent)
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.schemas.contains_key(intent)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &ActionSchema> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Validate a schema document has required fields and consistent params.
pub fn validate_schema(doc: &ActionSchemaDoc) -> Result<(), String> {
    if doc.intent.trim().is_empty() {
        return Err("Action schema intent is required".into());
    }
    if doc.description.trim().is_empty() {
        return Err(format!("Action schema {} needs a description", doc.intent));
    }
    if let Some(key) = &doc.displays {
        if !doc.context_needed.contains(key) {
            return Err(format!(
                "Action schema {}: displayed list '{}' is not in contextNeeded",
                doc.intent, key
            ));
        }
    }
    for param in doc.entity_params.keys() {
        let known = doc.required_params.contains(param) || doc.optional_params.contains(param);
        if !known {
            return Err(format!(
                "Action schema {}: entity param '{}' is not a declared parameter",
                doc.intent, param
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;

    #[test]
    fn test_builtin_registry_loads() {
        let registry = ActionRegistry::builtin();
        assert!(registry.len() >= 12);
        let all = [
            TODO_ADD,
            TODO_COMPLETE,
            TODO_DELETE,
            TODO_LIST,
            EMAIL_SEND,
            EMAIL_REPLY,
            EMAIL_SEARCH,
            DOC_SEARCH,
            SHEET_UPDATE,
            MESSAGE_SEND,
            DIGEST_SHOW,
            WORKFLOW_ADVANCE,
            HELP,
        ];
        assert_eq!(registry.len(), all.len());
        for id in all {
            assert!(registry.contains(id), "missing builtin schema {}", id);
        }
    }

    #[test]
    fn test_builtin_patterns_all_compile() {
        let docs: Vec<ActionSchemaDoc> = serde_json::from_str(BUILTIN_ACTIONS).unwrap();
        let registry = ActionRegistry::builtin();
        for doc in docs {
            let schema = registry.get(&doc.intent).unwrap();
            assert_eq!(
                schema.patterns.len(),
                doc.patterns.len(),
                "pattern failed to compile for {}",
                doc.intent
            );
        }
    }

    #[test]
    fn test_risk_levels() {
        let registry = ActionRegistry::builtin();
        assert_eq!(registry.get(EMAIL_SEND).unwrap().risk, RiskLevel::High);
        assert_eq!(registry.get(TODO_ADD).unwrap().risk, RiskLevel::Low);
        assert_eq!(registry.get(SHEET_UPDATE).unwrap().risk, RiskLevel::Medium);
        assert_eq!(
            registry.get(EMAIL_SEND).unwrap().fallback,
            FallbackStrategy::LlmVerify
        );
    }

    #[test]
    fn test_entity_param_must_be_declared() {
        let json = r#"[{
            "intent": "X", "description": "x", "requiredParams": ["a"],
            "entityParams": {"b": "things"}, "risk": "LOW", "fallback": "ask_user",
            "confirmationTemplate": "x?"
        }]"#;
        let err = ActionRegistry::from_json(json).unwrap_err();
        assert!(err.contains("entity param 'b'"));
    }

    #[test]
    fn test_high_risk_always_verified() {
        let registry = ActionRegistry::builtin();
        for schema in registry.schemas().filter(|s| s.is_high_risk()) {
            assert_eq!(schema.fallback, FallbackStrategy::LlmVerify, "{}", schema.intent);
        }
        assert!(registry.get(TODO_DELETE).unwrap().is_high_risk());

        let json = r#"[{
            "intent": "X", "description": "x", "risk": "HIGH", "fallback": "llm_extract",
            "confirmationTemplate": "x?"
        }]"#;
        let registry = ActionRegistry::from_json(json).unwrap();
        assert_eq!(registry.get("X").unwrap().fallback, FallbackStrategy::LlmVerify);
    }

    #[test]
    fn test_displayed_list_must_be_loaded() {
        assert_eq!(
            ActionRegistry::builtin().get(TODO_LIST).unwrap().displays.as_deref(),
            Some("active_tasks")
        );
        let json = r#"[{
            "intent": "X", "description": "x", "risk": "LOW", "fallback": "ask_user",
            "displays": "things", "confirmationTemplate": "x?"
        }]"#;
        let err = ActionRegistry::from_json(json).unwrap_err();
        assert!(err.contains("displayed list 'things'"));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let json = r#"[{
            "intent": "X", "description": "x", "risk": "LOW", "fallback": "ask_user",
            "patterns": ["(unclosed", "^ok$"], "confirmationTemplate": "x?"
        }]"#;
        let registry = ActionRegistry::from_json(json).unwrap();
        assert_eq!(registry.get("X").unwrap().patterns.len(), 1);
    }
}
