//! Conversation pipeline.
//!
//! One user turn flows classify → extract → resolve → validate → execute or
//! ask. When the user owes us an answer, the reply is interpreted against
//! the saved awaiting state before anything else.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::actions::{ActionRegistry, ActionSchema, HELP, WORKFLOW_ADVANCE};
use crate::error::EngineError;
use crate::extract::{ExtractionSource, LlmCapability, ParameterExtractor};
use crate::intent::{IntentClassifier, UNKNOWN};
use crate::providers::{ActionExecutor, EntityProvider, LogNotifier, NoEntities, Notifier};
use crate::resolve::{AmbiguityResolver, Resolution};
use crate::session::{AwaitingState, SessionStore};
use crate::types::{missing_params, AwaitingKind, EngineConfig, EntityRecord, ParamValue, Params, TurnContext};
use crate::util::{humanize, is_affirmative, is_negative, is_refusal};
use crate::validate::{numbered_question, summarize, ActionValidator};
use crate::workflow::WorkflowEngine;

/// Context flag read by the tree's workflow branch.
pub const WORKFLOW_ACTIVE_FLAG: &str = "workflow_active";

/// A reply classified this confidently as another intent abandons the
/// pending question.
const ABANDON_CONFIDENCE: f64 = 0.85;

/// Free-text replies up to this many words fill the first missing param.
const SHORT_REPLY_WORDS: usize = 12;

const NOT_UNDERSTOOD: &str = "Sorry, I didn't understand that. Say \"help\" to see what I can do.";
const NO_WORKFLOW: &str = "You don't have a workflow in progress.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Executed {
        intent: String,
        params: Params,
        reply: String,
    },
    Asked {
        intent: String,
        kind: AwaitingKind,
        question: String,
    },
    NotHandled {
        reply: String,
    },
    /// The user declined a pending question.
    Dismissed {
        intent: String,
    },
}

impl TurnOutcome {
    /// Text sent to the user for this turn, if any.
    pub fn reply(&self) -> Option<&str> {
        match self {
            TurnOutcome::Executed { reply, .. } | TurnOutcome::NotHandled { reply } => Some(reply),
            TurnOutcome::Asked { question, .. } => Some(question),
            TurnOutcome::Dismissed { .. } => None,
        }
    }
}

pub struct ConversationEngine {
    config: EngineConfig,
    registry: Arc<ActionRegistry>,
    classifier: Arc<IntentClassifier>,
    extractor: ParameterExtractor,
    validator: ActionValidator,
    resolver: AmbiguityResolver,
    sessions: Arc<SessionStore>,
    workflows: Arc<WorkflowEngine>,
    entities: Arc<dyn EntityProvider>,
    executor: Arc<dyn ActionExecutor>,
    notifier: Arc<dyn Notifier>,
    user_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

fn build_extractor(
    registry: &Arc<ActionRegistry>,
    config: &EngineConfig,
    llm: Option<Arc<dyn LlmCapability>>,
) -> ParameterExtractor {
    let extractor = ParameterExtractor::new(Arc::clone(registry))
        .with_timeout(std::time::Duration::from_secs(config.llm_timeout_secs))
        .with_context_budget(config.context_char_budget);
    match llm {
        Some(llm) => extractor.with_llm(llm),
        None => extractor,
    }
}

impl ConversationEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<ActionRegistry>,
        classifier: Arc<IntentClassifier>,
        sessions: Arc<SessionStore>,
        workflows: Arc<WorkflowEngine>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            extractor: build_extractor(&registry, &config, None),
            validator: ActionValidator::new(Arc::clone(&registry), config.confidence_threshold),
            resolver: AmbiguityResolver::new(Arc::clone(&sessions), &config),
            config,
            registry,
            classifier,
            sessions,
            workflows,
            entities: Arc::new(NoEntities),
            executor,
            notifier: Arc::new(LogNotifier),
            user_locks: DashMap::new(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmCapability>) -> Self {
        self.extractor = build_extractor(&self.registry, &self.config, Some(llm));
        self
    }

    pub fn with_entities(mut self, entities: Arc<dyn EntityProvider>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn classifier(&self) -> &Arc<IntentClassifier> {
        &self.classifier
    }

    /// Process one inbound message. Turns from the same user run one at a
    /// time; different users proceed concurrently.
    pub async fn handle_message(
        &self,
        user_id: &str,
        text: &str,
        ctx: TurnContext,
    ) -> Result<TurnOutcome, EngineError> {
        let lock = self.user_lock(user_id);
        let guard = lock.lock().await;
        let outcome = self.handle_locked(user_id, text, ctx).await;
        drop(guard);
        drop(lock);
        // Idle users don't keep a lock around; a waiter still holds a clone
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn handle_locked(
        &self,
        user_id: &str,
        text: &str,
        mut ctx: TurnContext,
    ) -> Result<TurnOutcome, EngineError> {
        ctx.user_id = user_id.to_string();
        if !ctx.flags.contains_key(WORKFLOW_ACTIVE_FLAG) {
            let active = self.workflows.get_active(user_id)?.is_some();
            ctx.flags.insert(WORKFLOW_ACTIVE_FLAG.to_string(), active);
        }

        if let Some(awaiting) = self.sessions.get_awaiting(user_id)? {
            if let Some(outcome) = self.handle_reply(awaiting, text, &ctx).await? {
                return Ok(outcome);
            }
        }
        self.handle_fresh(text, ctx).await
    }

    fn user_lock(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        self.user_locks.entry(user_id.to_string()).or_default().clone()
    }

    // -- fresh turns ------------------------------------------------------

    async fn handle_fresh(&self, text: &str, mut ctx: TurnContext) -> Result<TurnOutcome, EngineError> {
        let classification = self.classifier.classify(text, &ctx);
        let intent = classification.effective_action().to_string();
        let Some(schema) = self.registry.get(&intent) else {
            log::debug!("No action for '{}' ({})", crate::util::truncate_chars(text, 60), intent);
            return Ok(self.not_handled(&ctx.user_id, NOT_UNDERSTOOD.to_string()).await);
        };

        self.load_context(schema, &mut ctx).await;
        let extraction = self.extractor.extract(&intent, text, &ctx).await;
        let confidence = match extraction.source {
            ExtractionSource::None => classification.confidence,
            _ => extraction.confidence,
        };

        let mut params = classification.params;
        params.retain(|name, _| schema.all_params().any(|p| p == name));
        params.extend(extraction.params);

        self.process(&intent, params, confidence, ctx).await
    }

    /// Fetch every context list the schema reads that the caller didn't
    /// supply.
    async fn load_context(&self, schema: &ActionSchema, ctx: &mut TurnContext) {
        let keys = schema
            .context_needed
            .iter()
            .chain(schema.entity_params.values());
        for key in keys {
            if ctx.entities.contains_key(key) {
                continue;
            }
            let records = self.entities.fetch(&ctx.user_id, key).await;
            log::debug!("Loaded {} {} for {}", records.len(), key, ctx.user_id);
            ctx.entities.insert(key.clone(), records);
        }
    }

    /// Resolve entity params, validate, then execute or ask.
    async fn process(
        &self,
        intent: &str,
        mut params: Params,
        mut confidence: f64,
        ctx: TurnContext,
    ) -> Result<TurnOutcome, EngineError> {
        let Some(schema) = self.registry.get(intent) else {
            return Ok(self.not_handled(&ctx.user_id, NOT_UNDERSTOOD.to_string()).await);
        };

        let mut notes = Vec::new();
        for (param, key) in &schema.entity_params {
            let Some(value) = params.get(param).cloned() else {
                continue;
            };
            match value {
                ParamValue::Entity(_) => continue,
                ref v if v.is_ambiguous() => continue,
                ParamValue::Candidates(mut c) => {
                    if let Some(only) = c.pop() {
                        params.insert(param.clone(), ParamValue::Entity(only));
                    }
                    continue;
                }
                _ => {}
            }

            let query = value.display();
            let candidates = ctx.entities(key);
            match self.resolver.resolve(&query, candidates, key, &ctx.user_id)? {
                Resolution::Resolved(entity) => {
                    params.insert(param.clone(), ParamValue::Entity(entity));
                }
                Resolution::Shortlist(shown) | Resolution::Clarify(shown) if shown.len() == 1 => {
                    let only = &shown[0];
                    confidence = confidence.min(only.score / 100.0);
                    params.insert(param.clone(), ParamValue::Entity(only.entity.clone()));
                }
                Resolution::Shortlist(shown) | Resolution::Clarify(shown) => {
                    let options: Vec<EntityRecord> = shown.into_iter().map(|s| s.entity).collect();
                    params.insert(param.clone(), ParamValue::Candidates(options));
                }
                Resolution::NotFound => {
                    let has_list = !candidates.is_empty()
                        || self.sessions.get_displayed_list(&ctx.user_id, key)?.is_some();
                    if has_list {
                        log::debug!("No {} matches '{}' for {}", key, query, ctx.user_id);
                        notes.push(format!("I couldn't find \"{}\".", query));
                        params.remove(param);
                    }
                }
            }
        }

        let missing = missing_params(&schema.required_params, &params);
        let outcome = self
            .validator
            .validate(intent, &params, &missing, confidence, &ctx);
        if outcome.can_execute {
            return self.execute(schema, params, ctx).await;
        }

        let Some(kind) = outcome.kind else {
            let reply = outcome.message.unwrap_or_else(|| NOT_UNDERSTOOD.to_string());
            return Ok(self.not_handled(&ctx.user_id, reply).await);
        };
        let question = outcome.message.unwrap_or_default();

        if kind == AwaitingKind::Ambiguous {
            if let Some(key) = outcome
                .ambiguous_param
                .as_deref()
                .and_then(|p| schema.entity_context_key(p))
            {
                self.sessions
                    .store_displayed_list(&ctx.user_id, key, &outcome.options)?;
            }
        }

        let user_id = ctx.user_id.clone();
        let mut state = AwaitingState::new(&user_id, kind, intent);
        state.params = params;
        state.missing = missing;
        state.options = outcome.options;
        state.param = outcome.ambiguous_param;
        state.question = question.clone();
        state.confidence = confidence;
        state.context = ctx;
        self.sessions.set_awaiting(state)?;

        let asked = if notes.is_empty() {
            question
        } else {
            format!("{} {}", notes.join(" "), question)
        };
        self.notifier.notify(&user_id, &asked).await;
        Ok(TurnOutcome::Asked {
            intent: intent.to_string(),
            kind,
            question: asked,
        })
    }

    // -- replies to an outstanding question -------------------------------

    /// `Ok(None)` means the user moved on and the message should be handled
    /// as a fresh turn.
    async fn handle_reply(
        &self,
        mut state: AwaitingState,
        text: &str,
        ctx: &TurnContext,
    ) -> Result<Option<TurnOutcome>, EngineError> {
        let user_id = ctx.user_id.clone();
        state.context.user_id = user_id.clone();

        if state.kind.is_confirmation() {
            if is_affirmative(text) {
                self.sessions.clear_awaiting(&user_id)?;
                let mut confirmed = state.context;
                confirmed.user_confirmed = true;
                log::debug!("{} confirmed {}", user_id, state.intent);
                return self
                    .process(&state.intent, state.params, 1.0, confirmed)
                    .await
                    .map(Some);
            }
            if is_negative(text) {
                return self.dismiss(&state).await.map(Some);
            }
        }

        let classification = self.classifier.classify(text, ctx);
        if classification.confidence >= ABANDON_CONFIDENCE
            && !classification.needs_clarification()
            && classification.category != UNKNOWN
            && classification.category != state.intent
        {
            log::info!(
                "{} moved on from {} to {}; dropping {} question",
                user_id,
                state.intent,
                classification.category,
                state.kind
            );
            self.sessions.clear_awaiting(&user_id)?;
            return Ok(None);
        }

        let outcome = match state.kind {
            AwaitingKind::LowConfidence | AwaitingKind::HighRisk => {
                let question = format!("Please answer yes or no. {}", state.question);
                self.ask_again(state, question).await?
            }
            AwaitingKind::Ambiguous => {
                if is_refusal(text) {
                    return self.dismiss(&state).await.map(Some);
                }
                self.answer_ambiguity(state, text).await?
            }
            AwaitingKind::MissingParams => {
                if is_refusal(text) {
                    return self.dismiss(&state).await.map(Some);
                }
                self.answer_missing(state, text).await?
            }
        };
        Ok(Some(outcome))
    }

    async fn answer_ambiguity(&self, mut state: AwaitingState, text: &str) -> Result<TurnOutcome, EngineError> {
        let user_id = state.user_id.clone();
        let param = state.param.clone().unwrap_or_default();
        let key = self
            .registry
            .get(&state.intent)
            .and_then(|s| s.entity_context_key(&param))
            .unwrap_or(&param)
            .to_string();

        let picked = match self.resolver.resolve(text, &state.options, &key, &user_id)? {
            Resolution::Resolved(entity) => entity,
            Resolution::Shortlist(shown) | Resolution::Clarify(shown) if shown.len() == 1 => {
                let entity = shown[0].entity.clone();
                self.sessions.store_reference(&user_id, &key, &entity)?;
                entity
            }
            Resolution::Shortlist(shown) | Resolution::Clarify(shown) => {
                state.options = shown.into_iter().map(|s| s.entity).collect();
                state.question = numbered_question(&param, &state.options);
                let question = state.question.clone();
                return self.ask_again(state, question).await;
            }
            Resolution::NotFound => {
                let question = format!("I didn't catch which one. {}", state.question);
                return self.ask_again(state, question).await;
            }
        };

        log::debug!("{} picked {} for {}", user_id, picked.key, param);
        self.sessions.clear_awaiting(&user_id)?;
        state.params.insert(param, ParamValue::Entity(picked));
        self.process(&state.intent, state.params, state.confidence, state.context)
            .await
    }

    async fn answer_missing(&self, state: AwaitingState, text: &str) -> Result<TurnOutcome, EngineError> {
        let extraction = self
            .extractor
            .extract(&state.intent, text, &state.context)
            .await;
        let mut params = extraction.params;
        params.extend(state.params);

        if let Some(first) = state.missing.first() {
            let still_missing = params.get(first).map_or(true, ParamValue::is_empty);
            let answer = text.trim().trim_end_matches(|c: char| c == '.' || c == '!');
            if still_missing && !answer.is_empty() && answer.split_whitespace().count() <= SHORT_REPLY_WORDS {
                params.insert(first.clone(), ParamValue::text(answer));
            }
        }

        self.sessions.clear_awaiting(&state.user_id)?;
        let confidence = state.confidence.max(self.config.confidence_threshold);
        self.process(&state.intent, params, confidence, state.context)
            .await
    }

    /// Repeat a question, refreshing the awaiting state's expiry.
    async fn ask_again(&self, state: AwaitingState, question: String) -> Result<TurnOutcome, EngineError> {
        let user_id = state.user_id.clone();
        let intent = state.intent.clone();
        let kind = state.kind;
        self.sessions.set_awaiting(state)?;
        self.notifier.notify(&user_id, &question).await;
        Ok(TurnOutcome::Asked {
            intent,
            kind,
            question,
        })
    }

    async fn dismiss(&self, state: &AwaitingState) -> Result<TurnOutcome, EngineError> {
        self.sessions.clear_awaiting(&state.user_id)?;
        let reply = match self.registry.get(&state.intent) {
            Some(schema) => format!("Okay, I won't {}.", summarize(schema, &state.params)),
            None => "Okay, never mind.".to_string(),
        };
        log::debug!("{} declined {}", state.user_id, state.intent);
        self.notifier.notify(&state.user_id, &reply).await;
        Ok(TurnOutcome::Dismissed {
            intent: state.intent.clone(),
        })
    }

    // -- execution --------------------------------------------------------

    async fn execute(
        &self,
        schema: &ActionSchema,
        params: Params,
        ctx: TurnContext,
    ) -> Result<TurnOutcome, EngineError> {
        let user_id = ctx.user_id.clone();
        match schema.intent.as_str() {
            HELP => {
                let reply = self.help_text();
                return Ok(self.executed(&user_id, HELP, params, reply).await);
            }
            WORKFLOW_ADVANCE => return self.advance_workflow(params, &user_id).await,
            _ => {}
        }

        match self.executor.execute(&schema.intent, &params, &ctx).await {
            Ok(reply) => {
                log::info!("Executed {} for {}", schema.intent, user_id);
                if let Some(key) = schema.displays.as_deref() {
                    let shown = ctx.entities(key);
                    if !shown.is_empty() {
                        self.sessions.store_displayed_list(&user_id, key, shown)?;
                    }
                }
                Ok(self.executed(&user_id, &schema.intent, params, reply).await)
            }
            Err(e) => {
                log::warn!("{} failed for {}: {}", schema.intent, user_id, e);
                let err = EngineError::Execution(e);
                self.notifier.notify(&user_id, err.user_message()).await;
                Err(err)
            }
        }
    }

    async fn advance_workflow(&self, params: Params, user_id: &str) -> Result<TurnOutcome, EngineError> {
        let action = params
            .get("workflow_action")
            .map(ParamValue::display)
            .unwrap_or_default();

        let Some(before) = self.workflows.get_active(user_id)? else {
            return Ok(self.not_handled(user_id, NO_WORKFLOW.to_string()).await);
        };
        let Some(after) = self.workflows.advance(user_id, &action, None)? else {
            return Ok(self.not_handled(user_id, NO_WORKFLOW.to_string()).await);
        };

        if after.history.len() == before.history.len() {
            let reply = format!(
                "I can't {} right now. You can: {}.",
                action,
                before.available_actions().join(", ")
            );
            return Ok(self.not_handled(user_id, reply).await);
        }

        let name = humanize(&after.workflow_type.to_string());
        let reply = if after.state.is_terminal() {
            format!("Your {} is {}.", name, after.state.describe())
        } else {
            format!("Your {} is now {}.", name, after.state.describe())
        };
        Ok(self.executed(user_id, WORKFLOW_ADVANCE, params, reply).await)
    }

    fn help_text(&self) -> String {
        let mut schemas: Vec<&ActionSchema> = self
            .registry
            .schemas()
            .filter(|s| s.intent != HELP)
            .collect();
        schemas.sort_by(|a, b| a.intent.cmp(&b.intent));

        let mut lines = vec!["Here's what I can do:".to_string()];
        lines.extend(schemas.iter().map(|s| format!("- {}", s.description)));
        lines.join("\n")
    }

    async fn executed(&self, user_id: &str, intent: &str, params: Params, reply: String) -> TurnOutcome {
        self.notifier.notify(user_id, &reply).await;
        TurnOutcome::Executed {
            intent: intent.to_string(),
            params,
            reply,
        }
    }

    async fn not_handled(&self, user_id: &str, reply: String) -> TurnOutcome {
        self.notifier.notify(user_id, &reply).await;
        TurnOutcome::NotHandled { reply }
    }
}
