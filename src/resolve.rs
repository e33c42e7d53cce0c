//! Entity reference resolution.
//!
//! Turns "#2", "the second one", "that one" or "the budget report" into a
//! concrete entity, a shortlist to choose from, or nothing.

use std::sync::{Arc, OnceLock};

use chrono::Duration;
use regex::Regex;
use serde::Serialize;
use strsim::jaro_winkler;

use crate::error::EngineError;
use crate::session::SessionStore;
use crate::types::{EngineConfig, EntityRecord};
use crate::util::normalize_text;

/// Words ignored when fuzzy matching and when reading ordinals.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "my", "one", "that", "this", "please", "about", "with", "for", "to", "of",
    "on", "in", "task", "todo", "item", "email", "mail", "message", "doc", "document", "sheet",
    "option", "number", "no", "is", "it", "called", "named",
];

/// Whole replies that point back at the last auto-selected entity.
const BACK_REFERENCES: &[&str] = &["it", "that", "that one", "this one", "same one", "the same one"];

const ORDINALS: &[(&str, usize)] = &[
    ("first", 0),
    ("1st", 0),
    ("second", 1),
    ("2nd", 1),
    ("third", 2),
    ("3rd", 2),
    ("fourth", 3),
    ("4th", 3),
    ("fifth", 4),
    ("5th", 4),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub entity: EntityRecord,
    /// Similarity ×100 plus recency bonus, clamped to [0, 100].
    pub score: f64,
    pub recent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(EntityRecord),
    /// Close matches; the user picks one.
    Shortlist(Vec<ScoredCandidate>),
    /// Weak matches offered as a clarifying list.
    Clarify(Vec<ScoredCandidate>),
    NotFound,
}

pub struct AmbiguityResolver {
    sessions: Arc<SessionStore>,
    recency_window: Duration,
    recency_bonus: f64,
    auto_select_score: f64,
    shortlist_score: f64,
}

fn numbered_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(?:#|(?:task|item|number|no|option)\s+#?)(\d{1,6})(?:\s|$)")
            .expect("valid numbered regex")
    })
}

fn bare_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#?(\d{1,6})$").expect("valid number regex"))
}

impl AmbiguityResolver {
    pub fn new(sessions: Arc<SessionStore>, config: &EngineConfig) -> Self {
        Self {
            sessions,
            recency_window: Duration::seconds(config.recency_window_secs),
            recency_bonus: config.recency_bonus,
            auto_select_score: config.auto_select_score,
            shortlist_score: config.shortlist_score,
        }
    }

    pub fn resolve(
        &self,
        text: &str,
        candidates: &[EntityRecord],
        key: &str,
        user_id: &str,
    ) -> Result<Resolution, EngineError> {
        let normalized = normalize_text(text);

        if BACK_REFERENCES.contains(&normalized.as_str()) {
            if let Some(entity) = self.sessions.get_reference(user_id, key)? {
                log::debug!("Resolved back-reference to {} for {}", entity.key, user_id);
                return Ok(Resolution::Resolved(entity));
            }
        }

        if let Some(n) = parse_numbered(&normalized) {
            let displayed = self.sessions.get_displayed_list(user_id, key)?;
            let picked = match &displayed {
                Some(list) => nth(list, n),
                None => candidates
                    .iter()
                    .find(|c| c.key == n.to_string())
                    .cloned()
                    .or_else(|| nth(candidates, n)),
            };
            return self.finish_pick(picked, key, user_id);
        }

        if let Some(position) = parse_ordinal(&normalized) {
            let displayed = self.sessions.get_displayed_list(user_id, key)?;
            let list = displayed.as_deref().unwrap_or(candidates);
            let picked = position.index(list.len()).and_then(|i| list.get(i)).cloned();
            return self.finish_pick(picked, key, user_id);
        }

        let scored = self.score_all(&normalized, candidates);
        let Some(top) = scored.first() else {
            return Ok(Resolution::NotFound);
        };

        let tied = scored
            .get(1)
            .is_some_and(|second| (second.score - top.score).abs() < f64::EPSILON);

        if top.score >= self.auto_select_score && !tied {
            let entity = top.entity.clone();
            self.sessions.store_reference(user_id, key, &entity)?;
            log::debug!("Auto-selected {} ({:.0}) for {}", entity.key, top.score, user_id);
            return Ok(Resolution::Resolved(entity));
        }

        let (shown, resolution): (Vec<ScoredCandidate>, fn(Vec<ScoredCandidate>) -> Resolution) =
            if top.score >= self.shortlist_score {
                (scored.into_iter().take(2).collect(), Resolution::Shortlist)
            } else {
                (scored.into_iter().take(3).collect(), Resolution::Clarify)
            };
        let items: Vec<EntityRecord> = shown.iter().map(|s| s.entity.clone()).collect();
        self.sessions.store_displayed_list(user_id, key, &items)?;
        Ok(resolution(shown))
    }

    /// Score every candidate, best first.
    pub fn score_all(&self, normalized_query: &str, candidates: &[EntityRecord]) -> Vec<ScoredCandidate> {
        let query = strip_stopwords(normalized_query);
        let now = self.sessions.now();
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|entity| {
                let similarity = similarity(&query, &comparable(&normalize_text(&entity.display)));
                let recent = entity
                    .touched_at
                    .is_some_and(|t| t <= now && now - t <= self.recency_window);
                let bonus = if recent { self.recency_bonus } else { 0.0 };
                ScoredCandidate {
                    entity: entity.clone(),
                    score: (similarity * 100.0 + bonus).clamp(0.0, 100.0),
                    recent,
                }
            })
            .collect();
        // Stable sort keeps provider order among equal scores
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    fn finish_pick(
        &self,
        picked: Option<EntityRecord>,
        key: &str,
        user_id: &str,
    ) -> Result<Resolution, EngineError> {
        match picked {
            Some(entity) => {
                self.sessions.store_reference(user_id, key, &entity)?;
                Ok(Resolution::Resolved(entity))
            }
            None => Ok(Resolution::NotFound),
        }
    }
}

fn nth(list: &[EntityRecord], n: usize) -> Option<EntityRecord> {
    n.checked_sub(1).and_then(|i| list.get(i)).cloned()
}

/// `#3`, `task 3`, `item 3`, `number 3`, or a bare `3`.
fn parse_numbered(normalized: &str) -> Option<usize> {
    let caps = bare_number_regex()
        .captures(normalized)
        .or_else(|| numbered_regex().captures(normalized))?;
    caps.get(1)?.as_str().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Index(usize),
    Last,
    SecondToLast,
}

impl Position {
    fn index(self, len: usize) -> Option<usize> {
        match self {
            Position::Index(i) => (i < len).then_some(i),
            Position::Last => len.checked_sub(1),
            Position::SecondToLast => len.checked_sub(2),
        }
    }
}

/// An ordinal reply. Only fires when the ordinal is all that's left after
/// stopwords, so "the first draft of the plan" still goes to fuzzy matching.
fn parse_ordinal(normalized: &str) -> Option<Position> {
    let rest = strip_stopwords(normalized);
    match rest.as_str() {
        "second to last" | "second last" | "previous" | "penultimate" => {
            Some(Position::SecondToLast)
        }
        "last" | "latest" | "most recent" => Some(Position::Last),
        other => ORDINALS
            .iter()
            .find(|(word, _)| *word == other)
            .map(|(_, i)| Position::Index(*i)),
    }
}

fn strip_stopwords(normalized: &str) -> String {
    normalized
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stopword-stripped text, or the text itself if nothing would be left.
fn comparable(normalized: &str) -> String {
    let stripped = strip_stopwords(normalized);
    if stripped.is_empty() {
        normalized.to_string()
    } else {
        stripped
    }
}

/// Best Jaro-Winkler similarity between the query and the display, also
/// trying every window of the longer side that is as long as the shorter.
fn similarity(query: &str, display: &str) -> f64 {
    if query.is_empty() || display.is_empty() {
        return 0.0;
    }
    let mut best = jaro_winkler(query, display);
    let q: Vec<&str> = query.split_whitespace().collect();
    let d: Vec<&str> = display.split_whitespace().collect();
    if q.len() > d.len() && !d.is_empty() {
        for window in q.windows(d.len()) {
            best = best.max(jaro_winkler(&window.join(" "), display));
        }
    } else if d.len() > q.len() && !q.is_empty() {
        for window in d.windows(q.len()) {
            best = best.max(jaro_winkler(query, &window.join(" ")));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessions;
    use crate::util::ManualClock;
    use chrono::Utc;

    fn setup() -> (AmbiguityResolver, Arc<SessionStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sessions = Arc::new(
            SessionStore::new(Arc::new(MemorySessions::new())).with_clock(clock.clone()),
        );
        let resolver = AmbiguityResolver::new(sessions.clone(), &EngineConfig::default());
        (resolver, sessions, clock)
    }

    fn tasks() -> Vec<EntityRecord> {
        vec![
            EntityRecord::new("5", "Write quarterly report"),
            EntityRecord::new("7", "Review budget spreadsheet"),
            EntityRecord::new("9", "Call the dentist"),
        ]
    }

    #[test]
    fn test_numbered_uses_displayed_list() {
        let (resolver, sessions, _) = setup();
        let shown = vec![EntityRecord::new("5", "A"), EntityRecord::new("7", "B")];
        sessions.store_displayed_list("u1", "active_tasks", &shown).unwrap();

        let r = resolver.resolve("#2", &tasks(), "active_tasks", "u1").unwrap();
        assert_eq!(r, Resolution::Resolved(shown[1].clone()));
        assert_eq!(
            sessions.get_reference("u1", "active_tasks").unwrap(),
            Some(shown[1].clone())
        );
    }

    #[test]
    fn test_numbered_out_of_range_is_not_found() {
        let (resolver, sessions, _) = setup();
        sessions
            .store_displayed_list("u1", "active_tasks", &[EntityRecord::new("5", "A")])
            .unwrap();
        let r = resolver.resolve("task 3", &tasks(), "active_tasks", "u1").unwrap();
        assert_eq!(r, Resolution::NotFound);
    }

    #[test]
    fn test_numbered_without_list_prefers_key() {
        let (resolver, _, _) = setup();
        let r = resolver.resolve("7", &tasks(), "active_tasks", "u1").unwrap();
        assert_eq!(r, Resolution::Resolved(tasks()[1].clone()));
        // No key "2": falls back to position
        let r = resolver.resolve("item 2", &tasks(), "active_tasks", "u1").unwrap();
        assert_eq!(r, Resolution::Resolved(tasks()[1].clone()));
        let r = resolver.resolve("#0", &tasks(), "active_tasks", "u1").unwrap();
        assert_eq!(r, Resolution::NotFound);
    }

    #[test]
    fn test_ordinals() {
        let (resolver, _, _) = setup();
        let all = tasks();
        for (text, expected) in [
            ("the first one", Some(0)),
            ("third", Some(2)),
            ("the last one", Some(2)),
            ("previous", Some(1)),
            ("second to last", Some(1)),
            ("fifth", None),
        ] {
            let r = resolver.resolve(text, &all, "active_tasks", "u1").unwrap();
            match expected {
                Some(i) => assert_eq!(r, Resolution::Resolved(all[i].clone()), "{}", text),
                None => assert_eq!(r, Resolution::NotFound, "{}", text),
            }
        }
    }

    #[test]
    fn test_fuzzy_exact_title_auto_selects() {
        let (resolver, sessions, _) = setup();
        let r = resolver
            .resolve("the quarterly report", &tasks(), "active_tasks", "u1")
            .unwrap();
        assert_eq!(r, Resolution::Resolved(tasks()[0].clone()));
        assert!(sessions.get_reference("u1", "active_tasks").unwrap().is_some());
    }

    #[test]
    fn test_back_reference_uses_stored_entity() {
        let (resolver, sessions, _) = setup();
        sessions
            .store_reference("u1", "active_tasks", &tasks()[2])
            .unwrap();
        let r = resolver.resolve("that one", &tasks(), "active_tasks", "u1").unwrap();
        assert_eq!(r, Resolution::Resolved(tasks()[2].clone()));
    }

    #[test]
    fn test_weak_match_clarifies_with_three_and_stores_list() {
        let (resolver, sessions, _) = setup();
        let r = resolver.resolve("zzz qqq", &tasks(), "active_tasks", "u1").unwrap();
        match r {
            Resolution::Clarify(shown) => {
                assert_eq!(shown.len(), 3);
                let stored = sessions.get_displayed_list("u1", "active_tasks").unwrap().unwrap();
                let shown_keys: Vec<_> = shown.iter().map(|s| s.entity.key.clone()).collect();
                let stored_keys: Vec<_> = stored.iter().map(|e| e.key.clone()).collect();
                assert_eq!(shown_keys, stored_keys);
            }
            other => panic!("expected Clarify, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_titles_are_not_auto_selected() {
        let (resolver, _, _) = setup();
        let dupes = vec![
            EntityRecord::new("1", "Budget review"),
            EntityRecord::new("2", "Budget review"),
        ];
        let r = resolver.resolve("budget review", &dupes, "active_tasks", "u1").unwrap();
        assert!(matches!(r, Resolution::Shortlist(ref s) if s.len() == 2));
    }

    #[test]
    fn test_recency_bonus_and_clamp() {
        let (resolver, sessions, _) = setup();
        let now = sessions.now();
        let stale = EntityRecord::new("1", "Budget review").touched(now - Duration::hours(3));
        let fresh = EntityRecord::new("2", "Budget reviews").touched(now - Duration::minutes(5));
        let scored = resolver.score_all("budget review", &[stale.clone(), fresh.clone()]);
        let fresh_score = scored.iter().find(|s| s.entity.key == "2").unwrap();
        let stale_score = scored.iter().find(|s| s.entity.key == "1").unwrap();
        assert!(fresh_score.recent);
        assert!(!stale_score.recent);
        assert!(fresh_score.score <= 100.0);
        assert!((stale_score.score - 100.0).abs() < 1e-9);

        // Equal similarity: the recently touched one ranks first
        let a = EntityRecord::new("a", "Plan offsite");
        let b = EntityRecord::new("b", "Plan offsite").touched(now);
        let scored = resolver.score_all("zzz", &[a, b]);
        assert_eq!(scored[0].entity.key, "b");
        assert!((scored[0].score - 10.0).abs() < 1e-9);
        assert_eq!(scored[1].score, 0.0);
    }

    #[test]
    fn test_empty_candidates() {
        let (resolver, _, _) = setup();
        assert_eq!(
            resolver.resolve("anything", &[], "active_tasks", "u1").unwrap(),
            Resolution::NotFound
        );
    }

    #[test]
    fn test_window_similarity_finds_title_inside_sentence() {
        let display = comparable("call the dentist");
        let long = similarity(&comparable("can you finish call dentist today"), &display);
        let unrelated = similarity("finish spreadsheet today", &display);
        assert!(long > unrelated);
    }
}
