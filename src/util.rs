use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for TTL and staleness checks.
///
/// Expiry is always an explicit timestamp comparison at read time, so tests
/// drive time with `ManualClock` instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Normalize user text for keyword and prefix matching.
///
/// NFKD-folds accents away, lowercases, replaces punctuation with spaces
/// (keeping `#` so numbered references survive) and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| c.is_ascii() || c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for c in folded.chars() {
        let keep = c.is_alphanumeric() || c == '#' || c == '\'';
        if keep {
            if c != '\'' {
                out.push(c);
                last_space = false;
            }
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Whole-word (or whole-phrase) containment on normalized text.
pub fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let phrase = normalize_text(phrase);
    if phrase.is_empty() {
        return false;
    }
    let padded = format!(" {} ", normalized);
    padded.contains(&format!(" {} ", phrase))
}

const AFFIRMATIVE: &[&str] = &[
    "yes", "y", "yeah", "yep", "yup", "sure", "ok", "okay", "confirm", "confirmed", "do it",
    "go ahead", "please do", "correct", "absolutely", "send it",
];

const NEGATIVE: &[&str] = &[
    "no", "n", "nope", "nah", "cancel", "stop", "don't", "dont", "do not", "never mind",
    "nevermind", "abort", "wait",
];

/// A short reply that starts with an affirmative word.
pub fn is_affirmative(text: &str) -> bool {
    leading_phrase_in(text, AFFIRMATIVE) && !is_negative(text)
}

pub fn is_negative(text: &str) -> bool {
    leading_phrase_in(text, NEGATIVE)
}

/// Words that turn a reply into a refusal on their own.
const REFUSAL_WORDS: &[&str] = &[
    "no", "n", "nope", "nah", "cancel", "stop", "dont", "never", "nevermind", "abort", "wait",
    "forget",
];

/// Words allowed alongside a refusal word ("no thanks", "forget it").
const REFUSAL_FILLER: &[&str] = &["thanks", "thank", "you", "it", "that", "do", "not", "mind", "please"];

/// The whole reply is a refusal, e.g. "no", "nope, forget it", "never mind".
///
/// Unlike `is_negative`, a reply that merely starts with a negative word
/// ("stop smoking", "no. 2") is not a refusal.
pub fn is_refusal(text: &str) -> bool {
    let normalized = normalize_text(text);
    let words: Vec<&str> = normalized.split_whitespace().collect();
    words.iter().any(|w| REFUSAL_WORDS.contains(w))
        && words
            .iter()
            .all(|w| REFUSAL_WORDS.contains(w) || REFUSAL_FILLER.contains(w))
}

fn leading_phrase_in(text: &str, phrases: &[&str]) -> bool {
    let normalized = normalize_text(text);
    phrases.iter().any(|p| {
        normalized == *p || normalized.starts_with(&format!("{} ", p))
    })
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Render `{name}` placeholders through `lookup`.
///
/// Returns `None` if any placeholder has no value, so callers can fall back
/// to a generic phrasing instead of showing a half-filled sentence.
pub fn render_template<F>(template: &str, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = false;
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
        match lookup(&caps[1]) {
            Some(v) => v,
            None => {
                missing = true;
                String::new()
            }
        }
    });
    if missing {
        None
    } else {
        Some(rendered.into_owned())
    }
}

/// Humanize a parameter name: `due_date` → "due date".
pub fn humanize(name: &str) -> String {
    name.replace(['_', '-'], " ")
}

/// SHA-256 of a byte slice, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_text("  Add a TODO: buy milk!! "), "add a todo buy milk");
        assert_eq!(normalize_text("mark #2 done."), "mark #2 done");
        assert_eq!(normalize_text("Café résumé"), "cafe resume");
        assert_eq!(normalize_text("don't"), "dont");
    }

    #[test]
    fn test_contains_phrase_is_word_bounded() {
        let text = normalize_text("please remind me to call mom");
        assert!(contains_phrase(&text, "remind me"));
        assert!(!contains_phrase(&text, "mind"));
        assert!(!contains_phrase(&text, ""));
    }

    #[test]
    fn test_yes_no() {
        assert!(is_affirmative("Yes please"));
        assert!(is_affirmative("ok"));
        assert!(!is_affirmative("yesterday's email"));
        assert!(is_negative("No, don't"));
        assert!(is_negative("never mind"));
        assert!(!is_affirmative("no"));
    }

    #[test]
    fn test_refusal_needs_the_whole_reply() {
        for text in ["no", "Nope.", "no thanks", "never mind", "forget it", "don't", "Cancel that"] {
            assert!(is_refusal(text), "{}", text);
        }
        for text in ["Stop smoking", "No. 2", "no 2", "wait for the invoice", "do it", ""] {
            assert!(!is_refusal(text), "{}", text);
        }
    }

    #[test]
    fn test_render_template() {
        let out = render_template("Send to {recipient}?", |k| {
            (k == "recipient").then(|| "Sam".to_string())
        });
        assert_eq!(out.as_deref(), Some("Send to Sam?"));
        assert!(render_template("Send to {nobody}?", |_| None).is_none());
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));
    }

    #[test]
    fn test_timestamp_roundtrip_is_lexically_ordered() {
        use chrono::SubsecRound;
        let a = Utc::now();
        let b = a + chrono::Duration::seconds(1);
        assert!(format_timestamp(a) < format_timestamp(b));
        assert_eq!(parse_timestamp(&format_timestamp(a)), Some(a.trunc_subsecs(6)));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
