// Vague urgency terms → concrete due time + default priority
//
// The same term and reference instant always give the same answer.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::task::{MAX_PRIORITY, MIN_PRIORITY};

/// Result of translating a vague term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VagueTranslation {
    pub date: DateTime<Utc>,
    pub priority: u8,
}

/// How a term's due time is derived from the reference instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueOffset {
    After(Duration),
    /// Last second of the reference instant's UTC day, never before it
    EndOfDay,
}

impl DueOffset {
    fn resolve(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DueOffset::After(delta) => reference + *delta,
            DueOffset::EndOfDay => reference
                .date_naive()
                .and_hms_opt(23, 59, 59)
                .map(|end| Utc.from_utc_datetime(&end))
                .unwrap_or(reference)
                .max(reference),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VagueRule {
    pub offset: DueOffset,
    pub priority: u8,
}

/// One configurable vocabulary entry (`[[vague_terms]]` in config.toml)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VagueTermEntry {
    pub term: String,
    #[serde(default)]
    pub offset_secs: Option<i64>,
    #[serde(default)]
    pub end_of_day: bool,
    pub priority: u8,
}

/// Built-in vocabulary: (terms, offset in seconds or None for end of day, priority)
const DEFAULT_TERMS: &[(&[&str], Option<i64>, u8)] = &[
    (&["immediately", "right now", "now"], Some(0), 10),
    (&["urgent", "urgently", "critical"], Some(3600), 10),
    (&["asap", "as soon as possible"], Some(2 * 3600), 9),
    (&["soon", "shortly"], Some(4 * 3600), 7),
    (
        &["today", "by end of day", "end of day", "eod", "by eod", "tonight"],
        None,
        7,
    ),
    (&["tomorrow", "by tomorrow"], Some(86_400), 6),
    (
        &["this week", "by end of week", "end of week"],
        Some(3 * 86_400),
        5,
    ),
    (&["next week"], Some(7 * 86_400), 4),
    (
        &[
            "when you have time",
            "whenever",
            "no rush",
            "low priority",
            "someday",
            "eventually",
        ],
        Some(7 * 86_400),
        2,
    ),
];

/// Static lookup table of vague terms
#[derive(Debug, Clone)]
pub struct VagueTermTable {
    rules: HashMap<String, VagueRule>,
}

impl Default for VagueTermTable {
    fn default() -> Self {
        let mut rules = HashMap::new();
        for (terms, offset, priority) in DEFAULT_TERMS {
            let offset = match offset {
                Some(secs) => DueOffset::After(Duration::seconds(*secs)),
                None => DueOffset::EndOfDay,
            };
            for term in *terms {
                rules.insert(
                    normalize_term(term),
                    VagueRule {
                        offset,
                        priority: *priority,
                    },
                );
            }
        }
        Self { rules }
    }
}

impl VagueTermTable {
    /// Table with no entries
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Built-in table extended (or overridden) by configured entries.
    /// Entries with an out-of-range priority are skipped with a warning.
    pub fn with_entries(entries: &[VagueTermEntry]) -> Self {
        let mut table = Self::default();
        for entry in entries {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&entry.priority) {
                tracing::warn!(
                    "Ignoring vague term '{}': priority {} out of range",
                    entry.term,
                    entry.priority
                );
                continue;
            }
            let offset = if entry.end_of_day {
                DueOffset::EndOfDay
            } else {
                DueOffset::After(Duration::seconds(entry.offset_secs.unwrap_or(0).max(0)))
            };
            table.insert(&entry.term, offset, entry.priority);
        }
        table
    }

    pub fn insert(&mut self, term: &str, offset: DueOffset, priority: u8) {
        self.rules.insert(
            normalize_term(term),
            VagueRule {
                offset,
                priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            },
        );
    }

    pub fn contains(&self, term: &str) -> bool {
        self.rules.contains_key(&normalize_term(term))
    }

    /// Known terms, sorted
    pub fn terms(&self) -> Vec<&str> {
        let mut terms: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        terms.sort_unstable();
        terms
    }

    /// Translate `term` relative to `reference`; `None` for unknown terms.
    pub fn translate(&self, term: &str, reference: DateTime<Utc>) -> Option<VagueTranslation> {
        self.rules.get(&normalize_term(term)).map(|rule| VagueTranslation {
            date: rule.offset.resolve(reference),
            priority: rule.priority,
        })
    }
}

/// Translate with the built-in vocabulary.
pub fn translate_vague_term(term: &str, reference: DateTime<Utc>) -> Option<VagueTranslation> {
    VagueTermTable::default().translate(term, reference)
}

/// Lowercase, trim, collapse whitespace, drop surrounding punctuation.
fn normalize_term(term: &str) -> String {
    term.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
