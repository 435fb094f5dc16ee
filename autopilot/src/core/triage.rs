//! Keyword heuristics for routing when no local model is available.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Unknown,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::Unknown => "unknown",
        }
    }

    /// Work small enough for the local tier.
    pub fn is_lightweight(self) -> bool {
        matches!(self, Complexity::Trivial | Complexity::Simple)
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trivial" => Ok(Complexity::Trivial),
            "simple" => Ok(Complexity::Simple),
            "moderate" => Ok(Complexity::Moderate),
            "complex" => Ok(Complexity::Complex),
            "unknown" => Ok(Complexity::Unknown),
            other => bail!("unknown complexity label: {other}"),
        }
    }
}

const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "architect",
    "redesign",
    "refactor",
    "migrate",
    "migration",
    "security",
    "concurrency",
    "distributed",
    "performance",
    "optimize",
    "rewrite",
    "multi-file",
];

const TRIVIAL_KEYWORDS: &[&str] = &[
    "typo",
    "rename",
    "comment",
    "docstring",
    "format",
    "whitespace",
    "spelling",
    "version bump",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "fix",
    "add test",
    "update",
    "small",
    "single",
    "log",
    "config",
    "readme",
];

const CLASSIFICATION_KEYWORDS: &[&str] = &[
    "classify",
    "categorize",
    "categorise",
    "label",
    "tag",
    "sentiment",
    "detect language",
];

/// More candidate files than this and a task is at least moderate.
pub const MODERATE_FILE_THRESHOLD: usize = 3;

/// Heuristic complexity: complex keywords win, then trivial, then simple,
/// then the file-count threshold, else simple.
pub fn heuristic_complexity(task: &str, file_count: usize) -> Complexity {
    let text = task.to_lowercase();
    if contains_any(&text, COMPLEX_KEYWORDS) {
        Complexity::Complex
    } else if contains_any(&text, TRIVIAL_KEYWORDS) {
        Complexity::Trivial
    } else if contains_any(&text, SIMPLE_KEYWORDS) {
        Complexity::Simple
    } else if file_count > MODERATE_FILE_THRESHOLD {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}

pub fn is_classification_task(task: &str) -> bool {
    contains_any(&task.to_lowercase(), CLASSIFICATION_KEYWORDS)
}

/// Keywords this short match whole words only, allowing plain inflections.
const SHORT_KEYWORD_LEN: usize = 4;
const INFLECTIONS: &[&str] = &["", "s", "es", "ed", "ing"];

/// Phrases match as substrings. Longer words match word prefixes so that
/// "format" hits "formatting" but not "information"; short words such as
/// "log" must be the whole word or a plain inflection of it ("logs", not "login").
fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        if kw.contains(' ') || kw.contains('-') {
            return text.contains(kw);
        }
        text.split(|c: char| !c.is_alphanumeric()).any(|word| {
            if kw.len() > SHORT_KEYWORD_LEN {
                return word.starts_with(kw);
            }
            word.strip_prefix(kw)
                .is_some_and(|rest| INFLECTIONS.contains(&rest))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_keywords_take_precedence() {
        assert_eq!(
            heuristic_complexity("Refactor the parser and fix a typo", 1),
            Complexity::Complex
        );
    }

    #[test]
    fn trivial_beats_simple() {
        assert_eq!(
            heuristic_complexity("Fix typo in README", 1),
            Complexity::Trivial
        );
    }

    #[test]
    fn file_count_makes_moderate() {
        assert_eq!(heuristic_complexity("wire up the endpoint", 4), Complexity::Moderate);
        assert_eq!(heuristic_complexity("wire up the endpoint", 3), Complexity::Simple);
    }

    #[test]
    fn keywords_match_word_prefixes_only() {
        assert_eq!(
            heuristic_complexity("Reformatting is not needed, add information", 1),
            Complexity::Simple
        );
        assert_eq!(heuristic_complexity("Formatting pass", 1), Complexity::Trivial);
    }

    #[test]
    fn short_keywords_match_whole_words() {
        assert_eq!(heuristic_complexity("Add login page", 5), Complexity::Moderate);
        assert_eq!(heuristic_complexity("Rework the logic", 5), Complexity::Moderate);
        assert_eq!(heuristic_complexity("Rotate the logs", 5), Complexity::Simple);
        assert_eq!(heuristic_complexity("Fixes for the parser", 5), Complexity::Simple);
        assert_eq!(heuristic_complexity("Correct typos", 5), Complexity::Trivial);
        assert!(!is_classification_task("Write a tagline for the landing page"));
        assert!(is_classification_task("Tag open issues by area"));
    }

    #[test]
    fn detects_classification_tasks() {
        assert!(is_classification_task("Classify these issues by area"));
        assert!(!is_classification_task("Implement login"));
    }

    #[test]
    fn parses_labels() {
        assert_eq!(" Moderate ".parse::<Complexity>().unwrap(), Complexity::Moderate);
        assert!("huge".parse::<Complexity>().is_err());
    }
}
