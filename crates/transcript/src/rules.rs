//! Heuristic completeness rules.
//!
//! The classifier is an intentionally shallow filter, not a parser. Rules
//! are explicit, ordered tables — strong rules before weak, first match
//! wins — so the ordering is an inspectable contract rather than implicit
//! fallthrough.

use regex::Regex;
use std::sync::LazyLock;

/// One classification rule: a name for diagnostics plus its pattern.
pub struct Rule {
    pub name: &'static str,
    pub pattern: Regex,
}

fn rule(name: &'static str, pattern: &str) -> Rule {
    Rule {
        name,
        // Patterns are compile-time constants; a bad one is a programmer error.
        pattern: Regex::new(pattern).expect("static rule pattern must compile"),
    }
}

/// Strong incompleteness signals — apply at any length.
static STRONG_INCOMPLETE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            "dangling-contraction",
            r"(?i)\w'(?:m|re|ve|ll|d)\s*$",
        ),
        rule("trailing-article", r"(?i)\b(?:a|an|the)\s*$"),
        rule("trailing-comma", r",\s*$"),
        rule(
            "trailing-negated-modal",
            r"(?i)\b(?:can't|won't|don't|doesn't|didn't|shouldn't|couldn't|wouldn't|isn't|aren't|wasn't|weren't)\s*$",
        ),
    ]
});

/// Weak incompleteness signals — apply only below the word threshold.
static WEAK_INCOMPLETE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            "trailing-conjunction",
            r"(?i)\b(?:and|but|or|nor|so|because|although|if|unless|while|that)\s*$",
        ),
        rule(
            "trailing-preposition",
            r"(?i)\b(?:to|of|in|on|at|by|with|for|from|about|into|over|under)\s*$",
        ),
        rule(
            "trailing-auxiliary",
            r"(?i)\b(?:was|were|has|have|had|will|would|could|should|might|must|can|do|does|did)\s*$",
        ),
    ]
});

/// Words that open a continuation even when the fragment is capitalized.
const CONTINUATION_OPENERS: &[&str] = &[
    "pretty", "really", "it", "that", "also", "and", "but", "which",
];

/// Does this fragment look like a sentence cut off mid-thought?
///
/// Two words or fewer always pass — short interjections ("yes", "stop")
/// are never buffered. Strong rules fire regardless of length; weak rules
/// only when the fragment is shorter than `min_words_for_complete`.
pub fn looks_incomplete(text: &str, min_words_for_complete: usize) -> bool {
    let trimmed = text.trim();
    let word_count = trimmed.split_whitespace().count();
    if word_count <= 2 {
        return false;
    }

    if let Some(rule) = STRONG_INCOMPLETE.iter().find(|r| r.pattern.is_match(trimmed)) {
        tracing::trace!(rule = rule.name, "Fragment judged incomplete");
        return true;
    }

    if word_count < min_words_for_complete {
        if let Some(rule) = WEAK_INCOMPLETE.iter().find(|r| r.pattern.is_match(trimmed)) {
            tracing::trace!(rule = rule.name, "Short fragment judged incomplete");
            return true;
        }
    }

    false
}

/// Does this fragment look like the continuation of a previous one?
pub fn looks_continuation(text: &str) -> bool {
    let trimmed = text.trim_start();
    let Some(first_char) = trimmed.chars().next() else {
        return false;
    };
    if first_char.is_lowercase() {
        return true;
    }

    let first_word = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    CONTINUATION_OPENERS.contains(&first_word.as_str())
}
