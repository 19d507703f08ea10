//! Approval Parser - the "GO REPAIR" grammar
//!
//! Turns a raw human utterance into the set of plan steps the human approved.
//!
//! Supported forms (case-insensitive):
//! - "GO REPAIR"                      -> all steps
//! - "GO REPAIR: 1,2,3"               -> steps 1, 2, 3
//! - "GO REPAIR: 1-3"                 -> steps 1, 2, 3
//! - "GO REPAIR: 1,3-5,7"             -> steps 1, 3, 4, 5, 7
//! - "GO: 2" / "go - 2"               -> step 2
//! - "GO REPAIR: disable Login Items" -> all steps, free text "disable Login Items"
//!
//! Parsing never fails with an error. Anything that is not an approval is `None`
//! and the caller treats the text as ordinary conversation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Upper bound used for "approve everything" (no payload, or description only)
pub const ALL_STEPS_LIMIT: u32 = 20;

/// Widest range accepted as a number match ("1-1000" is fine, "1-5000" is text)
pub const MAX_RANGE_SPAN: u32 = 1000;

static TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*go\b(?:\s+repair\b)?\s*[:\-]?\s*(.*)$").expect("valid trigger regex")
});

static SINGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("valid single-step regex"));

static RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)$").expect("valid range regex"));

/// Steps approved by one GO command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApprovedSteps {
    /// Approved plan step numbers (sorted, unique)
    pub steps: BTreeSet<u32>,

    /// Description the human approved by, when no step numbers were given
    pub free_text: String,
}

impl ApprovedSteps {
    /// All steps up to [`ALL_STEPS_LIMIT`] with an optional description
    pub fn all(free_text: impl Into<String>) -> Self {
        Self {
            steps: (1..=ALL_STEPS_LIMIT).collect(),
            free_text: free_text.into(),
        }
    }

    /// Explicit step numbers, no description
    pub fn numbered(steps: impl IntoIterator<Item = u32>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            free_text: String::new(),
        }
    }

    pub fn contains(&self, step: u32) -> bool {
        self.steps.contains(&step)
    }

    pub fn as_vec(&self) -> Vec<u32> {
        self.steps.iter().copied().collect()
    }
}

/// Parse a human message into approved steps.
///
/// Returns `None` when the message is not a GO command.
pub fn parse(text: &str) -> Option<ApprovedSteps> {
    let captures = TRIGGER.captures(text)?;
    let payload = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");

    if payload.is_empty() {
        return Some(ApprovedSteps::all(""));
    }

    let mut steps = BTreeSet::new();
    let mut found_number = false;

    for segment in payload.split(',') {
        if let Some(numbers) = parse_segment(segment.trim()) {
            found_number = true;
            steps.extend(numbers);
        }
    }

    if found_number {
        Some(ApprovedSteps {
            steps,
            free_text: String::new(),
        })
    } else {
        Some(ApprovedSteps::all(payload))
    }
}

/// True if the text would be recognised as a GO command
pub fn is_go_command(text: &str) -> bool {
    TRIGGER.is_match(text)
}

/// Steps as display string (e.g. "1, 2, 3")
pub fn format_steps(steps: &BTreeSet<u32>) -> String {
    steps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single number or an ascending range; anything else is text
fn parse_segment(segment: &str) -> Option<std::ops::RangeInclusive<u32>> {
    if SINGLE.is_match(segment) {
        let n = parse_step(segment)?;
        return Some(n..=n);
    }

    let caps = RANGE.captures(segment)?;
    let start = parse_step(&caps[1])?;
    let end = parse_step(&caps[2])?;

    if start > end || end - start >= MAX_RANGE_SPAN {
        return None;
    }

    Some(start..=end)
}

fn parse_step(digits: &str) -> Option<u32> {
    match digits.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}
