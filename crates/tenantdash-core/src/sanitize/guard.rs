use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::rules::{FieldKind, Rules};

/// Script and style elements are removed together with their contents.
static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\s*(script|style)\b[^>]*>.*?<\s*/\s*(script|style)\s*>")
        .expect("script block pattern compiles")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern compiles"));

/// A tag opened at the end of the input and never closed (`<img src=x`).
static DANGLING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[a-zA-Z!/?][^>]*$").expect("dangling tag pattern compiles"));

static SCRIPT_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(<\s*script\b|javascript\s*:|vbscript\s*:|data\s*:\s*text/html|expression\s*\(|\bon(load|error|click|dblclick|mouse[a-z]*|key[a-z]*|focus|blur|submit|change|input)\s*=)",
    )
    .expect("script content pattern compiles")
});

/// One violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ValidationError {
    #[error("must be at least {min} characters (got {actual})")]
    TooShort { min: usize, actual: usize },

    #[error("must be at most {max} characters (got {actual})")]
    TooLong { max: usize, actual: usize },

    #[error("has an invalid format")]
    PatternMismatch,

    #[error("contains script content")]
    ScriptContent,
}

/// Outcome of validating one field.
///
/// `sanitized_value` is always populated, even when `is_valid` is false, so
/// the caller has something safe to echo back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ValidationResult {
    pub is_valid: bool,
    pub sanitized_value: String,
    pub errors: Vec<ValidationError>,
}

/// Remove structural markup from `input`.
///
/// Script/style elements lose their contents as well; every other tag is
/// dropped and its text kept.
pub fn strip_markup(input: &str) -> String {
    let without_blocks = SCRIPT_BLOCK.replace_all(input, "");
    let without_tags = TAG.replace_all(&without_blocks, "");
    DANGLING_TAG.replace_all(&without_tags, "").into_owned()
}

/// Validate and sanitize a single field.
///
/// Every violated rule is reported, not just the first. Sanitization order:
/// control characters and surrounding whitespace, then markup and script
/// patterns repeatedly until nothing more is removed. Lengths and patterns
/// are checked against that result, and the returned value is finally cut
/// to `max_length`.
pub fn validate(kind: FieldKind, raw: &str, rules: &Rules) -> ValidationResult {
    let mut errors = Vec::new();

    let value = match kind {
        FieldKind::Password => raw.to_string(),
        _ => normalize_whitespace(raw),
    };

    let (mut value, scripted) = scrub(value, rules);
    if scripted || (rules.block_script_patterns && SCRIPT_PATTERNS.is_match(raw)) {
        errors.push(ValidationError::ScriptContent);
    }

    let length = value.chars().count();

    if let Some(min) = rules.min_length {
        if length < min {
            errors.push(ValidationError::TooShort { min, actual: length });
        }
    }

    if let Some(max) = rules.max_length {
        if length > max {
            errors.push(ValidationError::TooLong { max, actual: length });
            value = value.chars().take(max).collect();
        }
    }

    if let Some(ref pattern) = rules.allowed_pattern {
        if !pattern.is_match(&value) {
            errors.push(ValidationError::PatternMismatch);
        }
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        sanitized_value: value,
        errors,
    }
}

/// Strip markup and script patterns until neither finds anything left.
///
/// Removing one match can splice its neighbours into a new one
/// (`javajavascript:script:`), so a single pass is not enough. Every change
/// shortens the value, which bounds the loop. Also reports whether any
/// script pattern was removed.
fn scrub(mut value: String, rules: &Rules) -> (String, bool) {
    let mut scripted = false;
    loop {
        let before = value.len();
        if rules.strip_markup {
            value = strip_markup(&value).trim().to_string();
        }
        if rules.block_script_patterns && SCRIPT_PATTERNS.is_match(&value) {
            scripted = true;
            value = SCRIPT_PATTERNS.replace_all(&value, "").into_owned();
        }
        if value.len() == before {
            return (value, scripted);
        }
    }
}

/// Drop control characters (keeping newlines and tabs) and trim.
fn normalize_whitespace(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}
