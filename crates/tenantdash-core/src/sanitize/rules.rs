use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Loose shape check for email addresses. The identity provider does the
/// real validation; this only rejects obviously broken input early.
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@<>]+@[^\s@<>]+\.[^\s@<>]+$").expect("email pattern compiles")
});

/// Maximum length of an email address (RFC 5321 path limit).
const EMAIL_MAX_LENGTH: usize = 254;
const EMAIL_MIN_LENGTH: usize = 3;

const PASSWORD_MIN_LENGTH: usize = 8;
const PASSWORD_MAX_LENGTH: usize = 128;

const SEARCH_MAX_LENGTH: usize = 200;

const GENERIC_MAX_LENGTH: usize = 1000;

/// The kind of field being validated. Each kind has a default rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum FieldKind {
    Email,
    Password,
    SearchText,
    GenericText,
}

impl FieldKind {
    /// Human-readable field name for error messages
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Email => "email",
            FieldKind::Password => "password",
            FieldKind::SearchText => "search",
            FieldKind::GenericText => "text",
        }
    }
}

/// Declared rule set for one field.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    pub strip_markup: bool,
    pub max_length: Option<usize>,
    pub min_length: Option<usize>,
    pub allowed_pattern: Option<Regex>,
    pub block_script_patterns: bool,
}

impl Rules {
    /// Default rules for a field kind.
    ///
    /// Passwords are never stripped or trimmed; any character is legal in a
    /// password.
    pub fn for_kind(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Email => Self {
                strip_markup: true,
                max_length: Some(EMAIL_MAX_LENGTH),
                min_length: Some(EMAIL_MIN_LENGTH),
                allowed_pattern: Some(EMAIL_PATTERN.clone()),
                block_script_patterns: true,
            },
            FieldKind::Password => Self {
                strip_markup: false,
                max_length: Some(PASSWORD_MAX_LENGTH),
                min_length: Some(PASSWORD_MIN_LENGTH),
                allowed_pattern: None,
                block_script_patterns: false,
            },
            FieldKind::SearchText => Self {
                strip_markup: true,
                max_length: Some(SEARCH_MAX_LENGTH),
                min_length: None,
                allowed_pattern: None,
                block_script_patterns: true,
            },
            FieldKind::GenericText => Self {
                strip_markup: true,
                max_length: Some(GENERIC_MAX_LENGTH),
                min_length: None,
                allowed_pattern: None,
                block_script_patterns: true,
            },
        }
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn with_min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    /// Require the sanitized value to match `pattern`.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.allowed_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }
}
