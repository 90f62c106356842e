use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Gender, NameType};

/// A validated name occurrence, ready to become one row of the `names` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub count: i32,
    pub text: String,
    pub name_type: NameType,
    pub gender: Gender,
}

/// Parser output: everything but the name type, which is run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub count: i32,
    pub text: String,
    pub gender: Gender,
}

impl ParsedName {
    pub fn with_type(self, name_type: NameType) -> Record {
        Record {
            count: self.count,
            text: self.text,
            name_type,
            gender: self.gender,
        }
    }
}

/// Why a piece of name text was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("text is empty")]
    Empty,
    #[error("text contains a NUL byte")]
    ContainsNul,
}

/// Record-level validation failures, collected rather than short-circuited.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid record: {}", problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

/// Pluggable normalization and validity rules for name text.
pub trait TextPolicy: Send + Sync {
    /// Produce the stored form of `raw`, or refuse it.
    fn normalize(&self, raw: &str) -> Result<String, TextError>;

    /// Check text that is already normalized.
    fn validate(&self, text: &str) -> Result<(), TextError>;
}

/// Default policy: trims surrounding whitespace; the result must be non-empty
/// and free of NUL bytes, which PostgreSQL text columns cannot hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimmedText;

impl TextPolicy for TrimmedText {
    fn normalize(&self, raw: &str) -> Result<String, TextError> {
        let text = raw.trim();
        self.validate(text)?;
        Ok(text.to_string())
    }

    fn validate(&self, text: &str) -> Result<(), TextError> {
        if text.is_empty() {
            return Err(TextError::Empty);
        }
        if text.contains('\0') {
            return Err(TextError::ContainsNul);
        }
        Ok(())
    }
}

impl Record {
    /// Re-check the record invariants: `count` in `[1, i32::MAX]` and text
    /// accepted by `policy`. Enum membership is enforced by the types.
    pub fn validate(&self, policy: &dyn TextPolicy) -> Result<(), ValidationError> {
        let mut problems = Vec::new();

        if self.count < 1 {
            problems.push(format!("count must be positive, got {}", self.count));
        }
        if let Err(err) = policy.validate(&self.text) {
            problems.push(format!("name_text: {err}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { problems })
        }
    }
}
