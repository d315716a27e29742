use serde::Serialize;
use std::fmt;

use crate::error::AppError;

pub const QUESTION_MIN_CHARS: usize = 5;
pub const QUESTION_MAX_CHARS: usize = 100;

/// Question text with collapsed whitespace and punctuation spacing stripped.
/// Together with a party it forms the answer-cache identity, so every path
/// that touches the cache must go through [`NormalizedQuestion::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NormalizedQuestion(String);

impl NormalizedQuestion {
    /// Validates the raw question length, then normalizes spacing.
    ///
    /// Length limits apply to the text as the user typed it; the error
    /// messages are surfaced verbatim to the caller.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let length = raw.chars().count();
        if length < QUESTION_MIN_CHARS {
            return Err(AppError::Validation(
                "Pytanie musi mieć przynajmniej 5 znaków.".to_string(),
            ));
        }
        if length > QUESTION_MAX_CHARS {
            return Err(AppError::Validation(
                "Pytanie może mieć maksymalnie 100 znaków.".to_string(),
            ));
        }

        Ok(Self(normalize_spacing(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapses whitespace runs to single spaces and drops spaces that precede
/// sentence punctuation, trimming both ends.
fn normalize_spacing(input: &str) -> String {
    let mut normalized = String::with_capacity(input.len());
    let mut pending_space = false;

    for ch in input.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
        } else if matches!(ch, '?' | '.' | '!') {
            pending_space = false;
            normalized.push(ch);
        } else {
            if pending_space {
                normalized.push(' ');
                pending_space = false;
            }
            normalized.push(ch);
        }
    }

    normalized
}
