//! Expression error types and typo suggestions

use thiserror::Error;

/// Errors raised while parsing an expression
///
/// Missing data never produces an error; it resolves to `undefined`.
/// These variants only cover text that does not follow the grammar.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    /// Tokenizer or parser failure
    #[error("syntax error in '{expression}' at offset {offset}: {message}")]
    Syntax {
        expression: String,
        offset: usize,
        message: String,
    },

    /// A dotted-path segment that is neither an identifier nor `[integer]`
    #[error("invalid path segment '{segment}' in '{expression}'")]
    InvalidPathSegment { expression: String, segment: String },
}

impl ExpressionError {
    /// Create a syntax error
    pub fn syntax(expression: &str, offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            expression: expression.to_string(),
            offset,
            message: message.into(),
        }
    }

    /// Create an invalid path segment error
    pub fn invalid_segment(expression: &str, segment: impl Into<String>) -> Self {
        Self::InvalidPathSegment {
            expression: expression.to_string(),
            segment: segment.into(),
        }
    }
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let mut best_match = None;
    let mut best_distance = usize::MAX;
    let max_distance = (typo.len() / 2).max(2);

    for candidate in candidates {
        let distance = levenshtein_distance(typo, candidate);
        if distance < best_distance && distance <= max_distance {
            best_distance = distance;
            best_match = Some(candidate.to_string());
        }
    }

    best_match
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    // Two-row variant; only the previous row is ever read
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0usize; b_chars.len() + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b_chars.len()]
}
