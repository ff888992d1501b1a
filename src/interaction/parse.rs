//! Decoding of host-supplied visit contexts.
//!
//! The host writes one [`VisitContext`] JSON object per line. Blank lines are
//! rejected here and skipped by the caller; anything that does not decode is
//! reported with its line number so the operator can find it.

use thiserror::Error;

use super::VisitContext;

/// Errors that can occur while decoding an input line.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: empty input")]
    Empty { line: usize },

    #[error("line {line}: invalid visit context: {source}")]
    InvalidJson {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl ParseError {
    /// Short label for metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "empty",
            Self::InvalidJson { .. } => "invalid_json",
        }
    }
}

/// Parse one NDJSON line into a [`VisitContext`].
pub fn parse_visit(line: usize, data: &str) -> Result<VisitContext, ParseError> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty { line });
    }

    serde_json::from_str(trimmed).map_err(|source| ParseError::InvalidJson { line, source })
}
