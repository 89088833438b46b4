//! Review-system API error types.
//!
//! Every collaborator failure is categorized for routing decisions:
//!
//! - **Transient** errors are handed to the retry processor and never surfaced.
//! - **NotFound** and **Rejected** are definite negatives: terminal for the
//!   affected branch, always surfaced as a comment.
//! - **Protocol** covers unparseable responses and rejections of operations
//!   the bot expects to always succeed (e.g. its own approval); these are
//!   escalated to a human.

use std::fmt;
use thiserror::Error;

/// The kind of review-system error, categorized for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GerritErrorKind {
    /// No usable response from the collaborator (timeout, connection reset,
    /// 5xx). Safe to retry after a delay.
    Transient,

    /// The addressed entity does not exist (missing branch, unknown change).
    NotFound,

    /// The collaborator understood the request and said no (cherry-pick
    /// rejected, staging refused).
    Rejected,

    /// An unparseable response, or rejection of an operation that must always
    /// succeed for a trusted bot account.
    Protocol,
}

impl GerritErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, GerritErrorKind::Transient)
    }
}

/// A review-system API error with categorization for routing decisions.
#[derive(Debug, Clone, Error)]
pub struct GerritError {
    pub kind: GerritErrorKind,

    /// The HTTP status code, if the failure got that far.
    pub status_code: Option<u16>,

    pub message: String,
}

impl fmt::Display for GerritError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "review API error (HTTP {}): {}", code, self.message),
            None => write!(f, "review API error: {}", self.message),
        }
    }
}

impl GerritError {
    pub fn transient(message: impl Into<String>) -> Self {
        GerritError {
            kind: GerritErrorKind::Transient,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        GerritError {
            kind: GerritErrorKind::NotFound,
            status_code: Some(404),
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        GerritError {
            kind: GerritErrorKind::Rejected,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        GerritError {
            kind: GerritErrorKind::Protocol,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Categorizes an HTTP response status.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            404 => GerritErrorKind::NotFound,
            429 => GerritErrorKind::Transient,
            code if (500..600).contains(&code) => GerritErrorKind::Transient,
            400 | 403 | 409 | 412 | 422 => GerritErrorKind::Rejected,
            _ => GerritErrorKind::Protocol,
        };
        GerritError {
            kind,
            status_code: Some(code),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

pub type GerritResult<T> = Result<T, GerritError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_categorization() {
        assert_eq!(GerritError::from_status(503, "").kind, GerritErrorKind::Transient);
        assert_eq!(GerritError::from_status(429, "").kind, GerritErrorKind::Transient);
        assert_eq!(GerritError::from_status(404, "").kind, GerritErrorKind::NotFound);
        assert_eq!(GerritError::from_status(409, "").kind, GerritErrorKind::Rejected);
        assert_eq!(GerritError::from_status(422, "").kind, GerritErrorKind::Rejected);
        assert_eq!(GerritError::from_status(301, "").kind, GerritErrorKind::Protocol);
    }

    #[test]
    fn only_transient_is_retriable() {
        assert!(GerritError::transient("x").is_transient());
        assert!(!GerritError::not_found("x").is_transient());
        assert!(!GerritError::rejected("x").is_transient());
        assert!(!GerritError::protocol("x").is_transient());
    }
}
