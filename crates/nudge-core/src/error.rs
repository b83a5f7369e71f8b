//! Error types for Nudge.

use thiserror::Error;

/// Main error type used across the workspace.
#[derive(Error, Debug)]
pub enum NudgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Eligibility oracle error: {0}")]
    Eligibility(String),

    #[error("Content error: {0}")]
    Content(String),

    /// An external call exceeded its bound.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// How a failure should be treated by the campaign loop.
///
/// Nothing is fatal: every class degrades to "try again next pass".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limiting, timeouts. Retried next pass, no state change.
    Transient,
    /// Recipient unreachable. Retried next pass, flagged in `last_error`.
    PermanentRecipient,
    /// Store or eligibility oracle unreachable.
    DependencyUnavailable,
}

impl NudgeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NudgeError::Timeout { .. } | NudgeError::Http(_) | NudgeError::Channel(_) => {
                ErrorClass::Transient
            }
            NudgeError::RecipientNotFound(_) => ErrorClass::PermanentRecipient,
            _ => ErrorClass::DependencyUnavailable,
        }
    }

    pub fn timeout(operation: &str, secs: u64) -> Self {
        NudgeError::Timeout {
            operation: operation.to_string(),
            secs,
        }
    }
}

pub type Result<T> = std::result::Result<T, NudgeError>;

/// Failure reported by a message transport for one send attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Transport signalled rate limiting.
    #[error("rate limited (retry after {retry_after_secs:.1}s)")]
    RateLimited { retry_after_secs: f64 },

    /// Recipient cannot be reached: blocked DMs, unknown user.
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    /// The transport refused the request itself (malformed send).
    #[error("send rejected: {0}")]
    Rejected(String),

    /// Transport is down or the request never completed.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl DeliveryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::RateLimited { .. } | DeliveryError::Unavailable(_) => {
                ErrorClass::Transient
            }
            DeliveryError::Unreachable(_) | DeliveryError::Rejected(_) => {
                ErrorClass::PermanentRecipient
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(NudgeError::timeout("load_all", 10).class(), ErrorClass::Transient);
        assert_eq!(
            NudgeError::Store("locked".into()).class(),
            ErrorClass::DependencyUnavailable
        );
        assert_eq!(
            NudgeError::RecipientNotFound("42".into()).class(),
            ErrorClass::PermanentRecipient
        );
    }

    #[test]
    fn test_delivery_error_classes() {
        let throttled = DeliveryError::RateLimited { retry_after_secs: 1.5 };
        assert_eq!(throttled.class(), ErrorClass::Transient);
        assert_eq!(
            DeliveryError::Unreachable("Cannot send messages to this user".into()).class(),
            ErrorClass::PermanentRecipient
        );
        assert!(throttled.to_string().contains("1.5"));
    }
}
