//! Domain error types.

use thiserror::Error;

/// Top-level error type shared by the journal, the aggregate runtime and the
/// distribution layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A command is missing a required field. Raised before any journal access.
    #[error("validation error: {0}")]
    Validation(String),

    /// Optimistic concurrency conflict: an entry already occupies the
    /// expected position of the stream.
    #[error("Conflicting sequence number for {event_type}: {stream}, expected {expected}")]
    Conflict {
        /// Type of the event whose conditional write failed.
        event_type: String,
        /// The stream the commit targeted.
        stream: String,
        /// The sequence number the event was meant to occupy.
        expected: u64,
    },

    /// No handler or aggregate is registered for a command.
    #[error("routing error: {0}")]
    Routing(String),

    /// A journal read or write failed for a reason other than the conditional
    /// check.
    #[error("backend error: {0}")]
    Backend(String),

    /// The caller is not allowed to subscribe to a stream.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The runtime was wired up incorrectly, or an operation is disabled in
    /// this environment.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DomainError {
    /// Machine-readable error code sent to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::Routing(_) => "routing_error",
            Self::Backend(_) => "backend_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Returns `true` for stale-sequence rejections, which a caller may retry
    /// after replaying the stream again.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_type_stream_and_sequence() {
        let err = DomainError::Conflict {
            event_type: "TestEvent".to_owned(),
            stream: "stream:1".to_owned(),
            expected: 1,
        };

        assert_eq!(
            err.to_string(),
            "Conflicting sequence number for TestEvent: stream:1, expected 1"
        );
        assert!(err.is_conflict());
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            DomainError::Validation(String::new()).code(),
            DomainError::Routing(String::new()).code(),
            DomainError::Backend(String::new()).code(),
            DomainError::Unauthorized(String::new()).code(),
            DomainError::Configuration(String::new()).code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
