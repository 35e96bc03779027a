// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ordermirror-core.
//!
//! A single error type shared by the store backends, the channel backends and
//! the ingestion pipeline. Whether an error is retried is decided by the
//! pipeline outcome, not by the error itself; [`OrderError::is_transient`] is
//! the hint it uses.

use std::time::Duration;

/// Errors raised while ingesting, storing or reading orders.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum OrderError {
    /// Message body could not be decoded as a JSON object.
    #[error("Failed to decode message (seq={sequence}): {details}")]
    DecodeError {
        /// Channel sequence of the offending delivery.
        sequence: u64,
        /// Decoder error details.
        details: String,
    },

    /// Decoded document failed validation.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A store call did not finish within its deadline.
    #[error("Store operation '{operation}' timed out after {}ms", .after.as_millis())]
    StoreTimeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// An order document could not be serialized.
    #[error("Serialization error: {details}")]
    SerializationError {
        /// Serializer error details.
        details: String,
    },

    /// Durable channel operation failed.
    #[error("Channel error during '{operation}': {details}")]
    ChannelError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl OrderError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DecodeError { .. } => "DECODE_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::StoreTimeout { .. } => "STORE_TIMEOUT",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
            Self::ChannelError { .. } => "CHANNEL_ERROR",
        }
    }

    /// Whether redelivering the same message may succeed.
    ///
    /// Validation and serialization failures never succeed on retry;
    /// everything else may.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::ValidationError { .. } | Self::SerializationError { .. }
        )
    }

    pub(crate) fn database(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }

    pub(crate) fn channel(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::ChannelError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for OrderError {
    fn from(err: sqlx::Error) -> Self {
        OrderError::database("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for OrderError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        OrderError::database("migrate", err)
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(err: serde_json::Error) -> Self {
        OrderError::SerializationError {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_error_codes() {
        let test_cases = vec![
            (
                OrderError::DecodeError {
                    sequence: 7,
                    details: "expected value at line 1 column 1".to_string(),
                },
                "DECODE_ERROR",
            ),
            (
                OrderError::ValidationError {
                    field: "order_uid".to_string(),
                    message: "missing".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                OrderError::DatabaseError {
                    operation: "upsert_order".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                OrderError::StoreTimeout {
                    operation: "upsert_order".to_string(),
                    after: Duration::from_secs(5),
                },
                "STORE_TIMEOUT",
            ),
            (
                OrderError::SerializationError {
                    details: "key must be a string".to_string(),
                },
                "SERIALIZATION_ERROR",
            ),
            (
                OrderError::ChannelError {
                    operation: "ack".to_string(),
                    details: "pool closed".to_string(),
                },
                "CHANNEL_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_order_error_display() {
        let err = OrderError::DecodeError {
            sequence: 42,
            details: "EOF while parsing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to decode message (seq=42): EOF while parsing"
        );

        let err = OrderError::StoreTimeout {
            operation: "upsert_order".to_string(),
            after: Duration::from_millis(5000),
        };
        assert_eq!(
            err.to_string(),
            "Store operation 'upsert_order' timed out after 5000ms"
        );

        let err = OrderError::DatabaseError {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            OrderError::DecodeError {
                sequence: 1,
                details: "x".to_string()
            }
            .is_transient()
        );
        assert!(
            OrderError::StoreTimeout {
                operation: "upsert_order".to_string(),
                after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(OrderError::database("upsert_order", "reset by peer").is_transient());
        assert!(
            !OrderError::ValidationError {
                field: "order_uid".to_string(),
                message: "must be a non-empty string".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let err: OrderError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
        assert!(!err.is_transient());
    }
}
