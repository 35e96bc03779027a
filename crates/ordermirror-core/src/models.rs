// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order document model.
//!
//! The payload is kept as an opaque [`serde_json::Value`]; only `order_uid`
//! and `track_number` are read out of it.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::OrderError;

/// Wire field holding the order identifier.
pub const ORDER_UID_FIELD: &str = "order_uid";

/// Wire field holding the secondary index.
pub const TRACK_NUMBER_FIELD: &str = "track_number";

/// A validated order ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Primary key, never empty.
    pub order_uid: String,
    /// Secondary index; empty when the document has none.
    pub track_number: String,
    /// Full document, stored verbatim.
    pub payload: Value,
    /// Channel sequence the order arrived with, for diagnostics only.
    pub received_sequence: Option<u64>,
}

impl Order {
    /// Decode raw message bytes into a JSON object.
    ///
    /// Anything other than a JSON object is a decode failure.
    pub fn decode(data: &[u8], sequence: u64) -> Result<Map<String, Value>, OrderError> {
        match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(OrderError::DecodeError {
                sequence,
                details: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(OrderError::DecodeError {
                sequence,
                details: e.to_string(),
            }),
        }
    }

    /// Read just the `order_uid` out of raw message bytes.
    ///
    /// Returns `None` for anything [`Order::decode`] and
    /// [`Order::from_document`] would reject.
    pub fn peek_uid(data: &[u8]) -> Option<String> {
        match Self::decode(data, 0).ok()?.remove(ORDER_UID_FIELD)? {
            Value::String(uid) if !uid.is_empty() => Some(uid),
            _ => None,
        }
    }

    /// Validate a decoded document and build the order.
    pub fn from_document(
        document: Map<String, Value>,
        received_sequence: Option<u64>,
    ) -> Result<Self, OrderError> {
        let order_uid = match document.get(ORDER_UID_FIELD) {
            Some(Value::String(uid)) if !uid.is_empty() => uid.clone(),
            Some(Value::String(_)) => {
                return Err(OrderError::ValidationError {
                    field: ORDER_UID_FIELD.to_string(),
                    message: "must not be empty".to_string(),
                });
            }
            Some(other) => {
                return Err(OrderError::ValidationError {
                    field: ORDER_UID_FIELD.to_string(),
                    message: format!("must be a string, got {}", json_kind(other)),
                });
            }
            None => {
                return Err(OrderError::ValidationError {
                    field: ORDER_UID_FIELD.to_string(),
                    message: "missing".to_string(),
                });
            }
        };

        let track_number = document
            .get(TRACK_NUMBER_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            order_uid,
            track_number,
            payload: Value::Object(document),
            received_sequence,
        })
    }

    /// Serialized payload, as mirrored into the cache.
    pub fn to_json_bytes(&self) -> Result<Bytes, OrderError> {
        Ok(Bytes::from(serde_json::to_vec(&self.payload)?))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "order_uid": "b563feb7b2b84b6test",
            "track_number": "WBILMTESTTRACK",
            "entry": "WBIL",
            "delivery": {"name": "Test Testov", "city": "Kiryat Mozkin"},
            "payment": {"transaction": "b563feb7b2b84b6test", "amount": 1817},
            "items": [{"chrt_id": 9934930, "price": 453}],
            "sm_id": 99
        })
    }

    #[test]
    fn test_decode_and_validate() {
        let bytes = serde_json::to_vec(&sample()).unwrap();
        let doc = Order::decode(&bytes, 3).unwrap();
        let order = Order::from_document(doc, Some(3)).unwrap();

        assert_eq!(order.order_uid, "b563feb7b2b84b6test");
        assert_eq!(order.track_number, "WBILMTESTTRACK");
        assert_eq!(order.received_sequence, Some(3));
        assert_eq!(order.payload, sample());
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = Order::decode(b"not json at all", 9).unwrap_err();
        assert!(matches!(err, OrderError::DecodeError { sequence: 9, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let err = Order::decode(b"[1, 2, 3]", 1).unwrap_err();
        match err {
            OrderError::DecodeError { details, .. } => assert!(details.contains("array")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_order_uid_is_validation_error() {
        let doc = Order::decode(br#"{"track_number":"X"}"#, 1).unwrap();
        let err = Order::from_document(doc, Some(1)).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_empty_or_non_string_order_uid_rejected() {
        for body in [r#"{"order_uid":""}"#, r#"{"order_uid":42}"#, r#"{"order_uid":null}"#] {
            let doc = Order::decode(body.as_bytes(), 1).unwrap();
            assert!(
                matches!(
                    Order::from_document(doc, None),
                    Err(OrderError::ValidationError { .. })
                ),
                "{body} should fail validation"
            );
        }
    }

    #[test]
    fn test_peek_uid() {
        assert_eq!(
            Order::peek_uid(br#"{"track_number":"T","order_uid":"A1"}"#),
            Some("A1".to_string())
        );
        for body in [
            &br#"{"track_number":"T"}"#[..],
            br#"{"order_uid":""}"#,
            br#"{"order_uid":7}"#,
            br#"["A1"]"#,
            b"garbage",
        ] {
            assert_eq!(Order::peek_uid(body), None);
        }
    }

    #[test]
    fn test_track_number_defaults_to_empty() {
        let doc = Order::decode(br#"{"order_uid":"A1","track_number":17}"#, 1).unwrap();
        let order = Order::from_document(doc, None).unwrap();
        assert_eq!(order.track_number, "");
    }
}
