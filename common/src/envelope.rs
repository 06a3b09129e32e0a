use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Diagnostic sent when no handler answers a method
pub const NO_LISTENER_MESSAGE: &str = "No listener for method";
/// Diagnostic sent when a request frame cannot be decrypted or parsed
pub const UNDECODABLE_REQUEST_MESSAGE: &str = "Could not decode request";
/// Prefix of the diagnostic sent for structurally invalid requests
pub const MALFORMED_REQUEST_PREFIX: &str = "Malformed request";
/// Diagnostic delivered to callers whose response frame was unreadable
pub const UNDECODABLE_ANSWER_MESSAGE: &str = "Could not decode answer";
/// Diagnostic delivered to callers whose deadline passed
pub const TIMEOUT_MESSAGE: &str = "Call timed out";

/// A call to a remote method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name looked up in the peer's listener registry
    pub method: String,
    /// Arbitrary JSON payload
    pub data:   Value,
}

impl Request {
    /// Creates a request envelope
    pub fn new<M: Into<String>>(method: M, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    /// Validates a decoded JSON value: `method` must be a string and `data`
    /// must be present (any JSON, including `null`).
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut map = into_object(value)?;
        let method = match map.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(DecodeError::MissingKey("method")),
        };
        let data = map.remove("data").ok_or(DecodeError::MissingKey("data"))?;
        Ok(Self { method, data })
    }
}

/// The reply to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Whether the call failed
    pub error: bool,
    /// Result payload, or a diagnostic string when `error` is set
    pub data:  Value,
}

impl Answer {
    /// Successful answer carrying `data`
    pub fn ok<V: Into<Value>>(data: V) -> Self {
        Self {
            error: false,
            data:  data.into(),
        }
    }

    /// Failed answer carrying a diagnostic message
    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            error: true,
            data:  Value::String(message.into()),
        }
    }

    /// The fixed answer for methods nobody handles
    pub fn no_listener() -> Self {
        Self::error(NO_LISTENER_MESSAGE)
    }

    /// Whether this answer reports a failure
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Diagnostic text when this is an error answer
    pub fn message(&self) -> Option<&str> {
        if self.error {
            self.data.as_str()
        } else {
            None
        }
    }

    /// Validates a decoded JSON value: `error` must be a bool and `data` must
    /// be present.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut map = into_object(value)?;
        let error = match map.remove("error") {
            Some(Value::Bool(error)) => error,
            _ => return Err(DecodeError::MissingKey("error")),
        };
        let data = map.remove("data").ok_or(DecodeError::MissingKey("data"))?;
        Ok(Self { error, data })
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, DecodeError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_requires_method_and_data() {
        assert!(Request::from_value(json!({ "method": "Ping", "data": null })).is_ok());
        assert!(matches!(
            Request::from_value(json!({ "data": 1 })),
            Err(DecodeError::MissingKey("method"))
        ));
        assert!(matches!(
            Request::from_value(json!({ "method": 7, "data": 1 })),
            Err(DecodeError::MissingKey("method"))
        ));
        assert!(matches!(
            Request::from_value(json!({ "method": "Ping" })),
            Err(DecodeError::MissingKey("data"))
        ));
        assert!(matches!(
            Request::from_value(json!(["Ping"])),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn answer_requires_boolean_error() {
        let answer = Answer::from_value(json!({ "error": false, "data": { "n": 2 } })).unwrap();
        assert_eq!(answer, Answer::ok(json!({ "n": 2 })));
        assert!(Answer::from_value(json!({ "error": "no", "data": 1 })).is_err());
        assert!(Answer::from_value(json!({ "error": true })).is_err());
    }

    #[test]
    fn error_answer_exposes_message() {
        let answer = Answer::no_listener();
        assert!(answer.is_error());
        assert_eq!(answer.message(), Some(NO_LISTENER_MESSAGE));
        assert_eq!(Answer::ok("fine").message(), None);
    }

    #[test]
    fn answer_serializes_with_wire_keys() {
        let value = serde_json::to_value(Answer::error("boom")).unwrap();
        assert_eq!(value, json!({ "error": true, "data": "boom" }));
    }
}
