//! Framework-level HTTP error type.
//!
//! Every component that can fail a request surfaces its failure as an
//! [`HttpError`]: a status code plus a human-readable message, optionally
//! extended with a field-keyed detail map (used by the schema layer to
//! report per-field validation problems). The response layer serializes
//! the error straight into the HTTP response body.

use std::collections::BTreeMap;

use serde::Serialize;

/// Status code used when none is given.
pub const DEFAULT_STATUS_CODE: u16 = 500;

/// A structured error that maps directly onto an HTTP response.
///
/// Callers branch on [`status_code`](Self::status_code) or on the error
/// kind of the component that produced it; this type is only the transport
/// towards the response layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpError {
    status_code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<BTreeMap<String, String>>,
}

impl HttpError {
    /// Create an error with an explicit status code.
    #[must_use]
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            status_code,
            message: message.into(),
            fields: None,
        }
    }

    /// Create a 500 error from a bare message.
    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(message, DEFAULT_STATUS_CODE)
    }

    /// Attach a field-keyed detail map.
    #[must_use]
    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// The HTTP status code this error should be rendered with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The human-readable detail message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Per-field details, if any.
    #[must_use]
    pub fn fields(&self) -> Option<&BTreeMap<String, String>> {
        self.fields.as_ref()
    }

    /// Serialize into the JSON payload sent to the client.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "status_code": self.status_code,
                "message": self.message,
            })
        })
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status_code)
    }
}

impl std::error::Error for HttpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_status_and_message() {
        let err = HttpError::new("Missing boundary in Content-Type header", 400);
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.message(), "Missing boundary in Content-Type header");
        assert!(err.fields().is_none());
    }

    #[test]
    fn test_server_error_defaults_to_500() {
        let err = HttpError::server_error("something went wrong");
        assert_eq!(err.status_code(), DEFAULT_STATUS_CODE);
    }

    #[test]
    fn test_with_fields_round_trips_through_json() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "required".to_string());
        let err = HttpError::new("validation failed", 400).with_fields(fields);

        let json = err.to_json();
        assert_eq!(json["status_code"], 400);
        assert_eq!(json["message"], "validation failed");
        assert_eq!(json["fields"]["name"], "required");
    }

    #[test]
    fn test_json_omits_fields_when_absent() {
        let json = HttpError::new("oops", 400).to_json();
        assert!(json.get("fields").is_none());
    }

    #[test]
    fn test_display_includes_status() {
        let err = HttpError::new("Request entity too large", 413);
        assert_eq!(err.to_string(), "Request entity too large (413)");
    }
}
