//! Wire schema for coordination traffic.
//!
//! Two message shapes flow through the broker: a `RequestEnvelope` per
//! specialist invocation and a `ResponseEnvelope` per completion. Both carry
//! the correlation id that ties one logical caller request to all of its
//! specialist responses. Payload `parameters`/`context`/`result` are opaque
//! JSON; this layer never inspects them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Shared topic every specialist publishes its responses to.
pub const RESPONSE_TOPIC: &str = "coordinator-responses";

/// Message attribute carrying the correlation id, for broker-side filtering.
pub const ATTR_CORRELATION_ID: &str = "correlation_id";
/// Message attribute carrying the request kind on request messages.
pub const ATTR_REQUEST_TYPE: &str = "request_type";
/// Message attribute carrying the producing specialist on response messages.
pub const ATTR_SPECIALIST_TYPE: &str = "specialist_type";

/// Identifies a specialist worker pool and its request topic.
///
/// Kept as an open string key rather than a closed enum: the set of
/// specialists belongs to the surrounding service, not to this layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecialistKind(String);

impl SpecialistKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic this kind's request messages are published to.
    pub fn request_topic(&self) -> String {
        format!("{}-requests", self.0)
    }
}

impl fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecialistKind {
    fn from(kind: &str) -> Self {
        Self(kind.to_string())
    }
}

/// Outcome of one specialist invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// One specialist invocation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    /// Shared across every envelope spawned from one logical caller request.
    /// Immutable from creation through final aggregation.
    pub correlation_id: String,
    /// Entity the request concerns. Opaque to this layer.
    pub subject_id: String,
    /// Specialist kind this envelope targets.
    pub request_type: SpecialistKind,
    /// Specialist-specific input. Never inspected here.
    pub parameters: Value,
    /// Supplementary data passed through to the specialist.
    #[serde(default = "empty_object")]
    pub context: Value,
    /// Diagnostics only, not used for correctness.
    pub created_at: DateTime<Utc>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl RequestEnvelope {
    /// Build an envelope under a fresh correlation id.
    pub fn new(
        subject_id: impl Into<String>,
        request_type: SpecialistKind,
        parameters: Value,
        context: Option<Value>,
    ) -> Self {
        Self::with_correlation_id(
            Uuid::new_v4().to_string(),
            subject_id,
            request_type,
            parameters,
            context,
        )
    }

    /// Build an envelope under a caller-supplied correlation id. Fan-out uses
    /// this so every sibling envelope shares one id.
    pub fn with_correlation_id(
        correlation_id: impl Into<String>,
        subject_id: impl Into<String>,
        request_type: SpecialistKind,
        parameters: Value,
        context: Option<Value>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            subject_id: subject_id.into(),
            request_type,
            parameters,
            context: context.unwrap_or_else(empty_object),
            created_at: Utc::now(),
        }
    }

    /// Validate transport contract before publishing.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        require_non_empty(&self.correlation_id, "correlation_id")?;
        require_non_empty(&self.subject_id, "subject_id")?;
        require_non_empty(self.request_type.as_str(), "request_type")?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        encode(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, EnvelopeError> {
        decode(payload)
    }
}

/// One specialist completion, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// Copied from the triggering request.
    pub correlation_id: String,
    /// Copied through unchanged.
    pub subject_id: String,
    /// Which specialist produced this response.
    pub specialist_type: SpecialistKind,
    /// Structured payload on success; absent on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub status: ResponseStatus,
    /// Present only when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Wall-clock seconds spent inside the specialist invoker.
    pub processing_duration: f64,
    pub produced_at: DateTime<Utc>,
}

impl ResponseEnvelope {
    pub fn success(request: &RequestEnvelope, result: Value, processing_duration: f64) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            subject_id: request.subject_id.clone(),
            specialist_type: request.request_type.clone(),
            result: Some(result),
            status: ResponseStatus::Success,
            error_detail: None,
            processing_duration,
            produced_at: Utc::now(),
        }
    }

    pub fn failure(
        request: &RequestEnvelope,
        error_detail: impl Into<String>,
        processing_duration: f64,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            subject_id: request.subject_id.clone(),
            specialist_type: request.request_type.clone(),
            result: None,
            status: ResponseStatus::Error,
            error_detail: Some(error_detail.into()),
            processing_duration,
            produced_at: Utc::now(),
        }
    }

    /// Validate success/error field coherence.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        require_non_empty(&self.correlation_id, "correlation_id")?;
        require_non_empty(self.specialist_type.as_str(), "specialist_type")?;
        match self.status {
            ResponseStatus::Success => {
                if self.result.is_none() {
                    return Err(EnvelopeError::ResultMissing {
                        correlation_id: self.correlation_id.clone(),
                    });
                }
            }
            ResponseStatus::Error => {
                if self
                    .error_detail
                    .as_deref()
                    .map(str::trim)
                    .filter(|detail| !detail.is_empty())
                    .is_none()
                {
                    return Err(EnvelopeError::ErrorDetailMissing {
                        correlation_id: self.correlation_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        encode(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, EnvelopeError> {
        decode(payload)
    }
}

fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(envelope).map_err(|error| EnvelopeError::Malformed {
        detail: error.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, EnvelopeError> {
    serde_json::from_slice(payload).map_err(|error| EnvelopeError::Malformed {
        detail: error.to_string(),
    })
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        return Err(EnvelopeError::EmptyField { field });
    }
    Ok(())
}

/// Schema-level errors for envelope construction and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },
    #[error("success response for `{correlation_id}` is missing `result`")]
    ResultMissing { correlation_id: String },
    #[error("error response for `{correlation_id}` is missing `error_detail`")]
    ErrorDetailMissing { correlation_id: String },
    #[error("malformed envelope: {detail}")]
    Malformed { detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_json_roundtrip_keeps_payload_shape() {
        let request = RequestEnvelope::with_correlation_id(
            "corr-1",
            "subject-9",
            SpecialistKind::from("dosage"),
            json!({"medication": "tacrolimus", "hours_late": 2.5}),
            Some(json!({"cohort": "kidney"})),
        );

        let encoded = request.to_bytes().expect("serialize request");
        let decoded = RequestEnvelope::from_bytes(&encoded).expect("deserialize request");
        assert_eq!(decoded, request);
        assert_eq!(decoded.request_type.request_topic(), "dosage-requests");
    }

    #[test]
    fn response_status_uses_snake_case_on_the_wire() {
        let request = RequestEnvelope::new(
            "subject-1",
            SpecialistKind::from("triage"),
            json!({}),
            None,
        );
        let response = ResponseEnvelope::success(&request, json!({"ok": true}), 0.25);

        let encoded = serde_json::to_value(&response).expect("serialize response");
        assert_eq!(encoded["status"], "success");
        assert_eq!(encoded["specialist_type"], "triage");
        assert!(encoded.get("error_detail").is_none());
    }

    #[test]
    fn blank_correlation_id_is_rejected() {
        let mut request = RequestEnvelope::new(
            "subject-1",
            SpecialistKind::from("triage"),
            json!({}),
            None,
        );
        request.correlation_id = "   ".to_string();

        let error = request.validate().expect_err("blank id must be rejected");
        assert_eq!(
            error,
            EnvelopeError::EmptyField {
                field: "correlation_id"
            }
        );
    }

    #[test]
    fn error_response_requires_detail() {
        let request = RequestEnvelope::new(
            "subject-1",
            SpecialistKind::from("triage"),
            json!({}),
            None,
        );
        let mut response = ResponseEnvelope::failure(&request, "boom", 0.0);
        response.error_detail = Some("  ".to_string());

        let error = response.validate().expect_err("blank detail must be rejected");
        assert_eq!(
            error,
            EnvelopeError::ErrorDetailMissing {
                correlation_id: request.correlation_id.clone(),
            }
        );
    }

    #[test]
    fn success_response_requires_result() {
        let request = RequestEnvelope::new(
            "subject-1",
            SpecialistKind::from("triage"),
            json!({}),
            None,
        );
        let mut response = ResponseEnvelope::success(&request, json!({}), 0.0);
        response.result = None;

        let error = response.validate().expect_err("missing result must be rejected");
        assert!(matches!(error, EnvelopeError::ResultMissing { .. }));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let error =
            ResponseEnvelope::from_bytes(b"{\"correlation_id\":").expect_err("must not decode");
        assert!(matches!(error, EnvelopeError::Malformed { .. }));
    }
}
