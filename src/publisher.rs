//! Fans caller requests out to specialist request topics.

use crate::channel::{ChannelError, MessageChannel};
use crate::envelope::{
    EnvelopeError, RequestEnvelope, SpecialistKind, ATTR_CORRELATION_ID, ATTR_REQUEST_TYPE,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously to the publishing caller, per request kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("invalid request envelope: {source}")]
    Envelope {
        #[from]
        source: EnvelopeError,
    },
    #[error("broker publish failed: {source}")]
    Channel {
        #[from]
        source: ChannelError,
    },
}

/// Result of a fan-out publish. Partial failure is expected operation, not an
/// error: the caller must register `published_count()`, never the requested
/// count, with the aggregator, or it will wait out the full timeout for
/// envelopes that were never sent.
#[derive(Debug)]
pub struct FanOut {
    /// Correlation id shared by every envelope of this fan-out.
    pub correlation_id: String,
    /// Kinds whose request message the broker acknowledged.
    pub published: Vec<SpecialistKind>,
    /// Kinds whose publish failed, with the per-kind cause.
    pub failures: Vec<(SpecialistKind, PublishError)>,
}

impl FanOut {
    /// Number of responses the aggregator should expect.
    pub fn published_count(&self) -> usize {
        self.published.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builds and dispatches correlated request messages to specialist topics.
/// Returns once the broker acknowledges the publish; never waits for any
/// specialist to run.
pub struct RequestPublisher {
    channel: Arc<dyn MessageChannel>,
}

impl RequestPublisher {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    /// Publish a single specialist request under a fresh correlation id.
    pub async fn publish(
        &self,
        subject_id: &str,
        request_type: SpecialistKind,
        parameters: Value,
        context: Option<Value>,
    ) -> Result<String, PublishError> {
        let envelope = RequestEnvelope::new(subject_id, request_type, parameters, context);
        let correlation_id = envelope.correlation_id.clone();
        self.publish_envelope(envelope).await?;
        Ok(correlation_id)
    }

    /// Publish one request per kind, all sharing a fresh correlation id.
    /// Kinds missing from `parameters_by_kind` are sent with empty parameters.
    pub async fn publish_fan_out(
        &self,
        subject_id: &str,
        request_types: &[SpecialistKind],
        parameters_by_kind: HashMap<SpecialistKind, Value>,
        context: Option<Value>,
    ) -> FanOut {
        self.publish_fan_out_with_correlation_id(
            Uuid::new_v4().to_string(),
            subject_id,
            request_types,
            parameters_by_kind,
            context,
        )
        .await
    }

    /// Fan out under a caller-supplied correlation id, so a retry of failed
    /// kinds can join the envelopes already in flight.
    pub async fn publish_fan_out_with_correlation_id(
        &self,
        correlation_id: String,
        subject_id: &str,
        request_types: &[SpecialistKind],
        mut parameters_by_kind: HashMap<SpecialistKind, Value>,
        context: Option<Value>,
    ) -> FanOut {
        let mut published = Vec::with_capacity(request_types.len());
        let mut failures = Vec::new();

        for request_type in request_types {
            let parameters = parameters_by_kind
                .remove(request_type)
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            let envelope = RequestEnvelope::with_correlation_id(
                correlation_id.clone(),
                subject_id,
                request_type.clone(),
                parameters,
                context.clone(),
            );
            match self.publish_envelope(envelope).await {
                Ok(()) => published.push(request_type.clone()),
                Err(error) => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        request_type = %request_type,
                        error = %error,
                        "fan-out publish failed for request type"
                    );
                    failures.push((request_type.clone(), error));
                }
            }
        }

        FanOut {
            correlation_id,
            published,
            failures,
        }
    }

    async fn publish_envelope(&self, envelope: RequestEnvelope) -> Result<(), PublishError> {
        envelope.validate()?;
        let payload = envelope.to_bytes()?;
        let attributes = HashMap::from([
            (
                ATTR_CORRELATION_ID.to_string(),
                envelope.correlation_id.clone(),
            ),
            (
                ATTR_REQUEST_TYPE.to_string(),
                envelope.request_type.as_str().to_string(),
            ),
        ]);

        let message_id = self
            .channel
            .publish(&envelope.request_type.request_topic(), payload, attributes)
            .await?;
        tracing::debug!(
            correlation_id = %envelope.correlation_id,
            request_type = %envelope.request_type,
            message_id = %message_id,
            "published specialist request"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn channel_with_topics(topics: &[&str]) -> Arc<InMemoryChannel> {
        let channel = InMemoryChannel::new();
        for topic in topics {
            channel.create_topic(*topic);
        }
        Arc::new(channel)
    }

    #[tokio::test]
    async fn publish_carries_correlation_attributes() {
        let channel = channel_with_topics(&["triage-requests"]);
        let (tx, mut rx) = mpsc::channel(4);
        channel
            .subscribe("triage-requests", tx)
            .await
            .expect("subscribe");

        let publisher = RequestPublisher::new(channel);
        let correlation_id = publisher
            .publish("subject-1", SpecialistKind::from("triage"), json!({}), None)
            .await
            .expect("publish");

        let delivery = rx.recv().await.expect("request delivered");
        assert_eq!(
            delivery.attributes.get(ATTR_CORRELATION_ID),
            Some(&correlation_id)
        );
        assert_eq!(
            delivery.attributes.get(ATTR_REQUEST_TYPE),
            Some(&"triage".to_string())
        );
        let decoded = RequestEnvelope::from_bytes(&delivery.payload).expect("decode");
        assert_eq!(decoded.correlation_id, correlation_id);
        delivery.ack();
    }

    #[tokio::test]
    async fn fan_out_shares_one_correlation_id() {
        let channel = channel_with_topics(&["alpha-requests", "beta-requests"]);
        let (alpha_tx, mut alpha_rx) = mpsc::channel(4);
        let (beta_tx, mut beta_rx) = mpsc::channel(4);
        channel
            .subscribe("alpha-requests", alpha_tx)
            .await
            .expect("subscribe alpha");
        channel
            .subscribe("beta-requests", beta_tx)
            .await
            .expect("subscribe beta");

        let publisher = RequestPublisher::new(channel);
        let kinds = [SpecialistKind::from("alpha"), SpecialistKind::from("beta")];
        let fan_out = publisher
            .publish_fan_out(
                "subject-7",
                &kinds,
                HashMap::from([(SpecialistKind::from("alpha"), json!({"n": 1}))]),
                Some(json!({"shared": true})),
            )
            .await;

        assert!(fan_out.is_complete());
        assert_eq!(fan_out.published_count(), 2);

        let alpha = RequestEnvelope::from_bytes(
            &alpha_rx.recv().await.expect("alpha delivery").payload,
        )
        .expect("decode alpha");
        let beta =
            RequestEnvelope::from_bytes(&beta_rx.recv().await.expect("beta delivery").payload)
                .expect("decode beta");

        assert_eq!(alpha.correlation_id, fan_out.correlation_id);
        assert_eq!(beta.correlation_id, fan_out.correlation_id);
        assert_eq!(alpha.parameters, json!({"n": 1}));
        // Kind without explicit parameters is sent with an empty object.
        assert_eq!(beta.parameters, json!({}));
        assert_eq!(beta.context, json!({"shared": true}));
    }

    #[tokio::test]
    async fn fan_out_reports_per_kind_failures() {
        // Only alpha's topic exists; beta's publish is rejected by the broker.
        let channel = channel_with_topics(&["alpha-requests"]);
        let publisher = RequestPublisher::new(channel);

        let kinds = [SpecialistKind::from("alpha"), SpecialistKind::from("beta")];
        let fan_out = publisher
            .publish_fan_out("subject-7", &kinds, HashMap::new(), None)
            .await;

        assert!(!fan_out.is_complete());
        assert_eq!(fan_out.published_count(), 1);
        assert_eq!(fan_out.published, vec![SpecialistKind::from("alpha")]);
        assert_eq!(fan_out.failures.len(), 1);
        let (failed_kind, error) = &fan_out.failures[0];
        assert_eq!(failed_kind, &SpecialistKind::from("beta"));
        assert_eq!(
            error,
            &PublishError::Channel {
                source: ChannelError::UnknownTopic {
                    topic: "beta-requests".to_string()
                }
            }
        );
    }

    #[tokio::test]
    async fn blank_subject_is_rejected_before_the_broker_sees_it() {
        let channel = channel_with_topics(&["triage-requests"]);
        let publisher = RequestPublisher::new(Arc::clone(&channel) as Arc<dyn MessageChannel>);

        let error = publisher
            .publish("  ", SpecialistKind::from("triage"), json!({}), None)
            .await
            .expect_err("blank subject must be rejected");
        assert!(matches!(error, PublishError::Envelope { .. }));
        assert_eq!(channel.stats().publishes_total, 0);
    }
}
