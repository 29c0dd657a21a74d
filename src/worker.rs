//! Per-kind consumer harness around an opaque specialist function.
//!
//! The harness is stateless aside from in-flight invocations, so any number
//! of workers of the same kind may run concurrently, across processes
//! included, without extra coordination.

use crate::channel::{ChannelError, Delivery, MessageChannel};
use crate::config::CoordinationConfig;
use crate::envelope::{
    RequestEnvelope, ResponseEnvelope, SpecialistKind, ATTR_CORRELATION_ID, ATTR_SPECIALIST_TYPE,
    RESPONSE_TOPIC,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Specialist failure, classified for the redelivery decision. The cause is
/// an opaque `anyhow::Error`; integrations wrap whatever their stack throws.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Worth retrying: the request is left unacked so the broker redelivers
    /// it, bounded by the broker's attempt limit.
    #[error("transient specialist failure: {cause:#}")]
    Transient { cause: anyhow::Error },
    /// Not worth retrying: surfaced to the aggregator as an error response
    /// so the fan-in count is still satisfied.
    #[error("permanent specialist failure: {cause:#}")]
    Permanent { cause: anyhow::Error },
}

impl InvokeError {
    pub fn transient(cause: impl std::fmt::Display) -> Self {
        Self::Transient {
            cause: anyhow::anyhow!("{cause}"),
        }
    }

    pub fn permanent(cause: impl std::fmt::Display) -> Self {
        Self::Permanent {
            cause: anyhow::anyhow!("{cause}"),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Pluggable domain reasoning. Possibly seconds-slow; treated as a black box
/// with nondeterministic latency and occasional failure. Implementations
/// classify their own errors into [`InvokeError`]; the cause itself stays an
/// opaque `anyhow::Error`.
#[async_trait]
pub trait SpecialistInvoker: Send + Sync {
    async fn invoke(&self, request: &RequestEnvelope) -> Result<Value, InvokeError>;
}

/// Consumes one specialist kind's request topic, invokes the specialist, and
/// publishes a correlated response for every request that reaches a verdict.
pub struct SpecialistWorker {
    kind: SpecialistKind,
    channel: Arc<dyn MessageChannel>,
    invoker: Arc<dyn SpecialistInvoker>,
    max_concurrent: usize,
}

impl SpecialistWorker {
    pub fn new(
        kind: SpecialistKind,
        channel: Arc<dyn MessageChannel>,
        invoker: Arc<dyn SpecialistInvoker>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            kind,
            channel,
            invoker,
            max_concurrent: config.max_concurrent_invocations.max(1),
        }
    }

    /// Consume until cancelled. In-flight invocations drain before return.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        let (tx, mut rx) = mpsc::channel(self.max_concurrent * 2);
        let subscription = self
            .channel
            .subscribe(&self.kind.request_topic(), tx)
            .await?;
        tracing::debug!(specialist = %self.kind, "worker consuming");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut invocations = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else { break };
                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let kind = self.kind.clone();
                    let channel = Arc::clone(&self.channel);
                    let invoker = Arc::clone(&self.invoker);
                    invocations.spawn(async move {
                        let _permit = permit;
                        process_delivery(&kind, channel.as_ref(), invoker.as_ref(), delivery).await;
                    });
                }
            }
        }

        subscription.cancel();
        while invocations.join_next().await.is_some() {}
        Ok(())
    }
}

async fn process_delivery(
    kind: &SpecialistKind,
    channel: &dyn MessageChannel,
    invoker: &dyn SpecialistInvoker,
    delivery: Delivery,
) {
    let request = match RequestEnvelope::from_bytes(&delivery.payload) {
        Ok(request) => request,
        Err(error) => {
            // Malformed messages are never retried; ack so the broker does
            // not redeliver garbage.
            tracing::warn!(
                specialist = %kind,
                error = %error,
                "dropping malformed request message"
            );
            delivery.ack();
            return;
        }
    };

    tracing::debug!(
        correlation_id = %request.correlation_id,
        specialist = %kind,
        attempt = delivery.attempt,
        "processing specialist request"
    );

    let started = Instant::now();
    let outcome = invoker.invoke(&request).await;
    let processing_duration = started.elapsed().as_secs_f64();

    let response = match outcome {
        Ok(result) => ResponseEnvelope::success(&request, result, processing_duration),
        Err(error) if error.is_transient() => {
            tracing::warn!(
                correlation_id = %request.correlation_id,
                specialist = %kind,
                error = %error,
                "transient failure, leaving request for redelivery"
            );
            delivery.nack();
            return;
        }
        Err(error) => {
            // A permanent error must still surface as one response, or the
            // aggregator waits on this kind forever.
            tracing::warn!(
                correlation_id = %request.correlation_id,
                specialist = %kind,
                error = %error,
                "permanent failure, publishing error response"
            );
            ResponseEnvelope::failure(&request, error.to_string(), processing_duration)
        }
    };

    match publish_response(channel, &response).await {
        Ok(message_id) => {
            tracing::debug!(
                correlation_id = %response.correlation_id,
                specialist = %kind,
                message_id = %message_id,
                processing_duration,
                "published specialist response"
            );
            delivery.ack();
        }
        Err(error) => {
            // Retry the whole unit of work: the invocation reruns together
            // with the response publish on redelivery.
            tracing::warn!(
                correlation_id = %response.correlation_id,
                specialist = %kind,
                error = %error,
                "response publish failed, leaving request for redelivery"
            );
            delivery.nack();
        }
    }
}

async fn publish_response(
    channel: &dyn MessageChannel,
    response: &ResponseEnvelope,
) -> Result<String, ChannelError> {
    let payload = response.to_bytes().map_err(|error| {
        ChannelError::PublishRejected {
            topic: RESPONSE_TOPIC.to_string(),
            reason: error.to_string(),
        }
    })?;
    let attributes = HashMap::from([
        (
            ATTR_CORRELATION_ID.to_string(),
            response.correlation_id.clone(),
        ),
        (
            ATTR_SPECIALIST_TYPE.to_string(),
            response.specialist_type.as_str().to_string(),
        ),
    ]);
    channel.publish(RESPONSE_TOPIC, payload, attributes).await
}
