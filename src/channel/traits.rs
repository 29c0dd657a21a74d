use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One message handed to a consumer. Must be settled exactly once with
/// [`Delivery::ack`] or [`Delivery::nack`]; dropping it unsettled counts as a
/// nack, so a crashed handler never loses a message.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// 1-based delivery attempt. Anything above 1 is a redelivery.
    pub attempt: u32,
    outcome: oneshot::Sender<DeliveryOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Ack,
    Nack,
}

impl Delivery {
    pub(crate) fn new(
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
        attempt: u32,
        outcome: oneshot::Sender<DeliveryOutcome>,
    ) -> Self {
        Self {
            payload,
            attributes,
            attempt,
            outcome,
        }
    }

    /// Settle the message: the broker will not redeliver it.
    pub fn ack(self) {
        let _ = self.outcome.send(DeliveryOutcome::Ack);
    }

    /// Reject the message: the broker redelivers it per its retry policy.
    pub fn nack(self) {
        let _ = self.outcome.send(DeliveryOutcome::Nack);
    }
}

/// Handle for an active consumer. Cancelling stops delivery; messages already
/// handed out can still be settled.
#[derive(Debug, Clone)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Narrow interface onto a durable publish/subscribe broker with
/// at-least-once delivery. Implement for a managed queue service; the
/// in-memory implementation in [`crate::channel::memory`] backs tests and
/// local development.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publish a payload to a named topic. Resolves once the broker has
    /// acknowledged the message and returns the broker-assigned message id.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<String, ChannelError>;

    /// Start a long-running consumer on `topic`, delivering into `tx`.
    /// Delivery pauses while `tx` is full; the broker queues the backlog.
    async fn subscribe(
        &self,
        topic: &str,
        tx: mpsc::Sender<Delivery>,
    ) -> Result<Subscription, ChannelError>;
}

/// Errors surfaced by a [`MessageChannel`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unknown topic `{topic}`")]
    UnknownTopic { topic: String },
    #[error("broker rejected publish to `{topic}`: {reason}")]
    PublishRejected { topic: String, reason: String },
}
