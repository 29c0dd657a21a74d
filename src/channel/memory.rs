//! In-memory message channel with at-least-once delivery.
//!
//! Topic fan-out broker backing tests and local development, standing in for
//! the managed queue service a deployment would use. Redelivery semantics
//! match what the coordination core assumes from a real broker: a nacked or
//! unsettled delivery is retried up to the configured attempt limit, then
//! retained as a dead letter.

use super::traits::{
    ChannelError, Delivery, DeliveryOutcome, MessageChannel, Subscription,
};
use crate::config::CoordinationConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Redelivery policy applied to every delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// An unsettled delivery is considered lost and retried after this long.
    pub ack_deadline: Duration,
    /// Attempts per subscriber before the message is dead-lettered.
    pub max_attempts: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl From<&CoordinationConfig> for DeliveryPolicy {
    fn from(config: &CoordinationConfig) -> Self {
        Self {
            ack_deadline: config.ack_deadline(),
            max_attempts: config.max_attempts,
        }
    }
}

/// Capacity limits used by [`InMemoryChannel`] retention policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InMemoryChannelLimits {
    pub max_dead_letters: usize,
}

impl Default for InMemoryChannelLimits {
    fn default() -> Self {
        Self {
            max_dead_letters: 256,
        }
    }
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InMemoryChannelStats {
    /// Publishes accepted onto a known topic.
    pub publishes_total: u64,
    /// Deliveries handed to a subscriber, redeliveries included.
    pub deliveries_total: u64,
    pub acked_total: u64,
    /// Explicit nacks plus deliveries dropped unsettled.
    pub nacked_total: u64,
    /// Deliveries that sat past the ack deadline.
    pub ack_timeouts_total: u64,
    pub redeliveries_total: u64,
    /// Messages retained after exhausting their attempt limit.
    pub dead_letters_total: u64,
    pub dead_letter_evictions_total: u64,
}

/// Message retained after exhausting delivery attempts.
#[derive(Debug, Clone)]
pub struct ChannelDeadLetter {
    pub topic: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub reason: String,
}

#[derive(Clone)]
struct SubscriberHandle {
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<SubscriberHandle>,
}

struct ChannelState {
    topics: HashMap<String, TopicState>,
    dead_letters: Vec<ChannelDeadLetter>,
    limits: InMemoryChannelLimits,
    stats: InMemoryChannelStats,
}

impl ChannelState {
    fn with_limits(mut limits: InMemoryChannelLimits) -> Self {
        if limits.max_dead_letters == 0 {
            limits.max_dead_letters = 1;
        }
        Self {
            topics: HashMap::new(),
            dead_letters: Vec::new(),
            limits,
            stats: InMemoryChannelStats::default(),
        }
    }
}

/// Deterministic in-memory broker with:
/// - named topics, created explicitly or on first subscribe
/// - per-subscriber at-least-once delivery with ack-deadline redelivery
/// - dead-letter retention for messages that exhaust their attempts
#[derive(Clone)]
pub struct InMemoryChannel {
    inner: Arc<Mutex<ChannelState>>,
    policy: DeliveryPolicy,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::with_policy(DeliveryPolicy::default())
    }

    pub fn with_policy(policy: DeliveryPolicy) -> Self {
        Self::with_policy_and_limits(policy, InMemoryChannelLimits::default())
    }

    pub fn with_policy_and_limits(policy: DeliveryPolicy, limits: InMemoryChannelLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelState::with_limits(limits))),
            policy,
        }
    }

    /// Create a topic ahead of any subscriber, so publishes to it are
    /// accepted rather than rejected as unknown. Idempotent.
    pub fn create_topic(&self, topic: impl Into<String>) {
        let mut state = self.lock_state();
        state.topics.entry(topic.into()).or_default();
    }

    /// Snapshot of known topic names.
    pub fn topics(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut topics = state.topics.keys().cloned().collect::<Vec<_>>();
        topics.sort();
        topics
    }

    pub fn stats(&self) -> InMemoryChannelStats {
        self.lock_state().stats
    }

    pub fn dead_letters(&self) -> Vec<ChannelDeadLetter> {
        self.lock_state().dead_letters.clone()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.lock_state().dead_letters.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<String, ChannelError> {
        let subscribers = {
            let mut state = self.lock_state();
            let topic_state =
                state
                    .topics
                    .get_mut(topic)
                    .ok_or_else(|| ChannelError::UnknownTopic {
                        topic: topic.to_string(),
                    })?;
            topic_state
                .subscribers
                .retain(|subscriber| !subscriber.token.is_cancelled() && !subscriber.tx.is_closed());
            state.stats.publishes_total += 1;
            state
                .topics
                .get(topic)
                .map(|topic_state| topic_state.subscribers.clone())
                .unwrap_or_default()
        };

        let message_id = Uuid::new_v4().to_string();
        for subscriber in subscribers {
            tokio::spawn(deliver_with_retry(
                Arc::clone(&self.inner),
                self.policy,
                topic.to_string(),
                payload.clone(),
                attributes.clone(),
                subscriber,
            ));
        }
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        tx: mpsc::Sender<Delivery>,
    ) -> Result<Subscription, ChannelError> {
        let token = CancellationToken::new();
        let mut state = self.lock_state();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(SubscriberHandle {
                tx,
                token: token.clone(),
            });
        Ok(Subscription::new(token))
    }
}

enum Settled {
    Ack,
    Nack,
    Timeout,
}

async fn deliver_with_retry(
    inner: Arc<Mutex<ChannelState>>,
    policy: DeliveryPolicy,
    topic: String,
    payload: Vec<u8>,
    attributes: HashMap<String, String>,
    subscriber: SubscriberHandle,
) {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if subscriber.token.is_cancelled() {
            return;
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let delivery = Delivery::new(payload.clone(), attributes.clone(), attempt, outcome_tx);
        tokio::select! {
            () = subscriber.token.cancelled() => return,
            sent = subscriber.tx.send(delivery) => {
                if sent.is_err() {
                    // Consumer side is gone; nothing left to deliver to.
                    return;
                }
            }
        }
        bump_stats(&inner, |stats| stats.deliveries_total += 1);

        let settled = tokio::select! {
            outcome = outcome_rx => match outcome {
                Ok(DeliveryOutcome::Ack) => Settled::Ack,
                // Dropped unsettled counts as a nack.
                Ok(DeliveryOutcome::Nack) | Err(_) => Settled::Nack,
            },
            () = tokio::time::sleep(policy.ack_deadline) => Settled::Timeout,
        };

        match settled {
            Settled::Ack => {
                bump_stats(&inner, |stats| stats.acked_total += 1);
                return;
            }
            Settled::Nack => bump_stats(&inner, |stats| stats.nacked_total += 1),
            Settled::Timeout => bump_stats(&inner, |stats| stats.ack_timeouts_total += 1),
        }

        if attempt < max_attempts {
            bump_stats(&inner, |stats| stats.redeliveries_total += 1);
        }
    }

    tracing::warn!(
        topic = %topic,
        attempts = max_attempts,
        "message exhausted delivery attempts, dead-lettering"
    );
    push_dead_letter(
        &inner,
        ChannelDeadLetter {
            topic,
            payload,
            attributes,
            reason: format!("exhausted {max_attempts} delivery attempts"),
        },
    );
}

fn bump_stats(inner: &Arc<Mutex<ChannelState>>, bump: impl FnOnce(&mut InMemoryChannelStats)) {
    let mut state = inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    bump(&mut state.stats);
}

fn push_dead_letter(inner: &Arc<Mutex<ChannelState>>, dead_letter: ChannelDeadLetter) {
    let mut state = inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    state.stats.dead_letters_total += 1;
    if state.dead_letters.len() >= state.limits.max_dead_letters {
        state.stats.dead_letter_evictions_total += 1;
        let _ = state.dead_letters.remove(0);
    }
    state.dead_letters.push(dead_letter);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> DeliveryPolicy {
        DeliveryPolicy {
            ack_deadline: Duration::from_millis(50),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_rejected() {
        let channel = InMemoryChannel::new();
        let error = channel
            .publish("nowhere", b"x".to_vec(), HashMap::new())
            .await
            .expect_err("unknown topic must be rejected");
        assert_eq!(
            error,
            ChannelError::UnknownTopic {
                topic: "nowhere".to_string()
            }
        );
    }

    #[tokio::test]
    async fn acked_delivery_is_not_redelivered() {
        let channel = InMemoryChannel::with_policy(fast_policy(3));
        let (tx, mut rx) = mpsc::channel(4);
        channel
            .subscribe("jobs", tx)
            .await
            .expect("subscribe jobs");

        channel
            .publish("jobs", b"payload".to_vec(), HashMap::new())
            .await
            .expect("publish");

        let delivery = rx.recv().await.expect("first delivery");
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.payload, b"payload");
        delivery.ack();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err(), "no redelivery after ack");

        let stats = channel.stats();
        assert_eq!(stats.acked_total, 1);
        assert_eq!(stats.redeliveries_total, 0);
    }

    #[tokio::test]
    async fn nacked_delivery_is_redelivered_with_bumped_attempt() {
        let channel = InMemoryChannel::with_policy(fast_policy(3));
        let (tx, mut rx) = mpsc::channel(4);
        channel.subscribe("jobs", tx).await.expect("subscribe");

        channel
            .publish("jobs", b"retry-me".to_vec(), HashMap::new())
            .await
            .expect("publish");

        let first = rx.recv().await.expect("first delivery");
        assert_eq!(first.attempt, 1);
        first.nack();

        let second = rx.recv().await.expect("redelivery");
        assert_eq!(second.attempt, 2);
        second.ack();

        // Let the delivery task observe the ack before reading stats.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = channel.stats();
        assert_eq!(stats.nacked_total, 1);
        assert_eq!(stats.redeliveries_total, 1);
        assert_eq!(stats.acked_total, 1);
    }

    #[tokio::test]
    async fn dropped_delivery_counts_as_nack() {
        let channel = InMemoryChannel::with_policy(fast_policy(2));
        let (tx, mut rx) = mpsc::channel(4);
        channel.subscribe("jobs", tx).await.expect("subscribe");

        channel
            .publish("jobs", b"crash".to_vec(), HashMap::new())
            .await
            .expect("publish");

        drop(rx.recv().await.expect("first delivery"));
        let second = rx.recv().await.expect("redelivery after drop");
        assert_eq!(second.attempt, 2);
        second.ack();

        assert_eq!(channel.stats().nacked_total, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_dead_lettered() {
        let channel = InMemoryChannel::with_policy(fast_policy(2));
        let (tx, mut rx) = mpsc::channel(4);
        channel.subscribe("jobs", tx).await.expect("subscribe");

        channel
            .publish(
                "jobs",
                b"poison".to_vec(),
                HashMap::from([("k".to_string(), "v".to_string())]),
            )
            .await
            .expect("publish");

        rx.recv().await.expect("attempt 1").nack();
        rx.recv().await.expect("attempt 2").nack();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let dead_letters = channel.dead_letters();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].topic, "jobs");
        assert_eq!(dead_letters[0].payload, b"poison");
        assert!(dead_letters[0].reason.contains("2 delivery attempts"));
        assert_eq!(channel.stats().dead_letters_total, 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_delivery() {
        let channel = InMemoryChannel::with_policy(fast_policy(3));
        let (tx, mut rx) = mpsc::channel(4);
        let subscription = channel.subscribe("jobs", tx).await.expect("subscribe");
        subscription.cancel();

        channel
            .publish("jobs", b"late".to_vec(), HashMap::new())
            .await
            .expect("publish still accepted");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "cancelled subscriber gets nothing");
    }

    #[tokio::test]
    async fn dead_letter_cap_evicts_oldest() {
        let channel = InMemoryChannel::with_policy_and_limits(
            fast_policy(1),
            InMemoryChannelLimits {
                max_dead_letters: 1,
            },
        );
        let (tx, mut rx) = mpsc::channel(4);
        channel.subscribe("jobs", tx).await.expect("subscribe");

        for payload in [b"first".to_vec(), b"second".to_vec()] {
            channel
                .publish("jobs", payload, HashMap::new())
                .await
                .expect("publish");
            rx.recv().await.expect("delivery").nack();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let dead_letters = channel.dead_letters();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].payload, b"second");
        assert_eq!(channel.stats().dead_letter_evictions_total, 1);
    }
}
