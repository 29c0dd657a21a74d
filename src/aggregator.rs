//! Fan-in side: collects correlated specialist responses and releases
//! waiters.
//!
//! One long-lived consumer drains the shared response topic into a
//! per-correlation state map. A waiter registers an expected response count
//! and blocks until the count is met or its deadline passes, then receives
//! whatever subset arrived. Arrival order is irrelevant by construction: the
//! merge is a keyed overwrite, which also makes at-least-once redelivery of
//! the same response idempotent.

use crate::channel::{ChannelError, Delivery, MessageChannel, Subscription};
use crate::config::CoordinationConfig;
use crate::envelope::{ResponseEnvelope, SpecialistKind, RESPONSE_TOPIC};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a waiter gets back: every response that arrived in time, keyed by
/// specialist, plus whether the expected count was met. A timeout is not an
/// error; presentation of partial results is the caller's call.
#[derive(Debug)]
pub struct AggregationOutcome {
    pub responses: HashMap<SpecialistKind, ResponseEnvelope>,
    pub complete: bool,
    pub elapsed: Duration,
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AggregatorStats {
    /// Response messages consumed from the response topic.
    pub responses_received_total: u64,
    /// Keyed overwrites of an already-present specialist entry.
    pub duplicate_responses_total: u64,
    /// Responses for an already-resolved correlation id, discarded.
    pub late_responses_total: u64,
    /// Undecodable or contract-violating response messages, dropped.
    pub malformed_total: u64,
    /// Responses buffered ahead of their waiter's registration.
    pub early_buffered_total: u64,
    /// Early-buffer entries that aged out unclaimed.
    pub early_expired_total: u64,
    /// Early-buffer entries evicted for capacity.
    pub early_evictions_total: u64,
    pub waits_registered_total: u64,
    pub completed_total: u64,
    pub timed_out_total: u64,
    /// Waits whose caller went away before the deadline.
    pub abandoned_total: u64,
    /// Resolved entries evicted after their retention period.
    pub entries_evicted_total: u64,
}

struct AggregationEntry {
    expected_count: usize,
    received: HashMap<SpecialistKind, ResponseEnvelope>,
    deadline: Instant,
    notify: Option<oneshot::Sender<()>>,
    resolved: bool,
    complete: bool,
    resolved_at: Option<Instant>,
}

impl AggregationEntry {
    fn resolved_tombstone(expected_count: usize, deadline: Instant) -> Self {
        Self {
            expected_count,
            received: HashMap::new(),
            deadline,
            notify: None,
            resolved: true,
            complete: true,
            resolved_at: Some(Instant::now()),
        }
    }
}

struct EarlyEntry {
    received: HashMap<SpecialistKind, ResponseEnvelope>,
    buffered_at: Instant,
}

struct AggregatorState {
    entries: HashMap<String, AggregationEntry>,
    early: HashMap<String, EarlyEntry>,
    early_order: VecDeque<String>,
    early_buffer_capacity: usize,
    grace_window: Duration,
    max_retention: Duration,
    stats: AggregatorStats,
}

impl AggregatorState {
    fn new(config: &CoordinationConfig) -> Self {
        Self {
            entries: HashMap::new(),
            early: HashMap::new(),
            early_order: VecDeque::new(),
            early_buffer_capacity: config.early_buffer_capacity.max(1),
            grace_window: config.grace_window(),
            max_retention: config.max_retention(),
            stats: AggregatorStats::default(),
        }
    }
}

/// Consumer of the shared response topic. Owns all aggregation state; not a
/// singleton, so independent instances (and their state maps) coexist, which
/// is what lets tests run several side by side.
pub struct ResponseAggregator {
    inner: Arc<Mutex<AggregatorState>>,
    subscription: Subscription,
    cancel: CancellationToken,
    default_timeout: Duration,
}

impl ResponseAggregator {
    /// Subscribe to the response topic and start the consume and sweep
    /// loops. Call before any request whose responses this instance should
    /// observe is published; responses racing ahead of a waiter registration
    /// are covered by the grace-window buffer.
    pub async fn start(
        channel: Arc<dyn MessageChannel>,
        config: &CoordinationConfig,
    ) -> Result<Self, ChannelError> {
        let inner = Arc::new(Mutex::new(AggregatorState::new(config)));
        let cancel = CancellationToken::new();

        let (tx, rx) = mpsc::channel(64);
        let subscription = channel.subscribe(RESPONSE_TOPIC, tx).await?;
        tokio::spawn(consume_loop(Arc::clone(&inner), rx, cancel.clone()));
        tokio::spawn(sweep_loop(
            Arc::clone(&inner),
            config.sweep_interval(),
            cancel.clone(),
        ));

        Ok(Self {
            inner,
            subscription,
            cancel,
            default_timeout: config.aggregation_timeout(),
        })
    }

    /// Block until `expected_count` distinct specialist responses arrive for
    /// `correlation_id` or `timeout` elapses, whichever is first. Register
    /// only counts the publisher actually confirmed; an inflated count waits
    /// out the full timeout for envelopes that never existed.
    pub async fn wait(
        &self,
        correlation_id: &str,
        expected_count: usize,
        timeout: Duration,
    ) -> AggregationOutcome {
        let started = Instant::now();
        let deadline = started + timeout;

        let rx = {
            let mut state = self.lock_state();
            state.stats.waits_registered_total += 1;

            let received = adopt_early(&mut state, correlation_id);
            if received.len() >= expected_count {
                // Grace-window buffer already satisfies the wait. Leave a
                // tombstone so stragglers are discarded as late, not
                // re-buffered.
                state.stats.completed_total += 1;
                state.entries.insert(
                    correlation_id.to_string(),
                    AggregationEntry::resolved_tombstone(expected_count, deadline),
                );
                return AggregationOutcome {
                    responses: received,
                    complete: true,
                    elapsed: started.elapsed(),
                };
            }

            let (tx, rx) = oneshot::channel();
            let previous = state.entries.insert(
                correlation_id.to_string(),
                AggregationEntry {
                    expected_count,
                    received,
                    deadline,
                    notify: Some(tx),
                    resolved: false,
                    complete: false,
                    resolved_at: None,
                },
            );
            if previous.is_some_and(|entry| !entry.resolved) {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    "replacing an unresolved waiter registration"
                );
            }
            rx
        };

        // Wakes on resolution; the deadline arm covers the partial path.
        let _ = tokio::time::timeout_at(deadline, rx).await;

        let mut state = self.lock_state();
        let Some(entry) = state.entries.get_mut(correlation_id) else {
            // Swept between wake-up and this lock; nothing to report.
            return AggregationOutcome {
                responses: HashMap::new(),
                complete: false,
                elapsed: started.elapsed(),
            };
        };
        if !entry.resolved {
            entry.resolved = true;
            entry.complete = false;
            entry.resolved_at = Some(Instant::now());
            entry.notify = None;
        }
        let complete = entry.complete;
        let responses = std::mem::take(&mut entry.received);
        if complete {
            state.stats.completed_total += 1;
        } else {
            state.stats.timed_out_total += 1;
        }
        AggregationOutcome {
            responses,
            complete,
            elapsed: started.elapsed(),
        }
    }

    /// [`Self::wait`] with the configured default timeout.
    pub async fn wait_default(
        &self,
        correlation_id: &str,
        expected_count: usize,
    ) -> AggregationOutcome {
        self.wait(correlation_id, expected_count, self.default_timeout)
            .await
    }

    /// Responses merged so far for an in-flight correlation id. Diagnostics
    /// only.
    pub fn pending_responses(&self, correlation_id: &str) -> usize {
        let state = self.lock_state();
        state
            .entries
            .get(correlation_id)
            .map(|entry| entry.received.len())
            .or_else(|| {
                state
                    .early
                    .get(correlation_id)
                    .map(|entry| entry.received.len())
            })
            .unwrap_or(0)
    }

    pub fn stats(&self) -> AggregatorStats {
        self.lock_state().stats
    }

    /// Stop the consume and sweep loops. In-flight waiters resolve through
    /// their own deadlines.
    pub fn shutdown(&self) {
        self.subscription.cancel();
        self.cancel.cancel();
    }

    fn lock_state(&self) -> MutexGuard<'_, AggregatorState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn consume_loop(
    inner: Arc<Mutex<AggregatorState>>,
    mut rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            () = cancel.cancelled() => break,
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let mut state = inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handle_response_payload(&mut state, &delivery.payload);
        drop(state);
        // Response messages are always settled: redelivering one we could
        // not use changes nothing.
        delivery.ack();
    }
}

fn handle_response_payload(state: &mut AggregatorState, payload: &[u8]) {
    let response = match ResponseEnvelope::from_bytes(payload)
        .and_then(|response| response.validate().map(|()| response))
    {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(error = %error, "dropping malformed response message");
            state.stats.malformed_total += 1;
            return;
        }
    };
    state.stats.responses_received_total += 1;

    let correlation_id = response.correlation_id.clone();
    let specialist = response.specialist_type.clone();
    match state.entries.get_mut(&correlation_id) {
        Some(entry) if entry.resolved => {
            state.stats.late_responses_total += 1;
            tracing::debug!(
                correlation_id = %correlation_id,
                specialist = %specialist,
                "discarding response for resolved correlation id"
            );
        }
        Some(entry) => {
            if entry.received.insert(specialist, response).is_some() {
                state.stats.duplicate_responses_total += 1;
            }
            if entry.received.len() >= entry.expected_count {
                entry.resolved = true;
                entry.complete = true;
                entry.resolved_at = Some(Instant::now());
                if let Some(notify) = entry.notify.take() {
                    let _ = notify.send(());
                }
            }
        }
        None => buffer_early(state, correlation_id, response),
    }
}

fn buffer_early(state: &mut AggregatorState, correlation_id: String, response: ResponseEnvelope) {
    if !state.early.contains_key(&correlation_id)
        && state.early.len() >= state.early_buffer_capacity
    {
        if let Some(evicted) = state.early_order.pop_front() {
            if state.early.remove(&evicted).is_some() {
                state.stats.early_evictions_total += 1;
            }
        }
    }

    let entry = match state.early.entry(correlation_id.clone()) {
        std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
        std::collections::hash_map::Entry::Vacant(vacant) => {
            state.early_order.push_back(correlation_id);
            vacant.insert(EarlyEntry {
                received: HashMap::new(),
                buffered_at: Instant::now(),
            })
        }
    };
    if entry
        .received
        .insert(response.specialist_type.clone(), response)
        .is_some()
    {
        state.stats.duplicate_responses_total += 1;
    }
    state.stats.early_buffered_total += 1;
}

fn adopt_early(
    state: &mut AggregatorState,
    correlation_id: &str,
) -> HashMap<SpecialistKind, ResponseEnvelope> {
    match state.early.remove(correlation_id) {
        Some(entry) => {
            state
                .early_order
                .retain(|buffered| buffered != correlation_id);
            entry.received
        }
        None => HashMap::new(),
    }
}

async fn sweep_loop(
    inner: Arc<Mutex<AggregatorState>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut state = inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sweep(&mut state, Instant::now());
    }
}

fn sweep(state: &mut AggregatorState, now: Instant) {
    let grace_window = state.grace_window;
    let mut expired = 0_u64;
    state.early.retain(|_, entry| {
        let keep = now.duration_since(entry.buffered_at) <= grace_window;
        if !keep {
            expired += 1;
        }
        keep
    });
    if expired > 0 {
        state.stats.early_expired_total += expired;
        let early = &state.early;
        state.early_order.retain(|key| early.contains_key(key));
    }

    // Abandoned waits: deadline passed, caller's receiver gone. Mark the
    // entry terminal so the retention clock starts; responses already merged
    // stay visible for diagnostics until then.
    let mut abandoned = 0_u64;
    for entry in state.entries.values_mut() {
        let waiter_gone = entry
            .notify
            .as_ref()
            .is_none_or(oneshot::Sender::is_closed);
        if !entry.resolved && now > entry.deadline && waiter_gone {
            entry.resolved = true;
            entry.complete = false;
            entry.resolved_at = Some(now);
            entry.notify = None;
            abandoned += 1;
        }
    }
    state.stats.abandoned_total += abandoned;

    let max_retention = state.max_retention;
    let mut evicted = 0_u64;
    state.entries.retain(|_, entry| {
        let past_retention = entry
            .resolved_at
            .is_some_and(|resolved_at| now.duration_since(resolved_at) > max_retention);
        if past_retention {
            evicted += 1;
        }
        !past_retention
    });
    state.stats.entries_evicted_total += evicted;
}
