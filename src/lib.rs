#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::uninlined_format_args
)]

//! Fan-out/fan-in coordination of specialist workers over asynchronous
//! message queues.
//!
//! One caller request fans out to any number of independent specialist
//! workers and fans back in to a single combined result set:
//!
//! - [`RequestPublisher`] dispatches correlated request envelopes to
//!   per-specialist topics and reports per-kind publish failures.
//! - [`SpecialistWorker`] consumes one specialist topic, invokes a pluggable
//!   [`SpecialistInvoker`], and publishes a correlated response, or leaves
//!   the message for broker redelivery on transient failure.
//! - [`ResponseAggregator`] collects responses by correlation id and
//!   releases waiters with a complete or partial set, bounded by a timeout.
//!
//! The broker itself is external, consumed through [`channel::MessageChannel`];
//! [`channel::InMemoryChannel`] backs tests and local development.

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod publisher;
pub mod worker;

pub use aggregator::{AggregationOutcome, AggregatorStats, ResponseAggregator};
pub use channel::{ChannelError, InMemoryChannel, MessageChannel};
pub use config::CoordinationConfig;
pub use envelope::{
    RequestEnvelope, ResponseEnvelope, ResponseStatus, SpecialistKind, RESPONSE_TOPIC,
};
pub use publisher::{FanOut, PublishError, RequestPublisher};
pub use worker::{InvokeError, SpecialistInvoker, SpecialistWorker};
