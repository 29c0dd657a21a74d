//! Message channel abstraction and the in-memory broker.
//!
//! The coordination core talks to its broker through the [`MessageChannel`]
//! trait in [`traits`]: named topics, at-least-once delivery, ack/nack
//! settlement, per-message attributes. Deployments bind it to a managed
//! queue service; [`memory`] provides the in-memory implementation used by
//! tests and local development.

pub mod memory;
pub mod traits;

pub use memory::{
    ChannelDeadLetter, DeliveryPolicy, InMemoryChannel, InMemoryChannelLimits,
    InMemoryChannelStats,
};
pub use traits::{ChannelError, Delivery, MessageChannel, Subscription};
