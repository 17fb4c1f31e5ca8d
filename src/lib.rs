//! relayq is a durable task queue over pluggable storage backends.
//!
//! Messages are published to named topics and claimed by subscribers
//! under a visibility lease. A claimed message that is not completed
//! before its lease expires is returned to the retry path with
//! exponential backoff, and dead-lettered once its retries are
//! exhausted. Delivery is at-least-once; handlers must be idempotent.
//!
//! Three backends share the same semantics: SQLite for single-node
//! durable deployments, Redis for shared deployments, and an in-memory
//! store for tests.

pub mod config;
pub mod error;
pub mod job;
pub mod message;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

pub use config::{BackendKind, Config};
pub use error::{Error, Result};
pub use job::JobPayload;
pub use message::{
    ClaimedMessage, DeadLetterEntry, FailOutcome, Message, MessageMeta, MessageStatus, NewMessage,
    SubscriptionRecord, TopicStats,
};
pub use queue::{PublishOptions, Queue, SubscribeOptions};
pub use retry::RetryPolicy;
pub use store::Store;
pub use worker::{Handler, SubscriptionHandle};
