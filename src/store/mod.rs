//! Backend adapter layer.
//!
//! One trait, implemented once per backing store. Producers and consumers
//! only ever see `Arc<dyn Store>`; swapping the backend is a configuration
//! change, never a code change.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{
    ClaimedMessage, DeadLetterEntry, FailOutcome, NewMessage, SubscriptionRecord, TopicStats,
};

pub mod memory;
pub mod redis;
pub mod sqlite;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Not-before time for a publish delay. Saturates instead of overflowing
/// on absurd caller-supplied delays.
pub(crate) fn schedule_at(now: i64, delay_seconds: u64) -> i64 {
    let delay_ms = delay_seconds.saturating_mul(1000).min(i64::MAX as u64) as i64;
    now.saturating_add(delay_ms)
}

/// Persistence operations for all queue state. Implementations must be
/// safe to share across worker tasks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Durably insert a pending message. Duplicate `message_id`s are
    /// idempotent no-ops; the id is returned either way.
    async fn insert(&self, message: NewMessage) -> Result<String>;

    /// Atomically claim the next eligible message on a topic: highest
    /// priority first, then earliest `scheduled_at`, then insertion order.
    /// At most one concurrent caller wins any given message; losers simply
    /// observe `None` or a different message.
    async fn claim(&self, topic: &str, lease: Duration) -> Result<Option<ClaimedMessage>>;

    /// Mark a claimed message completed. Returns `false` without changing
    /// anything if the lease token is no longer current.
    async fn complete(&self, claim: &ClaimedMessage) -> Result<bool>;

    /// Report a failure for a claimed message: reschedule with backoff or
    /// move to the dead-letter store once retries are exhausted.
    async fn fail(&self, claim: &ClaimedMessage, reason: &str) -> Result<FailOutcome>;

    /// Extend the lease on a still-processing message (heartbeat). Returns
    /// `false` if the lease is no longer current.
    async fn extend_lease(&self, claim: &ClaimedMessage, lease: Duration) -> Result<bool>;

    /// Return every expired `processing` message to the retry path.
    /// Returns the number of leases reaped.
    async fn reap_expired(&self) -> Result<u64>;

    /// Counts by status plus average claim-to-completion seconds. `None`
    /// aggregates across all topics.
    async fn stats(&self, topic: Option<&str>) -> Result<TopicStats>;

    /// Delete terminal records (completed messages, dead-letter entries)
    /// last touched before `cutoff_ms`. Never touches pending or
    /// processing messages. Returns the number of records removed.
    async fn cleanup(&self, cutoff_ms: i64) -> Result<u64>;

    /// Dead-letter entries for a topic, newest first.
    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetterEntry>>;

    /// Upsert the soft-state subscription record and stamp its last poll
    /// time. Best effort; never affects correctness.
    async fn touch_subscription(&self, topic: &str, subscriber_id: &str) -> Result<()>;

    /// List subscription records for a topic.
    async fn subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionRecord>>;

    /// Release any underlying connections.
    async fn close(&self) -> Result<()>;
}
