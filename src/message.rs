//! Message types and lifecycle state for the queue engine.
//!
//! Messages flow through the system in different states (pending,
//! processing, completed) and carry an opaque JSON payload whose schema is
//! agreed between producer and consumer per topic.
//!
//! # Message lifecycle
//!
//! 1. Messages are created in `Pending` status by a publish call
//! 2. A worker claims one atomically, moving it to `Processing` under a
//!    time-bounded lease
//! 3. On success the message moves to `Completed`
//! 4. On failure (or lease expiry) it returns to `Pending` with a backoff
//!    delay, until `retry_count` exceeds `max_retries` and the message is
//!    moved out of the store into the dead-letter store

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use strum::{Display, EnumString};

/// Represents the current status of a message in the queue.
///
/// `Pending` -> `Processing` -> `Completed`  (success)
/// `Pending` -> `Processing` -> `Pending`    (failure or lease expiry)
///
/// Messages whose retries are exhausted leave the message store entirely
/// and become [`DeadLetterEntry`] records; the `Failed` bucket in
/// [`TopicStats`] is derived from the dead-letter store.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Display, EnumString,
)]
#[sqlx(type_name = "text")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be claimed (includes delayed and retry-scheduled messages)
    #[serde(rename = "pending")]
    #[sqlx(rename = "pending")]
    Pending,
    /// Claimed by exactly one worker, lease still current
    #[serde(rename = "processing")]
    #[sqlx(rename = "processing")]
    Processing,
    /// Successfully processed and acknowledged
    #[serde(rename = "completed")]
    #[sqlx(rename = "completed")]
    Completed,
    /// Exhausted all retries (terminal; lives in the dead-letter store)
    #[serde(rename = "failed")]
    #[sqlx(rename = "failed")]
    Failed,
}

/// A message row as stored by the relational backend.
///
/// All timestamps are unix milliseconds.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub topic: String,
    /// Externally visible idempotency/tracing key, unique per publish.
    pub message_id: String,
    pub payload: String,
    pub priority: i64,
    pub status: MessageStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub lease_token: Option<String>,
    pub visibility_deadline: Option<i64>,
    pub scheduled_at: i64,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

/// Insert arguments for a publish call, already normalized by the facade.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub max_retries: u32,
    pub delay_seconds: u64,
}

/// A message handed to a worker together with the lease that owns it.
///
/// The `lease_token` is the proof of ownership: completion and failure
/// writes only take effect while the token is still current, which is what
/// makes a slow worker's late acknowledgement a no-op after its lease has
/// expired and the message was reclaimed.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub id: String,
    pub topic: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub lease_token: String,
}

/// Metadata passed to a subscription handler alongside the payload.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: String,
    pub topic: String,
    /// 1-based attempt number (`retry_count + 1`).
    pub attempt: u32,
}

/// Terminal record for a message that exhausted its retries.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct DeadLetterEntry {
    pub original_message_id: String,
    pub topic: String,
    pub payload: String,
    pub failure_reason: String,
    pub retry_count: i64,
    pub moved_at: i64,
}

/// Soft-state liveness record for a subscriber; observability only, never
/// consulted for correctness.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub subscriber_id: String,
    pub last_poll_at: i64,
    pub is_active: bool,
}

/// Per-topic (or aggregated) counters returned by `get_stats`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TopicStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Mean seconds from claim to completion, over completed messages.
    pub avg_processing_seconds: f64,
}

/// Outcome of reporting a failure for a claimed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled as pending, eligible again at the given unix-ms time.
    Retried { next_attempt_at: i64 },
    /// Retries exhausted; moved to the dead-letter store.
    DeadLettered,
    /// The lease was no longer current; nothing was changed.
    Stale,
}
