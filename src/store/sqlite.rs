//! Relational message store on SQLite.
//!
//! The claim step is a single conditional `UPDATE ... RETURNING` over a
//! correlated subquery; SQLite serializes writers, so exactly one claimer
//! can win any given row.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{
    ClaimedMessage, DeadLetterEntry, FailOutcome, Message, NewMessage, SubscriptionRecord,
    TopicStats,
};
use crate::retry::RetryPolicy;

use super::{now_ms, Store};

pub struct SqliteStore {
    db: SqlitePool,
    retry: RetryPolicy,
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: i64,
    topic: String,
    message_id: String,
    payload: String,
    retry_count: i64,
    max_retries: i64,
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    id: i64,
    message_id: String,
    topic: String,
    payload: String,
    retry_count: i64,
    max_retries: i64,
}

impl SqliteStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let opts = if let Some(path) = &config.db_path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .auto_vacuum(SqliteAutoVacuum::Full);

        // An in-memory database exists per connection, so it must not be
        // pooled.
        let max_connections = if config.db_path.is_some() { 5 } else { 1 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            db: pool,
            retry: RetryPolicy::new(config.backoff_base_seconds, config.backoff_cap_seconds),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Full row for a message by its external id, for operator tooling.
    /// `None` once the message has been cleaned up or dead-lettered.
    pub async fn message(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(sqlx::query_as(
            "SELECT id, topic, message_id, payload, priority, status, retry_count,
                    max_retries, lease_token, visibility_deadline, scheduled_at,
                    claimed_at, created_at, updated_at, processed_at
             FROM messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.db)
        .await?)
    }

    fn parse_id(claim: &ClaimedMessage) -> Result<i64> {
        claim
            .id
            .parse::<i64>()
            .map_err(|e| Error::invalid_parameter(format!("message id: {e}")))
    }

    /// Retry-or-dead-letter for one leased row. Caller has already
    /// verified the lease and fetched the row inside `tx`.
    async fn fail_row(
        &self,
        tx: &mut SqliteConnection,
        row: &LeasedRow,
        reason: &str,
        now: i64,
    ) -> Result<FailOutcome> {
        let retry_count = (row.retry_count + 1) as u32;

        if i64::from(retry_count) > row.max_retries {
            sqlx::query(
                "INSERT INTO dead_letters
                    (original_message_id, topic, payload, failure_reason, retry_count, moved_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&row.message_id)
            .bind(&row.topic)
            .bind(&row.payload)
            .bind(reason)
            .bind(i64::from(retry_count))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM messages WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;

            warn!(
                message_id = %row.message_id,
                topic = %row.topic,
                retry_count,
                reason,
                "message moved to dead-letter store"
            );

            return Ok(FailOutcome::DeadLettered);
        }

        let delay = self.retry.delay(retry_count);
        let next_attempt_at = now + delay.as_millis() as i64;

        sqlx::query(
            "UPDATE messages SET
                status = 'pending',
                retry_count = $1,
                scheduled_at = $2,
                lease_token = NULL,
                visibility_deadline = NULL,
                claimed_at = NULL,
                updated_at = $3
             WHERE id = $4",
        )
        .bind(i64::from(retry_count))
        .bind(next_attempt_at)
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await?;

        debug!(
            message_id = %row.message_id,
            topic = %row.topic,
            retry_count,
            next_attempt_at,
            reason,
            "message rescheduled for retry"
        );

        Ok(FailOutcome::Retried { next_attempt_at })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert(&self, message: NewMessage) -> Result<String> {
        let now = now_ms();
        let scheduled_at = super::schedule_at(now, message.delay_seconds);
        let payload = serde_json::to_string(&message.payload)?;

        sqlx::query(
            "INSERT INTO messages
                (topic, message_id, payload, priority, max_retries,
                 scheduled_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&message.topic)
        .bind(&message.message_id)
        .bind(&payload)
        .bind(message.priority)
        .bind(i64::from(message.max_retries))
        .bind(scheduled_at)
        .bind(now)
        .execute(&self.db)
        .await?;

        debug!(
            message_id = %message.message_id,
            topic = %message.topic,
            priority = message.priority,
            scheduled_at,
            "published message"
        );

        Ok(message.message_id)
    }

    async fn claim(&self, topic: &str, lease: Duration) -> Result<Option<ClaimedMessage>> {
        let now = now_ms();
        let deadline = now + lease.as_millis() as i64;
        let lease_token = Uuid::new_v4().to_string();

        let row: Option<ClaimRow> = sqlx::query_as(
            "UPDATE messages SET
                status = 'processing',
                lease_token = $1,
                visibility_deadline = $2,
                claimed_at = $3,
                updated_at = $3
             WHERE id = (
                SELECT id FROM messages
                WHERE topic = $4 AND status = 'pending' AND scheduled_at <= $3
                ORDER BY priority DESC, scheduled_at ASC, id ASC
                LIMIT 1
             )
             RETURNING id, topic, message_id, payload, retry_count, max_retries",
        )
        .bind(&lease_token)
        .bind(deadline)
        .bind(now)
        .bind(topic)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ClaimedMessage {
            id: row.id.to_string(),
            topic: row.topic,
            message_id: row.message_id,
            payload: serde_json::from_str(&row.payload)?,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            lease_token,
        }))
    }

    async fn complete(&self, claim: &ClaimedMessage) -> Result<bool> {
        let id = Self::parse_id(claim)?;
        let now = now_ms();

        let result = sqlx::query(
            "UPDATE messages SET
                status = 'completed',
                processed_at = $1,
                updated_at = $1,
                lease_token = NULL,
                visibility_deadline = NULL
             WHERE id = $2 AND status = 'processing' AND lease_token = $3",
        )
        .bind(now)
        .bind(id)
        .bind(&claim.lease_token)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, claim: &ClaimedMessage, reason: &str) -> Result<FailOutcome> {
        let id = Self::parse_id(claim)?;
        let now = now_ms();

        let mut tx = self.db.begin().await?;

        let row: Option<LeasedRow> = sqlx::query_as(
            "SELECT id, message_id, topic, payload, retry_count, max_retries
             FROM messages
             WHERE id = $1 AND status = 'processing' AND lease_token = $2",
        )
        .bind(id)
        .bind(&claim.lease_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(FailOutcome::Stale);
        };

        let outcome = self.fail_row(&mut tx, &row, reason, now).await?;

        tx.commit().await?;

        Ok(outcome)
    }

    async fn extend_lease(&self, claim: &ClaimedMessage, lease: Duration) -> Result<bool> {
        let id = Self::parse_id(claim)?;
        let now = now_ms();
        let deadline = now + lease.as_millis() as i64;

        let result = sqlx::query(
            "UPDATE messages SET visibility_deadline = $1, updated_at = $2
             WHERE id = $3 AND status = 'processing' AND lease_token = $4",
        )
        .bind(deadline)
        .bind(now)
        .bind(id)
        .bind(&claim.lease_token)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reap_expired(&self) -> Result<u64> {
        let now = now_ms();

        let mut tx = self.db.begin().await?;

        let expired: Vec<LeasedRow> = sqlx::query_as(
            "SELECT id, message_id, topic, payload, retry_count, max_retries
             FROM messages
             WHERE status = 'processing' AND visibility_deadline < $1",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = 0u64;

        for row in &expired {
            warn!(
                message_id = %row.message_id,
                topic = %row.topic,
                "lease expired; returning message to retry path"
            );
            self.fail_row(&mut tx, row, "lease expired", now).await?;
            reaped += 1;
        }

        tx.commit().await?;

        Ok(reaped)
    }

    async fn stats(&self, topic: Option<&str>) -> Result<TopicStats> {
        let (pending, processing, completed, avg_secs): (i64, i64, i64, f64) = match topic {
            Some(topic) => {
                sqlx::query_as(
                    "SELECT
                        COUNT(*) FILTER (WHERE status = 'pending'),
                        COUNT(*) FILTER (WHERE status = 'processing'),
                        COUNT(*) FILTER (WHERE status = 'completed'),
                        COALESCE(AVG((processed_at - claimed_at) / 1000.0)
                            FILTER (WHERE status = 'completed'), 0.0)
                     FROM messages WHERE topic = $1",
                )
                .bind(topic)
                .fetch_one(&self.db)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT
                        COUNT(*) FILTER (WHERE status = 'pending'),
                        COUNT(*) FILTER (WHERE status = 'processing'),
                        COUNT(*) FILTER (WHERE status = 'completed'),
                        COALESCE(AVG((processed_at - claimed_at) / 1000.0)
                            FILTER (WHERE status = 'completed'), 0.0)
                     FROM messages",
                )
                .fetch_one(&self.db)
                .await?
            }
        };

        let failed: i64 = match topic {
            Some(topic) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE topic = $1")
                    .bind(topic)
                    .fetch_one(&self.db)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
                    .fetch_one(&self.db)
                    .await?
            }
        };

        Ok(TopicStats {
            pending: pending as u64,
            processing: processing as u64,
            completed: completed as u64,
            failed: failed as u64,
            avg_processing_seconds: avg_secs,
        })
    }

    async fn cleanup(&self, cutoff_ms: i64) -> Result<u64> {
        // Inclusive bound so a zero-day sweep clears everything terminal.
        let messages = sqlx::query(
            "DELETE FROM messages WHERE status = 'completed' AND updated_at <= $1",
        )
        .bind(cutoff_ms)
        .execute(&self.db)
        .await?
        .rows_affected();

        let dead = sqlx::query("DELETE FROM dead_letters WHERE moved_at <= $1")
            .bind(cutoff_ms)
            .execute(&self.db)
            .await?
            .rows_affected();

        Ok(messages + dead)
    }

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetterEntry>> {
        Ok(sqlx::query_as(
            "SELECT original_message_id, topic, payload, failure_reason, retry_count, moved_at
             FROM dead_letters WHERE topic = $1
             ORDER BY moved_at DESC, id DESC",
        )
        .bind(topic)
        .fetch_all(&self.db)
        .await?)
    }

    async fn touch_subscription(&self, topic: &str, subscriber_id: &str) -> Result<()> {
        let now = now_ms();

        sqlx::query(
            "INSERT INTO subscriptions (topic, subscriber_id, last_poll_at, is_active, created_at)
             VALUES ($1, $2, $3, 1, $3)
             ON CONFLICT (topic, subscriber_id) DO UPDATE SET
                last_poll_at = excluded.last_poll_at,
                is_active = 1",
        )
        .bind(topic)
        .bind(subscriber_id)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionRecord>> {
        Ok(sqlx::query_as(
            "SELECT topic, subscriber_id, last_poll_at, is_active
             FROM subscriptions WHERE topic = $1",
        )
        .bind(topic)
        .fetch_all(&self.db)
        .await?)
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}
