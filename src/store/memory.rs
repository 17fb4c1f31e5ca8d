//! Pure in-process store for tests.
//!
//! Honors the same ordering and lease rules as the durable backends, but
//! drops everything on process exit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::message::{
    ClaimedMessage, DeadLetterEntry, FailOutcome, MessageStatus, NewMessage, SubscriptionRecord,
    TopicStats,
};
use crate::retry::RetryPolicy;

use super::{now_ms, Store};

#[derive(Debug, Clone)]
struct MemMessage {
    id: u64,
    topic: String,
    message_id: String,
    payload: serde_json::Value,
    priority: i64,
    status: MessageStatus,
    retry_count: u32,
    max_retries: u32,
    lease_token: Option<String>,
    visibility_deadline: Option<i64>,
    scheduled_at: i64,
    claimed_at: Option<i64>,
    updated_at: i64,
    processed_at: Option<i64>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    messages: Vec<MemMessage>,
    dead: Vec<DeadLetterEntry>,
    subscriptions: HashMap<(String, String), SubscriptionRecord>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
}

impl MemoryStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retry,
        }
    }

    fn fail_message(
        retry: &RetryPolicy,
        inner: &mut Inner,
        index: usize,
        reason: &str,
        now: i64,
    ) -> FailOutcome {
        let msg = &mut inner.messages[index];
        let retry_count = msg.retry_count + 1;

        if retry_count > msg.max_retries {
            let msg = inner.messages.remove(index);
            warn!(
                message_id = %msg.message_id,
                topic = %msg.topic,
                retry_count,
                reason,
                "message moved to dead-letter store"
            );
            inner.dead.push(DeadLetterEntry {
                original_message_id: msg.message_id,
                topic: msg.topic,
                payload: msg.payload.to_string(),
                failure_reason: reason.to_owned(),
                retry_count: i64::from(retry_count),
                moved_at: now,
            });
            return FailOutcome::DeadLettered;
        }

        let next_attempt_at = now + retry.delay(retry_count).as_millis() as i64;

        msg.status = MessageStatus::Pending;
        msg.retry_count = retry_count;
        msg.scheduled_at = next_attempt_at;
        msg.lease_token = None;
        msg.visibility_deadline = None;
        msg.claimed_at = None;
        msg.updated_at = now;

        FailOutcome::Retried { next_attempt_at }
    }

    fn position_of(inner: &Inner, claim: &ClaimedMessage) -> Option<usize> {
        inner.messages.iter().position(|m| {
            m.id.to_string() == claim.id
                && m.status == MessageStatus::Processing
                && m.lease_token.as_deref() == Some(claim.lease_token.as_str())
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, message: NewMessage) -> Result<String> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        // Idempotent on the external message id.
        if inner
            .messages
            .iter()
            .any(|m| m.message_id == message.message_id)
        {
            return Ok(message.message_id);
        }

        inner.next_id += 1;
        let id = inner.next_id;

        inner.messages.push(MemMessage {
            id,
            topic: message.topic,
            message_id: message.message_id.clone(),
            payload: message.payload,
            priority: message.priority,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: message.max_retries,
            lease_token: None,
            visibility_deadline: None,
            scheduled_at: super::schedule_at(now, message.delay_seconds),
            claimed_at: None,
            updated_at: now,
            processed_at: None,
        });

        Ok(message.message_id)
    }

    async fn claim(&self, topic: &str, lease: Duration) -> Result<Option<ClaimedMessage>> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        // Same ordering as the SQL claim: priority DESC, scheduled_at ASC,
        // insertion order ASC.
        let index = inner
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.topic == topic && m.status == MessageStatus::Pending && m.scheduled_at <= now
            })
            .min_by_key(|(_, m)| (-m.priority, m.scheduled_at, m.id))
            .map(|(i, _)| i);

        let Some(index) = index else {
            return Ok(None);
        };

        let lease_token = Uuid::new_v4().to_string();
        let msg = &mut inner.messages[index];

        msg.status = MessageStatus::Processing;
        msg.lease_token = Some(lease_token.clone());
        msg.visibility_deadline = Some(now + lease.as_millis() as i64);
        msg.claimed_at = Some(now);
        msg.updated_at = now;

        Ok(Some(ClaimedMessage {
            id: msg.id.to_string(),
            topic: msg.topic.clone(),
            message_id: msg.message_id.clone(),
            payload: msg.payload.clone(),
            retry_count: msg.retry_count,
            max_retries: msg.max_retries,
            lease_token,
        }))
    }

    async fn complete(&self, claim: &ClaimedMessage) -> Result<bool> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        let Some(index) = Self::position_of(&inner, claim) else {
            return Ok(false);
        };

        let msg = &mut inner.messages[index];
        msg.status = MessageStatus::Completed;
        msg.lease_token = None;
        msg.visibility_deadline = None;
        msg.processed_at = Some(now);
        msg.updated_at = now;

        Ok(true)
    }

    async fn fail(&self, claim: &ClaimedMessage, reason: &str) -> Result<FailOutcome> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        let Some(index) = Self::position_of(&inner, claim) else {
            return Ok(FailOutcome::Stale);
        };

        Ok(Self::fail_message(&self.retry, &mut inner, index, reason, now))
    }

    async fn extend_lease(&self, claim: &ClaimedMessage, lease: Duration) -> Result<bool> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        let Some(index) = Self::position_of(&inner, claim) else {
            return Ok(false);
        };

        let msg = &mut inner.messages[index];
        msg.visibility_deadline = Some(now + lease.as_millis() as i64);
        msg.updated_at = now;

        Ok(true)
    }

    async fn reap_expired(&self) -> Result<u64> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        let mut reaped = 0u64;

        loop {
            let expired = inner.messages.iter().position(|m| {
                m.status == MessageStatus::Processing
                    && m.visibility_deadline.is_some_and(|d| d < now)
            });

            let Some(index) = expired else {
                break;
            };

            Self::fail_message(&self.retry, &mut inner, index, "lease expired", now);
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn stats(&self, topic: Option<&str>) -> Result<TopicStats> {
        let inner = self.inner.lock().expect("store lock");

        let mut stats = TopicStats::default();
        let mut processing_ms = 0i64;

        for m in inner
            .messages
            .iter()
            .filter(|m| topic.is_none_or(|t| m.topic == t))
        {
            match m.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Completed => {
                    stats.completed += 1;
                    if let (Some(done), Some(claimed)) = (m.processed_at, m.claimed_at) {
                        processing_ms += done - claimed;
                    }
                }
                MessageStatus::Failed => {}
            }
        }

        stats.failed = inner
            .dead
            .iter()
            .filter(|d| topic.is_none_or(|t| d.topic == t))
            .count() as u64;

        if stats.completed > 0 {
            stats.avg_processing_seconds = processing_ms as f64 / 1000.0 / stats.completed as f64;
        }

        Ok(stats)
    }

    async fn cleanup(&self, cutoff_ms: i64) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock");

        let before = inner.messages.len() + inner.dead.len();

        inner
            .messages
            .retain(|m| m.status != MessageStatus::Completed || m.updated_at > cutoff_ms);
        inner.dead.retain(|d| d.moved_at > cutoff_ms);

        Ok((before - inner.messages.len() - inner.dead.len()) as u64)
    }

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().expect("store lock");

        let mut entries: Vec<_> = inner
            .dead
            .iter()
            .filter(|d| d.topic == topic)
            .cloned()
            .collect();
        entries.reverse();

        Ok(entries)
    }

    async fn touch_subscription(&self, topic: &str, subscriber_id: &str) -> Result<()> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("store lock");

        inner
            .subscriptions
            .entry((topic.to_owned(), subscriber_id.to_owned()))
            .and_modify(|s| {
                s.last_poll_at = now;
                s.is_active = true;
            })
            .or_insert_with(|| SubscriptionRecord {
                topic: topic.to_owned(),
                subscriber_id: subscriber_id.to_owned(),
                last_poll_at: now,
                is_active: true,
            });

        Ok(())
    }

    async fn subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionRecord>> {
        let inner = self.inner.lock().expect("store lock");

        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;

    fn new_message(topic: &str, id: &str, priority: i64) -> NewMessage {
        NewMessage {
            topic: topic.to_owned(),
            message_id: id.to_owned(),
            payload: serde_json::json!({ "n": id }),
            priority,
            max_retries: 3,
            delay_seconds: 0,
        }
    }

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let store = MemoryStore::new(RetryPolicy::default());

        store.insert(new_message("t", "a", 5)).await.unwrap();
        store.insert(new_message("t", "b", 1)).await.unwrap();
        store.insert(new_message("t", "c", 5)).await.unwrap();

        let lease = Duration::from_secs(30);
        let order: Vec<String> = [
            store.claim("t", lease).await.unwrap().unwrap(),
            store.claim("t", lease).await.unwrap().unwrap(),
            store.claim("t", lease).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|c| c.message_id)
        .collect();

        assert_eq!(order, vec!["a", "c", "b"]);
        assert!(store.claim("t", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_a_no_op() {
        let store = MemoryStore::new(RetryPolicy::default());

        store.insert(new_message("t", "dup", 0)).await.unwrap();
        store.insert(new_message("t", "dup", 9)).await.unwrap();

        let stats = store.stats(Some("t")).await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn stale_completion_is_a_no_op() {
        let store = MemoryStore::new(RetryPolicy::new(0, 0));

        store.insert(new_message("t", "m", 0)).await.unwrap();

        let first = store
            .claim("t", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();

        // Lease has already expired; the reaper hands the message back.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reap_expired().await.unwrap(), 1);

        let second = store
            .claim("t", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(!store.complete(&first).await.unwrap());
        assert!(store.complete(&second).await.unwrap());

        let stats = store.stats(Some("t")).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn huge_delay_saturates_instead_of_overflowing() {
        let store = MemoryStore::new(RetryPolicy::default());

        store
            .insert(NewMessage {
                delay_seconds: u64::MAX,
                ..new_message("t", "far-future", 0)
            })
            .await
            .unwrap();

        // Scheduled unreachably far ahead, but never claimable by accident
        // through wraparound.
        assert!(store
            .claim("t", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.stats(Some("t")).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let store = MemoryStore::new(RetryPolicy::new(0, 0));
        let lease = Duration::from_secs(30);

        store
            .insert(NewMessage {
                max_retries: 2,
                ..new_message("t", "doomed", 0)
            })
            .await
            .unwrap();

        for _ in 0..3 {
            let claim = store.claim("t", lease).await.unwrap().unwrap();
            store.fail(&claim, "boom").await.unwrap();
        }

        assert!(store.claim("t", lease).await.unwrap().is_none());

        let dead = store.dead_letters("t").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].original_message_id, "doomed");
        assert_eq!(dead[0].retry_count, 3);
        assert_eq!(dead[0].failure_reason, "boom");
    }
}
