//! Sorted-set message store on Redis.
//!
//! Layout per topic (all keys under a configurable prefix):
//! - `ready:{topic}`      zset, score packs (priority, FIFO sequence)
//! - `delayed:{topic}`    zset, score = not-before unix ms
//! - `processing:{topic}` zset, score = visibility deadline unix ms
//! - `dead:{topic}`       list of dead-letter JSON entries, newest first
//! - `done:{topic}`       zset of completed ids, score = completion ms
//! - `msg:{id}`           hash with the message fields
//!
//! Every multi-key transition runs as a Lua script so concurrent claimers
//! and the reaper can never observe a half-applied state.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{
    ClaimedMessage, DeadLetterEntry, FailOutcome, NewMessage, SubscriptionRecord, TopicStats,
};
use crate::retry::RetryPolicy;

use super::{now_ms, Store};

/// Sequence numbers occupy the low 32 bits of a ready score, priority the
/// bits above; both fit comfortably in an f64 mantissa. Promoted messages
/// draw a fresh sequence as the due set is walked in `scheduled_at` order,
/// so equal-priority messages pop by eligibility time, not publish time.
const SEQ_SPAN: f64 = 4294967296.0;
const PRIORITY_CLAMP: i64 = 1 << 20;

const PUBLISH_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
if existing then
    return ARGV[1]
end
local seq = redis.call('INCR', KEYS[6])
local score = tonumber(ARGV[4]) * 4294967296 + (4294967295 - seq % 4294967296)
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[4],
    'topic', ARGV[8],
    'message_id', ARGV[1],
    'payload', ARGV[3],
    'priority', ARGV[4],
    'max_retries', ARGV[5],
    'retry_count', '0',
    'status', 'pending',
    'created_at', ARGV[6],
    'updated_at', ARGV[6],
    'scheduled_at', ARGV[7])
redis.call('SADD', KEYS[5], ARGV[8])
if tonumber(ARGV[7]) > tonumber(ARGV[6]) then
    redis.call('ZADD', KEYS[3], tonumber(ARGV[7]), ARGV[2])
else
    redis.call('ZADD', KEYS[2], score, ARGV[2])
end
return ARGV[1]
"#;

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
    local prio = redis.call('HGET', ARGV[4] .. id, 'priority')
    if prio then
        local seq = redis.call('INCR', KEYS[4])
        local score = tonumber(prio) * 4294967296 + (4294967295 - seq % 4294967296)
        redis.call('ZADD', KEYS[1], score, id)
    end
    redis.call('ZREM', KEYS[2], id)
end
local popped = redis.call('ZPOPMAX', KEYS[1])
if #popped == 0 then
    return false
end
local id = popped[1]
local key = ARGV[4] .. id
redis.call('ZADD', KEYS[3], tonumber(ARGV[2]), id)
redis.call('HSET', key,
    'status', 'processing',
    'lease_token', ARGV[3],
    'visibility_deadline', ARGV[2],
    'claimed_at', ARGV[1],
    'updated_at', ARGV[1])
local m = redis.call('HMGET', key, 'message_id', 'payload', 'retry_count', 'max_retries', 'topic')
return {id, m[1], m[2], m[3], m[4], m[5]}
"#;

const COMPLETE_SCRIPT: &str = r#"
local t = redis.call('HMGET', KEYS[2], 'lease_token', 'status', 'claimed_at')
if t[1] ~= ARGV[1] or t[2] ~= 'processing' then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[3])
redis.call('HSET', KEYS[2], 'status', 'completed', 'processed_at', ARGV[2], 'updated_at', ARGV[2])
redis.call('HDEL', KEYS[2], 'lease_token', 'visibility_deadline')
redis.call('ZADD', KEYS[3], tonumber(ARGV[2]), ARGV[3])
redis.call('HINCRBY', KEYS[4], 'completed', 1)
if t[3] then
    redis.call('HINCRBY', KEYS[4], 'processing_ms_total', tonumber(ARGV[2]) - tonumber(t[3]))
end
return 1
"#;

const FAIL_SCRIPT: &str = r#"
local t = redis.call('HMGET', KEYS[2], 'lease_token', 'status', 'message_id', 'payload', 'topic')
if t[1] ~= ARGV[1] or t[2] ~= 'processing' then
    return 'stale'
end
redis.call('ZREM', KEYS[1], ARGV[2])
local rc = tonumber(ARGV[5])
if rc > tonumber(ARGV[6]) then
    local entry = cjson.encode({
        original_message_id = t[3],
        topic = t[5],
        payload = t[4],
        failure_reason = ARGV[7],
        retry_count = rc,
        moved_at = tonumber(ARGV[3]),
    })
    redis.call('LPUSH', KEYS[4], entry)
    redis.call('HDEL', KEYS[5], t[3])
    redis.call('DEL', KEYS[2])
    return 'dead'
end
redis.call('HSET', KEYS[2],
    'status', 'pending',
    'retry_count', tostring(rc),
    'scheduled_at', ARGV[4],
    'updated_at', ARGV[3])
redis.call('HDEL', KEYS[2], 'lease_token', 'visibility_deadline', 'claimed_at')
redis.call('ZADD', KEYS[3], tonumber(ARGV[4]), ARGV[2])
return 'retried'
"#;

const EXTEND_SCRIPT: &str = r#"
local t = redis.call('HMGET', KEYS[2], 'lease_token', 'status')
if t[1] ~= ARGV[1] or t[2] ~= 'processing' then
    return 0
end
redis.call('ZADD', KEYS[1], tonumber(ARGV[3]), ARGV[2])
redis.call('HSET', KEYS[2], 'visibility_deadline', ARGV[3], 'updated_at', ARGV[4])
return 1
"#;

pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
    retry: RetryPolicy,
    publish: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    extend: Script,
}

impl RedisStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| Error::config("redis_url is required for the redis backend"))?;

        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;

        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            retry: RetryPolicy::new(config.backoff_base_seconds, config.backoff_cap_seconds),
            publish: Script::new(PUBLISH_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        })
    }

    fn key(&self, kind: &str, rest: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, rest)
    }

    fn msg_prefix(&self) -> String {
        format!("{}:msg:", self.prefix)
    }

    fn clamp_priority(priority: i64) -> i64 {
        priority.clamp(-PRIORITY_CLAMP, PRIORITY_CLAMP)
    }

    async fn run_fail(
        &self,
        topic: &str,
        id: &str,
        lease_token: &str,
        retry_count: u32,
        max_retries: u32,
        reason: &str,
    ) -> Result<FailOutcome> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let new_count = retry_count + 1;
        let next_attempt_at = now + self.retry.delay(new_count).as_millis() as i64;

        let outcome: String = self
            .fail
            .key(self.key("processing", topic))
            .key(format!("{}{}", self.msg_prefix(), id))
            .key(self.key("delayed", topic))
            .key(self.key("dead", topic))
            .key(format!("{}:ids", self.prefix))
            .arg(lease_token)
            .arg(id)
            .arg(now)
            .arg(next_attempt_at)
            .arg(new_count)
            .arg(max_retries)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "retried" => {
                debug!(id, topic, retry_count = new_count, reason, "message rescheduled");
                Ok(FailOutcome::Retried { next_attempt_at })
            }
            "dead" => {
                warn!(id, topic, retry_count = new_count, reason, "message dead-lettered");
                Ok(FailOutcome::DeadLettered)
            }
            _ => Ok(FailOutcome::Stale),
        }
    }

    async fn topic_stats(&self, topic: &str) -> Result<(TopicStats, i64)> {
        let mut conn = self.conn.clone();

        let ready: u64 = conn.zcard(self.key("ready", topic)).await?;
        let delayed: u64 = conn.zcard(self.key("delayed", topic)).await?;
        let processing: u64 = conn.zcard(self.key("processing", topic)).await?;
        let failed: u64 = conn.llen(self.key("dead", topic)).await?;

        let completed: Option<i64> = conn.hget(self.key("stats", topic), "completed").await?;
        let processing_ms: Option<i64> = conn
            .hget(self.key("stats", topic), "processing_ms_total")
            .await?;

        let completed = completed.unwrap_or(0).max(0);
        let processing_ms = processing_ms.unwrap_or(0);

        let stats = TopicStats {
            pending: ready + delayed,
            processing,
            completed: completed as u64,
            failed,
            avg_processing_seconds: if completed > 0 {
                processing_ms as f64 / 1000.0 / completed as f64
            } else {
                0.0
            },
        };

        Ok((stats, processing_ms))
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(format!("{}:topics", self.prefix)).await?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn insert(&self, message: NewMessage) -> Result<String> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let scheduled_at = super::schedule_at(now, message.delay_seconds);
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&message.payload)?;

        let message_id: String = self
            .publish
            .key(format!("{}:ids", self.prefix))
            .key(self.key("ready", &message.topic))
            .key(self.key("delayed", &message.topic))
            .key(format!("{}{}", self.msg_prefix(), id))
            .key(format!("{}:topics", self.prefix))
            .key(format!("{}:seq", self.prefix))
            .arg(&message.message_id)
            .arg(&id)
            .arg(&payload)
            .arg(Self::clamp_priority(message.priority))
            .arg(message.max_retries)
            .arg(now)
            .arg(scheduled_at)
            .arg(&message.topic)
            .invoke_async(&mut conn)
            .await?;

        debug!(
            message_id = %message_id,
            topic = %message.topic,
            priority = message.priority,
            scheduled_at,
            "published message"
        );

        Ok(message_id)
    }

    async fn claim(&self, topic: &str, lease: Duration) -> Result<Option<ClaimedMessage>> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let deadline = now + lease.as_millis() as i64;
        let lease_token = Uuid::new_v4().to_string();

        let row: Option<Vec<String>> = self
            .claim
            .key(self.key("ready", topic))
            .key(self.key("delayed", topic))
            .key(self.key("processing", topic))
            .key(format!("{}:seq", self.prefix))
            .arg(now)
            .arg(deadline)
            .arg(&lease_token)
            .arg(self.msg_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if row.len() != 6 {
            return Err(Error::invalid_parameter("malformed claim reply"));
        }

        let retry_count = row[3]
            .parse::<u32>()
            .map_err(|e| Error::invalid_parameter(format!("retry_count: {e}")))?;
        let max_retries = row[4]
            .parse::<u32>()
            .map_err(|e| Error::invalid_parameter(format!("max_retries: {e}")))?;

        Ok(Some(ClaimedMessage {
            id: row[0].clone(),
            message_id: row[1].clone(),
            payload: serde_json::from_str(&row[2])?,
            retry_count,
            max_retries,
            topic: row[5].clone(),
            lease_token,
        }))
    }

    async fn complete(&self, claim: &ClaimedMessage) -> Result<bool> {
        let mut conn = self.conn.clone();
        let now = now_ms();

        let updated: i64 = self
            .complete
            .key(self.key("processing", &claim.topic))
            .key(format!("{}{}", self.msg_prefix(), claim.id))
            .key(self.key("done", &claim.topic))
            .key(self.key("stats", &claim.topic))
            .arg(&claim.lease_token)
            .arg(now)
            .arg(&claim.id)
            .invoke_async(&mut conn)
            .await?;

        Ok(updated == 1)
    }

    async fn fail(&self, claim: &ClaimedMessage, reason: &str) -> Result<FailOutcome> {
        self.run_fail(
            &claim.topic,
            &claim.id,
            &claim.lease_token,
            claim.retry_count,
            claim.max_retries,
            reason,
        )
        .await
    }

    async fn extend_lease(&self, claim: &ClaimedMessage, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let deadline = now + lease.as_millis() as i64;

        let updated: i64 = self
            .extend
            .key(self.key("processing", &claim.topic))
            .key(format!("{}{}", self.msg_prefix(), claim.id))
            .arg(&claim.lease_token)
            .arg(&claim.id)
            .arg(deadline)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        Ok(updated == 1)
    }

    async fn reap_expired(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let mut reaped = 0u64;

        for topic in self.topics().await? {
            let expired: Vec<String> = conn
                .zrangebyscore_limit(self.key("processing", &topic), "-inf", now, 0, 100)
                .await?;

            for id in expired {
                let key = format!("{}{}", self.msg_prefix(), id);
                let fields: Vec<Option<String>> = redis::cmd("HMGET")
                    .arg(&key)
                    .arg("lease_token")
                    .arg("retry_count")
                    .arg("max_retries")
                    .query_async(&mut conn)
                    .await?;

                let (Some(token), Some(rc), Some(max)) =
                    (&fields[0], &fields[1], &fields[2])
                else {
                    // Hash is gone or lease already released; drop the
                    // orphaned index entry.
                    let _: () = conn.zrem(self.key("processing", &topic), &id).await?;
                    continue;
                };

                let rc = rc.parse::<u32>().unwrap_or(0);
                let max = max.parse::<u32>().unwrap_or(0);

                warn!(id, topic, "lease expired; returning message to retry path");

                if self
                    .run_fail(&topic, &id, token, rc, max, "lease expired")
                    .await?
                    != FailOutcome::Stale
                {
                    reaped += 1;
                }
            }
        }

        Ok(reaped)
    }

    async fn stats(&self, topic: Option<&str>) -> Result<TopicStats> {
        match topic {
            Some(topic) => Ok(self.topic_stats(topic).await?.0),
            None => {
                let mut total = TopicStats::default();
                let mut processing_ms = 0i64;

                for topic in self.topics().await? {
                    let (stats, ms) = self.topic_stats(&topic).await?;
                    total.pending += stats.pending;
                    total.processing += stats.processing;
                    total.completed += stats.completed;
                    total.failed += stats.failed;
                    processing_ms += ms;
                }

                if total.completed > 0 {
                    total.avg_processing_seconds =
                        processing_ms as f64 / 1000.0 / total.completed as f64;
                }

                Ok(total)
            }
        }
    }

    async fn cleanup(&self, cutoff_ms: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;

        for topic in self.topics().await? {
            let done_key = self.key("done", &topic);
            let old: Vec<String> = conn
                .zrangebyscore(&done_key, "-inf", cutoff_ms)
                .await?;

            for id in &old {
                let key = format!("{}{}", self.msg_prefix(), id);
                let message_id: Option<String> = conn.hget(&key, "message_id").await?;
                if let Some(message_id) = message_id {
                    let _: () = conn.hdel(format!("{}:ids", self.prefix), message_id).await?;
                }
                let _: () = conn.del(&key).await?;
                let _: () = conn.zrem(&done_key, id).await?;
                removed += 1;
            }

            // Dead-letter entries are newest-first, so old ones sit at the
            // tail of the list.
            let dead_key = self.key("dead", &topic);
            loop {
                let tail: Option<String> = conn.rpop(&dead_key, None).await?;
                let Some(tail) = tail else {
                    break;
                };
                let entry: DeadLetterEntry = serde_json::from_str(&tail)?;
                if entry.moved_at <= cutoff_ms {
                    removed += 1;
                } else {
                    let _: () = conn.rpush(&dead_key, tail).await?;
                    break;
                }
            }
        }

        Ok(removed)
    }

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = self.conn.clone();

        let raw: Vec<String> = conn.lrange(self.key("dead", topic), 0, -1).await?;

        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(Into::into))
            .collect()
    }

    async fn touch_subscription(&self, topic: &str, subscriber_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.key("subs", topic), subscriber_id, now_ms())
            .await?;
        Ok(())
    }

    async fn subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionRecord>> {
        let mut conn = self.conn.clone();

        let entries: Vec<(String, i64)> = conn.hgetall(self.key("subs", topic)).await?;

        Ok(entries
            .into_iter()
            .map(|(subscriber_id, last_poll_at)| SubscriptionRecord {
                topic: topic.to_owned(),
                subscriber_id,
                last_poll_at,
                is_active: true,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection closes when the last clone drops.
        Ok(())
    }
}
