//! Public queue facade.
//!
//! A [`Queue`] owns one configured store handle plus the lease-expiry
//! reaper task. The backend is chosen from [`Config`] when connecting;
//! nothing downstream ever branches on it again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::message::{DeadLetterEntry, NewMessage, SubscriptionRecord, TopicStats};
use crate::retry::RetryPolicy;
use crate::store::{memory::MemoryStore, redis::RedisStore, sqlite::SqliteStore, Store};
use crate::worker::{self, Handler, SubscriptionHandle, WorkerOptions};

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Higher priority is served first. Default 0.
    pub priority: i64,
    /// The message is not claimable until this many seconds have passed.
    pub delay_seconds: u64,
    /// Idempotency key; generated when absent. Publishing the same key
    /// twice is a no-op.
    pub message_id: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Number of worker slots claiming and processing distinct messages
    /// concurrently.
    pub concurrency: usize,
    pub poll_interval_ms: Option<u64>,
    pub lease_seconds: Option<u64>,
    pub subscriber_id: Option<String>,
    /// Automatically extend the lease while the handler is still running.
    pub heartbeat: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval_ms: None,
            lease_seconds: None,
            subscriber_id: None,
            heartbeat: false,
        }
    }
}

pub struct Queue {
    store: Arc<dyn Store>,
    config: Config,
    root: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Queue {
    pub async fn connect() -> Result<Self> {
        let config = Config::load().map_err(|e| Error::config(e.to_string()))?;
        Self::connect_with(config).await
    }

    pub async fn connect_with(config: Config) -> Result<Self> {
        let store: Arc<dyn Store> = match config.backend {
            BackendKind::Sqlite => Arc::new(SqliteStore::connect(&config).await?),
            BackendKind::Redis => Arc::new(RedisStore::connect(&config).await?),
            BackendKind::Memory => Arc::new(MemoryStore::new(RetryPolicy::new(
                config.backoff_base_seconds,
                config.backoff_cap_seconds,
            ))),
        };

        let root = CancellationToken::new();
        let reaper = tokio::spawn(reaper_loop(
            store.clone(),
            Duration::from_millis(config.reaper_interval_ms),
            root.child_token(),
        ));

        info!(backend = ?config.backend, "queue connected");

        Ok(Self {
            store,
            config,
            root,
            reaper: Mutex::new(Some(reaper)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Direct access to the backing store, mainly for tests and operator
    /// tooling.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Durably enqueue a message. Returns once the write is persistent;
    /// a storage error is surfaced to the caller, who owns any
    /// producer-side retry.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Serialize,
        opts: PublishOptions,
    ) -> Result<String> {
        self.ensure_open()?;

        if topic.is_empty() {
            return Err(Error::invalid_parameter("topic must not be empty"));
        }

        let message_id = opts
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.store
            .insert(NewMessage {
                topic: topic.to_owned(),
                message_id,
                payload: serde_json::to_value(payload)?,
                priority: opts.priority,
                max_retries: opts.max_retries.unwrap_or(self.config.default_max_retries),
                delay_seconds: opts.delay_seconds,
            })
            .await
    }

    /// Start a poll loop delivering messages on `topic` to `handler`.
    /// Workers stop when the handle is shut down or the queue is closed.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Handler,
        opts: SubscribeOptions,
    ) -> SubscriptionHandle {
        let subscriber_id = opts
            .subscriber_id
            .unwrap_or_else(|| format!("{topic}-{}", Uuid::new_v4()));

        let worker_opts = WorkerOptions {
            topic: topic.to_owned(),
            subscriber_id,
            concurrency: opts.concurrency,
            poll_interval: Duration::from_millis(
                opts.poll_interval_ms
                    .unwrap_or(self.config.default_poll_interval_ms),
            ),
            lease: Duration::from_secs(
                opts.lease_seconds
                    .unwrap_or(self.config.default_lease_seconds),
            ),
            heartbeat: opts.heartbeat,
        };

        worker::spawn_subscription(
            self.store.clone(),
            Arc::new(handler),
            worker_opts,
            &self.root,
        )
    }

    /// Counts by status plus average processing seconds, for one topic or
    /// aggregated over all of them.
    pub async fn get_stats(&self, topic: Option<&str>) -> Result<TopicStats> {
        self.ensure_open()?;
        self.store.stats(topic).await
    }

    /// Remove terminal records older than the given number of days.
    /// Pending and processing messages are never touched.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        self.ensure_open()?;
        let cutoff = crate::store::now_ms() - i64::from(older_than_days) * 86_400_000;
        self.store.cleanup(cutoff).await
    }

    /// Dead-letter entries for a topic, newest first.
    pub async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetterEntry>> {
        self.ensure_open()?;
        self.store.dead_letters(topic).await
    }

    /// Soft-state subscriber liveness records for a topic.
    pub async fn subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionRecord>> {
        self.ensure_open()?;
        self.store.subscriptions(topic).await
    }

    /// Stop all subscriptions spawned from this queue, stop the reaper,
    /// and release store connections. Operations after close return
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.root.cancel();

        let reaper = self.reaper.lock().expect("reaper lock").take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        self.store.close().await
    }
}

/// Periodic sweep returning expired leases to the retry path. Fail-open:
/// a failed sweep is logged and retried on the next tick.
async fn reaper_loop(store: Arc<dyn Store>, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match store.reap_expired().await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "reaped expired leases"),
            Err(e) => error!(error = %e, "lease reaper sweep failed"),
        }
    }
}
