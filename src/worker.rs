//! Subscription poll loops.
//!
//! Each subscription runs `concurrency` independent worker tasks that
//! claim and process distinct messages. The sleep between empty polls is
//! the only client-side blocking point; after a successful claim the
//! worker polls again immediately.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::message::{ClaimedMessage, MessageMeta};
use crate::store::Store;

/// A subscription message handler. Normal return acknowledges the
/// message; an error (or panic) routes it through the retry/dead-letter
/// path. Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, payload: serde_json::Value, meta: MessageMeta) -> eyre::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(serde_json::Value, MessageMeta) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value, meta: MessageMeta) -> eyre::Result<()> {
        (self)(payload, meta).await
    }
}

#[derive(Clone)]
pub(crate) struct WorkerOptions {
    pub topic: String,
    pub subscriber_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub heartbeat: bool,
}

/// Handle to a running subscription. Dropping it does not stop the
/// workers; call [`SubscriptionHandle::shutdown`] (or close the queue).
pub struct SubscriptionHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Signal the workers to stop after their current message.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stop the workers and wait for them to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub(crate) fn spawn_subscription(
    store: Arc<dyn Store>,
    handler: Arc<dyn Handler>,
    opts: WorkerOptions,
    parent: &CancellationToken,
) -> SubscriptionHandle {
    let token = parent.child_token();

    let tasks = (0..opts.concurrency.max(1))
        .map(|slot| {
            tokio::spawn(worker_loop(
                store.clone(),
                handler.clone(),
                opts.clone(),
                token.clone(),
                slot,
            ))
        })
        .collect();

    SubscriptionHandle { token, tasks }
}

async fn worker_loop(
    store: Arc<dyn Store>,
    handler: Arc<dyn Handler>,
    opts: WorkerOptions,
    token: CancellationToken,
    slot: usize,
) {
    info!(
        topic = %opts.topic,
        subscriber_id = %opts.subscriber_id,
        slot,
        "worker started"
    );

    while !token.is_cancelled() {
        if let Err(e) = store
            .touch_subscription(&opts.topic, &opts.subscriber_id)
            .await
        {
            debug!(topic = %opts.topic, error = %e, "failed to touch subscription record");
        }

        match store.claim(&opts.topic, opts.lease).await {
            Ok(Some(claim)) => {
                process(&store, handler.as_ref(), claim, &opts).await;
            }
            Ok(None) => {
                sleep_or_cancel(&token, opts.poll_interval).await;
            }
            Err(e) => {
                error!(topic = %opts.topic, error = %e, "claim failed");
                sleep_or_cancel(&token, opts.poll_interval).await;
            }
        }
    }

    info!(
        topic = %opts.topic,
        subscriber_id = %opts.subscriber_id,
        slot,
        "worker stopped"
    );
}

async fn process(
    store: &Arc<dyn Store>,
    handler: &dyn Handler,
    claim: ClaimedMessage,
    opts: &WorkerOptions,
) {
    let meta = MessageMeta {
        message_id: claim.message_id.clone(),
        topic: claim.topic.clone(),
        attempt: claim.retry_count + 1,
    };

    let heartbeat = opts
        .heartbeat
        .then(|| spawn_heartbeat(store.clone(), claim.clone(), opts.lease));

    let result = AssertUnwindSafe(handler.handle(claim.payload.clone(), meta))
        .catch_unwind()
        .await;

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    match result {
        Ok(Ok(())) => match store.complete(&claim).await {
            Ok(true) => {
                debug!(message_id = %claim.message_id, topic = %claim.topic, "message completed");
            }
            Ok(false) => {
                // Lease expired and someone else owns the message now;
                // our completion must not apply.
                debug!(
                    message_id = %claim.message_id,
                    topic = %claim.topic,
                    "lease no longer current; completion skipped"
                );
            }
            Err(e) => {
                error!(message_id = %claim.message_id, error = %e, "completion write failed");
            }
        },
        Ok(Err(e)) => {
            if let Err(e) = store.fail(&claim, &e.to_string()).await {
                error!(message_id = %claim.message_id, error = %e, "failure write failed");
            }
        }
        Err(_) => {
            if let Err(e) = store.fail(&claim, "handler panicked").await {
                error!(message_id = %claim.message_id, error = %e, "failure write failed");
            }
        }
    }
}

fn spawn_heartbeat(
    store: Arc<dyn Store>,
    claim: ClaimedMessage,
    lease: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = (lease / 2).max(Duration::from_millis(100));
        loop {
            tokio::time::sleep(interval).await;
            match store.extend_lease(&claim, lease).await {
                Ok(true) => {
                    debug!(message_id = %claim.message_id, "lease extended");
                }
                Ok(false) => break,
                Err(e) => {
                    error!(message_id = %claim.message_id, error = %e, "lease extension failed");
                    break;
                }
            }
        }
    })
}

async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
