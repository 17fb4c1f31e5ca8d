use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use relayq::{
    config::{BackendKind, Config},
    error::Error,
    job::{JobPayload, TextTranslationJob},
    message::{FailOutcome, MessageMeta, MessageStatus, NewMessage},
    queue::{PublishOptions, Queue, SubscribeOptions},
    store::{sqlite::SqliteStore, Store},
};
use serde_json::json;
use tempfile::TempDir;

struct TmpQueue {
    queue: Queue,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpQueue {
    type Target = Queue;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

/// SQLite-backed queue on a throwaway database, tuned for fast tests:
/// zero backoff base so retries are immediately claimable.
async fn setup() -> TmpQueue {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let path = tempfile::tempdir().unwrap();

    TmpQueue {
        queue: Queue::connect_with(Config {
            backend: BackendKind::Sqlite,
            db_path: Some(path.path().join("relayq.db").to_string_lossy().to_string()),
            backoff_base_seconds: 0,
            // Tests drive the reaper by hand; keep the background sweep
            // out of the way.
            reaper_interval_ms: 60_000,
            ..Config::default()
        })
        .await
        .unwrap(),
        tmpdir: path,
    }
}

#[tokio::test]
async fn test_claims_by_priority_then_fifo() {
    let queue = setup().await;

    for (id, priority) in [("a", 5), ("b", 1), ("c", 5)] {
        queue
            .publish(
                "jobs",
                json!({ "name": id }),
                PublishOptions {
                    priority,
                    message_id: Some(id.to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let lease = Duration::from_secs(30);
    let mut order = Vec::new();
    while let Some(claim) = queue.store().claim("jobs", lease).await.unwrap() {
        order.push(claim.message_id.clone());
        assert!(queue.store().complete(&claim).await.unwrap());
    }

    assert_eq!(order, vec!["a", "c", "b"]);
}

#[tokio::test]
async fn test_delayed_message_becomes_visible() {
    let queue = setup().await;

    queue
        .publish(
            "jobs",
            json!({}),
            PublishOptions {
                delay_seconds: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let lease = Duration::from_secs(30);
    assert!(queue.store().claim("jobs", lease).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(queue.store().claim("jobs", lease).await.unwrap().is_some());
}

#[tokio::test]
async fn test_duplicate_message_id_is_idempotent() {
    let queue = setup().await;

    let opts = PublishOptions {
        message_id: Some("dup".to_owned()),
        ..Default::default()
    };

    let first = queue.publish("jobs", json!({"n": 1}), opts.clone()).await.unwrap();
    let second = queue.publish("jobs", json!({"n": 2}), opts).await.unwrap();
    assert_eq!(first, second);

    let stats = queue.get_stats(Some("jobs")).await.unwrap();
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_retries_then_dead_letter() {
    let queue = setup().await;

    queue
        .publish(
            "jobs",
            json!({"doc": 7}),
            PublishOptions {
                message_id: Some("doomed".to_owned()),
                max_retries: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let lease = Duration::from_secs(30);

    let claim = queue.store().claim("jobs", lease).await.unwrap().unwrap();
    assert_eq!(claim.retry_count, 0);
    let outcome = queue.store().fail(&claim, "boom").await.unwrap();
    assert!(matches!(outcome, FailOutcome::Retried { .. }));

    // Zero backoff base makes the retry immediately claimable.
    let claim = queue.store().claim("jobs", lease).await.unwrap().unwrap();
    assert_eq!(claim.retry_count, 1);
    let outcome = queue.store().fail(&claim, "boom again").await.unwrap();
    assert_eq!(outcome, FailOutcome::DeadLettered);

    assert!(queue.store().claim("jobs", lease).await.unwrap().is_none());

    let dead = queue.dead_letters("jobs").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message_id, "doomed");
    assert_eq!(dead[0].failure_reason, "boom again");
    assert_eq!(dead[0].retry_count, 2);

    let stats = queue.get_stats(Some("jobs")).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_expired_lease_is_reaped_and_stale_writes_are_ignored() {
    let queue = setup().await;

    queue
        .publish("jobs", json!({}), PublishOptions::default())
        .await
        .unwrap();

    let stale = queue
        .store()
        .claim("jobs", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.store().reap_expired().await.unwrap(), 1);

    // Reclaimed under a fresh lease with the attempt counted.
    let fresh = queue
        .store()
        .claim("jobs", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.retry_count, 1);
    assert_ne!(fresh.lease_token, stale.lease_token);

    // The original worker coming back late must not be able to touch it.
    assert!(!queue.store().complete(&stale).await.unwrap());
    assert!(!queue
        .store()
        .extend_lease(&stale, Duration::from_secs(30))
        .await
        .unwrap());
    assert_eq!(
        queue.store().fail(&stale, "late").await.unwrap(),
        FailOutcome::Stale
    );

    assert!(queue.store().complete(&fresh).await.unwrap());

    let stats = queue.get_stats(Some("jobs")).await.unwrap();
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_cleanup_only_removes_terminal_records() {
    let queue = setup().await;

    for id in ["done", "waiting", "working", "doomed"] {
        queue
            .publish(
                "jobs",
                json!({}),
                PublishOptions {
                    message_id: Some(id.to_owned()),
                    max_retries: if id == "doomed" { Some(0) } else { None },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let lease = Duration::from_secs(30);

    // Ensure the requeue below lands on a later millisecond than the
    // original publishes, keeping the claim order deterministic.
    tokio::time::sleep(Duration::from_millis(5)).await;

    // "done" is the oldest pending message, so it is claimed first.
    let claim = queue.store().claim("jobs", lease).await.unwrap().unwrap();
    assert_eq!(claim.message_id, "done");
    assert!(queue.store().complete(&claim).await.unwrap());

    // "waiting" stays pending; "working" keeps its lease.
    let working = queue.store().claim("jobs", lease).await.unwrap().unwrap();
    assert_eq!(working.message_id, "waiting");
    assert!(queue.store().fail(&working, "requeue").await.unwrap() != FailOutcome::Stale);
    let working = queue.store().claim("jobs", lease).await.unwrap().unwrap();
    assert_eq!(working.message_id, "working");

    let doomed = queue.store().claim("jobs", lease).await.unwrap().unwrap();
    assert_eq!(doomed.message_id, "doomed");
    assert_eq!(
        queue.store().fail(&doomed, "no retries").await.unwrap(),
        FailOutcome::DeadLettered
    );

    let removed = queue.cleanup(0).await.unwrap();
    assert_eq!(removed, 2);

    let stats = queue.get_stats(Some("jobs")).await.unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert!(queue.dead_letters("jobs").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_claimers_never_share_a_message() {
    let queue = Arc::new(setup().await);

    for i in 0..20 {
        queue
            .publish("jobs", json!({ "i": i }), PublishOptions::default())
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(claim) = queue
                .store()
                .claim("jobs", Duration::from_secs(30))
                .await
                .unwrap()
            {
                seen.push(claim.message_id.clone());
                assert!(queue.store().complete(&claim).await.unwrap());
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
async fn test_subscribe_delivers_and_completes() {
    let queue = setup().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let handle = queue.subscribe(
        "jobs",
        move |payload: serde_json::Value, meta: MessageMeta| {
            let tx = tx.clone();
            async move {
                tx.send((meta.message_id, payload)).unwrap();
                Ok::<(), eyre::Report>(())
            }
        },
        SubscribeOptions {
            poll_interval_ms: Some(10),
            subscriber_id: Some("worker-1".to_owned()),
            ..Default::default()
        },
    );

    queue
        .publish(
            "jobs",
            json!({ "doc": 42 }),
            PublishOptions {
                message_id: Some("m1".to_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (message_id, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id, "m1");
    assert_eq!(payload, json!({ "doc": 42 }));

    // Completion is asynchronous relative to the handler; poll for it.
    let mut completed = 0;
    for _ in 0..200 {
        completed = queue.get_stats(Some("jobs")).await.unwrap().completed;
        if completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(completed, 1);

    let subs = queue.subscriptions("jobs").await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].subscriber_id, "worker-1");
    assert!(subs[0].is_active);

    handle.shutdown().await;
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_handler_dead_letters() {
    let queue = setup().await;

    let handle = queue.subscribe(
        "jobs",
        |_payload: serde_json::Value, _meta: MessageMeta| async move {
            Err(eyre::eyre!("cannot process"))
        },
        SubscribeOptions {
            poll_interval_ms: Some(10),
            ..Default::default()
        },
    );

    queue
        .publish(
            "jobs",
            json!({}),
            PublishOptions {
                message_id: Some("m1".to_owned()),
                max_retries: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut dead = Vec::new();
    for _ in 0..500 {
        dead = queue.dead_letters("jobs").await.unwrap();
        if !dead.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message_id, "m1");
    assert_eq!(dead[0].failure_reason, "cannot process");

    handle.shutdown().await;
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_stats_aggregate_across_topics() {
    let queue = setup().await;

    queue
        .publish("alpha", json!({}), PublishOptions::default())
        .await
        .unwrap();
    queue
        .publish("beta", json!({}), PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(queue.get_stats(Some("alpha")).await.unwrap().pending, 1);
    assert_eq!(queue.get_stats(None).await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_typed_payload_round_trips_through_the_queue() {
    let queue = setup().await;

    let job = JobPayload::TextTranslation(TextTranslationJob {
        text: "hello".to_owned(),
        source_language: "en".to_owned(),
        target_language: "de".to_owned(),
        style: None,
    });

    queue
        .publish("translations", &job, PublishOptions::default())
        .await
        .unwrap();

    let claim = queue
        .store()
        .claim("translations", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(JobPayload::from_value(claim.payload.clone()).unwrap(), job);
}

#[tokio::test]
async fn test_empty_topic_is_rejected() {
    let queue = setup().await;

    let err = queue
        .publish("", json!({}), PublishOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("topic"));
}

#[tokio::test]
async fn test_operations_after_close_are_rejected() {
    let queue = setup().await;

    queue.close().await.unwrap();

    assert!(matches!(
        queue
            .publish("jobs", json!({}), PublishOptions::default())
            .await,
        Err(Error::Closed)
    ));
    assert!(matches!(queue.get_stats(None).await, Err(Error::Closed)));
    assert!(matches!(queue.cleanup(0).await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_message_row_reflects_lifecycle() {
    use std::str::FromStr;

    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::connect(&Config {
        db_path: Some(dir.path().join("relayq.db").to_string_lossy().to_string()),
        ..Config::default()
    })
    .await
    .unwrap();

    store
        .insert(NewMessage {
            topic: "jobs".to_owned(),
            message_id: "m1".to_owned(),
            payload: json!({ "n": 1 }),
            priority: 3,
            max_retries: 3,
            delay_seconds: 0,
        })
        .await
        .unwrap();

    let row = store.message("m1").await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Pending);
    assert_eq!(row.priority, 3);
    assert!(row.lease_token.is_none());

    let claim = store
        .claim("jobs", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let row = store.message("m1").await.unwrap().unwrap();
    assert_eq!(row.status.to_string(), "processing");
    assert_eq!(row.lease_token.as_deref(), Some(claim.lease_token.as_str()));
    assert!(row.claimed_at.is_some());

    assert!(store.complete(&claim).await.unwrap());

    let row = store.message("m1").await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::from_str("completed").unwrap());
    assert!(row.processed_at.is_some());
    assert!(row.lease_token.is_none());

    assert!(store.message("unknown").await.unwrap().is_none());
}
