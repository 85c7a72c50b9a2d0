//! Exercises the Redis store against a live server.
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use chrono::Utc;
use dispatchr::{
    FailureReason, Job, JobState, JobStore, QueueOptions, RedisJobStore, Transition,
};
use std::{sync::Arc, time::Duration};

async fn store() -> RedisJobStore {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisJobStore::new(QueueOptions {
        redis_url,
        // Fresh namespace per test run.
        key_prefix: format!("dispatchr-test-{}", uuid::Uuid::new_v4()),
        redis_instance: None,
    })
    .await
    .expect("redis must be reachable for ignored tests")
}

const TTL: Duration = Duration::from_secs(30);

#[tokio::test]
#[ignore]
async fn lease_retry_and_complete() {
    let store = store().await;
    let now = Utc::now();
    let job = Job::new("http://localhost/hook", "ping", vec![1, 2, 255], 3, now);
    let id = store.enqueue(job).await.unwrap();

    let leased = store.lease_next("w1", now, TTL).await.unwrap().unwrap();
    assert_eq!(leased.job.id, id);
    assert_eq!(leased.job.state, JobState::Running);
    assert_eq!(leased.job.attempts, 1);
    assert_eq!(leased.job.payload, vec![1, 2, 255]);
    assert!(store.lease_next("w2", now, TTL).await.unwrap().is_none());

    let retry_at = now + chrono::Duration::seconds(5);
    store
        .finish(
            &leased.lease,
            &Transition::Retry {
                next_attempt_at: retry_at,
                error: "request failed with status: 503".to_string(),
            },
            now,
        )
        .await
        .unwrap();
    assert!(store.lease_next("w1", now, TTL).await.unwrap().is_none());

    let again = store.lease_next("w2", retry_at, TTL).await.unwrap().unwrap();
    assert_eq!(again.job.attempts, 2);
    assert_eq!(
        again.job.last_error.as_deref(),
        Some("request failed with status: 503")
    );

    store
        .finish(&again.lease, &Transition::Complete, retry_at)
        .await
        .unwrap();
    let done = store.get(&id).await.unwrap().unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert!(done.last_error.is_none());
    assert!(done.lease_owner.is_none());
}

#[tokio::test]
#[ignore]
async fn stale_lease_is_rejected_after_expiry() {
    let store = store().await;
    let now = Utc::now();
    let id = store
        .enqueue(Job::new("http://localhost/hook", "ping", Vec::new(), 3, now))
        .await
        .unwrap();

    let first = store.lease_next("w1", now, TTL).await.unwrap().unwrap();
    let later = now + chrono::Duration::seconds(31);
    let second = store.lease_next("w2", later, TTL).await.unwrap().unwrap();
    assert_eq!(second.job.id, id);
    assert_eq!(second.job.attempts, 2);

    let err = store
        .finish(&first.lease, &Transition::Complete, later)
        .await
        .unwrap_err();
    assert!(err.is_contention());

    store
        .finish(
            &second.lease,
            &Transition::Fail {
                reason: FailureReason::Rejected,
                error: "unexpected status code: 301".to_string(),
            },
            later,
        )
        .await
        .unwrap();
    let failed = store.get(&id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::Rejected));
}

#[tokio::test]
#[ignore]
async fn concurrent_leases_are_exclusive() {
    let store = Arc::new(store().await);
    let now = Utc::now();
    store
        .enqueue(Job::new("http://localhost/hook", "ping", Vec::new(), 3, now))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.lease_next(&format!("w{}", n), now, TTL).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get_stats().await.unwrap().running, 1);
}

#[tokio::test]
#[ignore]
async fn expired_lease_on_final_attempt_exhausts_the_job() {
    let store = store().await;
    let now = Utc::now();
    let id = store
        .enqueue(Job::new("http://localhost/hook", "ping", Vec::new(), 1, now))
        .await
        .unwrap();

    let leased = store.lease_next("w1", now, TTL).await.unwrap().unwrap();
    assert_eq!(leased.job.attempts, 1);

    let later = now + chrono::Duration::seconds(31);
    assert_eq!(store.reclaim_expired(later).await.unwrap(), 1);
    assert!(store.lease_next("w2", later, TTL).await.unwrap().is_none());

    let failed = store.get(&id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::Exhausted));
    assert_eq!(
        failed.last_error.as_deref(),
        Some("lease expired during final attempt")
    );
    assert!(failed.lease_owner.is_none());

    let err = store
        .finish(&leased.lease, &Transition::Complete, later)
        .await
        .unwrap_err();
    assert!(err.is_contention());
}

#[tokio::test]
#[ignore]
async fn expired_lease_with_attempts_left_is_requeued() {
    let store = store().await;
    let now = Utc::now();
    let id = store
        .enqueue(Job::new("http://localhost/hook", "ping", Vec::new(), 3, now))
        .await
        .unwrap();

    store.lease_next("w1", now, TTL).await.unwrap().unwrap();
    let later = now + chrono::Duration::seconds(31);
    assert_eq!(store.reclaim_expired(later).await.unwrap(), 1);

    let requeued = store.get(&id).await.unwrap().unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(store.get_stats().await.unwrap().ready, 1);
}
