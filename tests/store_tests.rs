use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use jobq::{Job, JobStatus, ListFilter, MemoryStore, Store, StoreError, RETRY_BACKOFF};

#[tokio::test]
async fn concurrent_claimers_never_share_a_job() {
    let store = Arc::new(MemoryStore::new());

    let mut ids = HashSet::new();
    for _ in 0..5 {
        let job = Job::new("work", json!({}));
        ids.insert(job.id);
        store.enqueue(job).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move { store.claim_next().await.unwrap() }));
    }

    let mut claimed = Vec::new();
    let mut empty = 0;
    for task in tasks {
        match task.await.unwrap() {
            Some(job) => claimed.push(job.id),
            None => empty += 1,
        }
    }

    assert_eq!(claimed.len(), 5);
    assert_eq!(empty, 5);
    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(distinct.len(), 5, "a job was claimed twice");
    assert_eq!(distinct, ids);
}

#[tokio::test]
async fn claim_increments_attempts_by_exactly_one() {
    let store = MemoryStore::new();
    let job = Job::new("work", json!({}));
    let id = job.id;
    store.enqueue(job).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 1);
    assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 1);

    // A second poll finds nothing; the row is running.
    assert!(store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn retry_defers_by_the_fixed_backoff() {
    let store = MemoryStore::new();
    let job = Job::new("work", json!({}));
    let id = job.id;
    store.enqueue(job).await.unwrap();

    let before = Utc::now();
    store.claim_next().await.unwrap().unwrap();
    store.mark_retry(id, "boom", None).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retry);
    assert_eq!(job.last_error.as_deref(), Some("boom"));

    let backoff = chrono::Duration::from_std(RETRY_BACKOFF).unwrap();
    assert!(job.run_at >= before + backoff - chrono::Duration::seconds(1));
    assert!(job.run_at > before);

    // Not eligible again until the backoff elapses.
    assert!(store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_jobs_are_never_claimable() {
    let store = MemoryStore::new();

    let failed = Job::new("work", json!({}));
    let failed_id = failed.id;
    store.enqueue(failed).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_failed(failed_id, "dead").await.unwrap();

    let done = Job::new("work", json!({}));
    let done_id = done.id;
    store.enqueue(done).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_done(done_id).await.unwrap();

    assert!(store.claim_next().await.unwrap().is_none());
    assert_eq!(
        store.get(failed_id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
    let done = store.get(done_id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.last_error.is_none());
}

#[tokio::test]
async fn mark_pending_restores_eligibility() {
    let store = MemoryStore::new();
    let job = Job::new("work", json!({})).with_run_at(Utc::now() + chrono::Duration::hours(1));
    let id = job.id;
    store.enqueue(job).await.unwrap();

    assert!(store.claim_next().await.unwrap().is_none());

    store.mark_pending(id, None).await.unwrap();
    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

#[tokio::test]
async fn cancel_is_terminal_from_every_status() {
    let store = MemoryStore::new();

    let running = Job::new("work", json!({}));
    let running_id = running.id;
    store.enqueue(running).await.unwrap();

    let retrying = Job::new("work", json!({}));
    let retrying_id = retrying.id;
    store.enqueue(retrying).await.unwrap();

    store.claim_next().await.unwrap().unwrap();
    store.claim_next().await.unwrap().unwrap();
    store.mark_retry(retrying_id, "transient", None).await.unwrap();

    let pending = Job::new("work", json!({})).with_run_at(Utc::now() + chrono::Duration::hours(1));
    let pending_id = pending.id;
    store.enqueue(pending).await.unwrap();

    for id in [running_id, retrying_id, pending_id] {
        store.cancel(id, "cancelled by operator", None).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("cancelled by operator"));
    }

    assert!(store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_job_transitions_are_not_found() {
    let store = MemoryStore::new();
    let ghost = Job::new("ghost", json!({})).id;

    assert!(matches!(store.mark_done(ghost).await, Err(StoreError::NotFound)));
    assert!(matches!(
        store.mark_pending(ghost, None).await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        store.cancel(ghost, "x", None).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn list_is_newest_first_and_paginated() {
    let store = MemoryStore::new();

    let mut ids = Vec::new();
    for n in 0..3 {
        let job = Job::new(format!("job_{n}"), json!({}));
        ids.push(job.id);
        store.enqueue(job).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let listed = store.list(ListFilter::default()).await.unwrap();
    let listed_ids: Vec<_> = listed.iter().map(|j| j.id).collect();
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(listed_ids, expected);

    let page = store
        .list(ListFilter {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, ids[1]);
}

#[tokio::test]
async fn list_filters_by_status() {
    let store = MemoryStore::new();

    let keep = Job::new("keep", json!({}));
    store.enqueue(keep).await.unwrap();

    let fail = Job::new("fail", json!({}));
    let fail_id = fail.id;
    store.enqueue(fail).await.unwrap();
    store.cancel(fail_id, "no", None).await.unwrap();

    let failed = store
        .list(ListFilter {
            status: Some(JobStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, fail_id);
}

#[tokio::test]
async fn counts_and_metrics_track_transitions() {
    let store = MemoryStore::new();

    let done = Job::new("a", json!({}));
    let done_id = done.id;
    store.enqueue(done).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_done(done_id).await.unwrap();

    let failed = Job::new("b", json!({}));
    let failed_id = failed.id;
    store.enqueue(failed).await.unwrap();
    store.cancel(failed_id, "no", None).await.unwrap();

    let scheduled_at = Utc::now() + chrono::Duration::minutes(30);
    let pending = Job::new("c", json!({})).with_run_at(scheduled_at);
    store.enqueue(pending).await.unwrap();

    let counts = store.count_by_status(None).await.unwrap();
    assert_eq!(counts.get(&JobStatus::Done), Some(&1));
    assert_eq!(counts.get(&JobStatus::Failed), Some(&1));
    assert_eq!(counts.get(&JobStatus::Pending), Some(&1));

    let metrics = store.metrics(None).await.unwrap();
    assert_eq!(metrics.total, 3);
    assert_eq!(metrics.done, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.pending, 1);
    assert_eq!(metrics.done_last_hour, 1);
    assert_eq!(metrics.failed_last_hour, 1);
    assert_eq!(metrics.next_scheduled, Some(scheduled_at));
}
