//! Behaviour every `TaskStore` must show. Each adapter's test module runs
//! these against its own instance.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ulid::Ulid;

use crate::domain::{
    Job, JobCounts, JobId, JobStatus, NewTask, Payload, SendOutcome, Task, TaskId, TaskStatus,
};
use crate::error::StoreError;
use crate::ports::TaskStore;

pub(crate) fn nine_am() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

pub(crate) async fn seed_job<S: TaskStore + ?Sized>(store: &S, dues: &[DateTime<Utc>]) -> (JobId, Vec<TaskId>) {
    let job = Job::new(JobId::from_ulid(Ulid::new()), "seed", nine_am());
    store.insert_job(&job).await.unwrap();
    let tasks: Vec<Task> = dues
        .iter()
        .enumerate()
        .map(|(i, due)| {
            Task::new(
                TaskId::from_ulid(Ulid::new()),
                job.id,
                NewTask::new(Payload::new(format!("user{i}@example.com"), "hello"), *due),
                nine_am(),
            )
        })
        .collect();
    store.insert_tasks(&tasks).await.unwrap();
    (job.id, tasks.iter().map(|t| t.id).collect())
}

pub(crate) async fn claims_oldest_due_first<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    // inserted out of order on purpose
    let dues = [t0 + Duration::minutes(2), t0, t0 + Duration::minutes(1)];
    let (_, ids) = seed_job(store, &dues).await;
    let now = t0 + Duration::minutes(5);

    let first = store.claim_next_due(now).await.unwrap().unwrap();
    let second = store.claim_next_due(now).await.unwrap().unwrap();
    let third = store.claim_next_due(now).await.unwrap().unwrap();

    assert_eq!(
        vec![first.id, second.id, third.id],
        vec![ids[1], ids[2], ids[0]]
    );
    // pre-update snapshot
    assert_eq!(first.status, TaskStatus::Pending);
    assert!(store.claim_next_due(now).await.unwrap().is_none());

    let stored = store.get_task(first.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Processing);
    assert_eq!(stored.claimed_at, Some(now));
}

pub(crate) async fn claim_skips_future_deleted_and_claimed<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let (_, ids) = seed_job(store, &[t0, t0 + Duration::hours(1), t0]).await;

    assert!(store.soft_delete_task(ids[0]).await.unwrap());
    assert!(!store.soft_delete_task(ids[0]).await.unwrap());

    let claimed = store.claim_next_due(t0).await.unwrap().unwrap();
    assert_eq!(claimed.id, ids[2]);

    // ids[1] is not due yet, ids[2] is already processing
    assert!(store.claim_next_due(t0).await.unwrap().is_none());
    assert!(
        store
            .claim_next_due(t0 + Duration::hours(1))
            .await
            .unwrap()
            .is_some()
    );
}

pub(crate) async fn concurrent_claims_are_exclusive<S: TaskStore + 'static>(store: Arc<S>) {
    let t0 = nine_am();
    seed_job(&*store, &[t0]).await;

    let mut joins = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        joins.push(tokio::spawn(async move { store.claim_next_due(t0).await }));
    }

    let mut winners = 0;
    for join in joins {
        if join.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

pub(crate) async fn outcome_only_lands_on_processing_tasks<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let (_, ids) = seed_job(store, &[t0, t0]).await;
    let done_at = t0 + Duration::minutes(1);

    // still pending: refused
    assert!(
        !store
            .record_outcome(ids[0], &SendOutcome::Sent, done_at)
            .await
            .unwrap()
    );

    let a = store.claim_next_due(t0).await.unwrap().unwrap();
    let b = store.claim_next_due(t0).await.unwrap().unwrap();

    assert!(store.record_outcome(a.id, &SendOutcome::Sent, done_at).await.unwrap());
    assert!(
        store
            .record_outcome(b.id, &SendOutcome::failed("invalid_grant"), done_at)
            .await
            .unwrap()
    );
    // second record for the same claim is a no-op
    assert!(
        !store
            .record_outcome(a.id, &SendOutcome::failed("late"), done_at)
            .await
            .unwrap()
    );

    let a = store.get_task(a.id).await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Sent);
    assert_eq!(a.completed_at, Some(done_at));
    assert_eq!(a.failure_reason, None);

    let b = store.get_task(b.id).await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.failure_reason.as_deref(), Some("invalid_grant"));
}

pub(crate) async fn counts_ignore_soft_deleted<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let (job_id, ids) = seed_job(store, &[t0, t0, t0]).await;

    let claimed = store.claim_next_due(t0).await.unwrap().unwrap();
    store
        .record_outcome(claimed.id, &SendOutcome::Sent, t0)
        .await
        .unwrap();
    assert_eq!(store.count_by_status(job_id, TaskStatus::Sent).await.unwrap(), 1);
    assert_eq!(store.count_all(job_id).await.unwrap(), 3);

    store.soft_delete_task(claimed.id).await.unwrap();
    assert_eq!(store.count_by_status(job_id, TaskStatus::Sent).await.unwrap(), 0);
    assert_eq!(store.count_all(job_id).await.unwrap(), 2);

    let listed: Vec<TaskId> = store
        .list_tasks(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(!listed.contains(&claimed.id));
    assert!(ids.iter().any(|id| listed.contains(id)));
}

pub(crate) async fn claim_task_accepts_pending_and_failed_only<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let later = t0 + Duration::days(1);
    let (_, ids) = seed_job(store, &[later, t0]).await;

    // not due yet, still claimable by id
    let snapshot = store.claim_task(ids[0], t0).await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Pending);
    // already processing
    assert!(store.claim_task(ids[0], t0).await.unwrap().is_none());

    store
        .record_outcome(ids[0], &SendOutcome::failed("bounce"), t0)
        .await
        .unwrap();
    let retried = store.claim_task(ids[0], t0).await.unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Failed);

    store.record_outcome(ids[0], &SendOutcome::Sent, t0).await.unwrap();
    assert!(store.claim_task(ids[0], t0).await.unwrap().is_none());

    store.soft_delete_task(ids[1]).await.unwrap();
    assert!(store.claim_task(ids[1], t0).await.unwrap().is_none());
    assert!(
        store
            .claim_task(TaskId::from_ulid(Ulid::new()), t0)
            .await
            .unwrap()
            .is_none()
    );
}

pub(crate) async fn requeue_stale_returns_old_claims_to_pending<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let (_, ids) = seed_job(store, &[t0, t0]).await;

    let old = store.claim_next_due(t0).await.unwrap().unwrap();
    let fresh = store
        .claim_next_due(t0 + Duration::minutes(30))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(old.id, fresh.id);

    let requeued = store
        .requeue_stale(t0 + Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let old = store.get_task(old.id).await.unwrap().unwrap();
    assert_eq!(old.status, TaskStatus::Pending);
    assert_eq!(old.claimed_at, None);
    assert_eq!(
        store.get_task(fresh.id).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );

    // claimable again
    let again = store.claim_next_due(t0 + Duration::hours(1)).await.unwrap().unwrap();
    assert!(ids.contains(&again.id));
    assert_eq!(again.id, old.id);
}

pub(crate) async fn job_transitions_are_conditional<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let (job_id, _) = seed_job(store, &[]).await;

    assert!(
        store
            .transition_job(job_id, JobStatus::Draft, JobStatus::Scheduled, t0)
            .await
            .unwrap()
    );
    assert!(
        !store
            .transition_job(job_id, JobStatus::Draft, JobStatus::Scheduled, t0)
            .await
            .unwrap()
    );

    let counts = JobCounts {
        total: 4,
        sent: 1,
        failed: 2,
    };
    store.write_job_counts(job_id, counts, t0).await.unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.counts, counts);

    let active = store.jobs_with_status(&JobStatus::ACTIVE).await.unwrap();
    assert_eq!(active.len(), 1);
    assert!(store.jobs_with_status(&[JobStatus::Paused]).await.unwrap().is_empty());

    let missing = JobId::from_ulid(Ulid::new());
    assert!(store.write_job_counts(missing, counts, t0).await.is_err());
}

pub(crate) async fn tasks_for_unknown_job_are_rejected<S: TaskStore + ?Sized>(store: &S) {
    let t0 = nine_am();
    let (known, _) = seed_job(store, &[]).await;
    let missing = JobId::from_ulid(Ulid::new());
    let task = |job_id: JobId| {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            job_id,
            NewTask::new(Payload::new("orphan@example.com", "hello"), t0),
            t0,
        )
    };
    let (good, orphan) = (task(known), task(missing));

    let result = store.insert_tasks(&[good.clone(), orphan.clone()]).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(id)) if id == missing));
    // all or nothing
    assert!(store.get_task(good.id).await.unwrap().is_none());
    assert!(store.get_task(orphan.id).await.unwrap().is_none());
    assert!(store.claim_next_due(t0).await.unwrap().is_none());
}

pub(crate) async fn timestamps_round_trip_exactly<S: TaskStore + ?Sized>(store: &S) {
    let due = nine_am() + Duration::microseconds(800);
    let (_, ids) = seed_job(store, &[due]).await;

    let stored = store.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.due_at, due);

    // same millisecond, still before due
    let early = nine_am() + Duration::microseconds(100);
    assert!(store.claim_next_due(early).await.unwrap().is_none());

    let claimed = store.claim_next_due(due).await.unwrap().unwrap();
    assert_eq!(claimed.id, ids[0]);
    let stored = store.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.claimed_at, Some(due));
}
