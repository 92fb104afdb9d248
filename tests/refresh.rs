// file: tests/refresh.rs
//! Tests for batched attendee refreshes.

mod common;

use crate::common::{build_engine, immediate_config, organizer_fixture, setup_tracing, Call, FakeScheduler};
use itipkeeper::{run_job, JobRun, SkipReason, Store, WorkOutcome, WorkQueueConfig, WorkType};

fn batch_config(batch: usize) -> WorkQueueConfig {
  WorkQueueConfig {
    attendee_refresh_batch: batch,
    ..immediate_config()
  }
}

fn attendees(list: &[&str]) -> Vec<String> {
  list.iter().map(|a| a.to_string()).collect()
}

fn queued_refresh_jobs(store: &Store) -> Vec<u64> {
  let mut jobs: Vec<u64> = store
    .jobs()
    .into_iter()
    .filter(|job| job.work_type == WorkType::Refresh)
    .map(|job| job.job_id)
    .collect();
  jobs.sort_unstable();
  jobs
}

#[tokio::test]
async fn test_trigger_records_only_new_attendees() {
  setup_tracing();
  let store = Store::new();
  let engine = build_engine(&FakeScheduler::new(), batch_config(5));
  let (_home, resource) = organizer_fixture(&store, "refresh-1", &["mailto:a@example.com"]);

  let mut txn = store.begin();
  engine.refresh_attendees(
    &mut txn,
    &resource,
    &attendees(&["mailto:a@example.com", "mailto:b@example.com", "mailto:a@example.com"]),
  );
  engine.refresh_attendees(
    &mut txn,
    &resource,
    &attendees(&["mailto:b@example.com", "mailto:c@example.com"]),
  );
  txn.commit();

  assert_eq!(
    store.pending_attendees(resource.id),
    attendees(&["mailto:a@example.com", "mailto:b@example.com", "mailto:c@example.com"])
  );
  assert_eq!(queued_refresh_jobs(&store).len(), 2, "Every trigger queues a drain");
  assert_eq!(engine.tracker().in_flight(), 2);
}

#[tokio::test]
async fn test_older_refresh_is_superseded_and_newest_drains_in_batches() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, batch_config(2));
  let (_home, resource) = organizer_fixture(&store, "refresh-2", &[]);

  let mut txn = store.begin();
  let older = engine.refresh_attendees(&mut txn, &resource, &attendees(&["mailto:a@example.com"]));
  let newer = engine.refresh_attendees(
    &mut txn,
    &resource,
    &attendees(&["mailto:b@example.com", "mailto:c@example.com"]),
  );
  txn.commit();

  // The older drain defers to the newer one and touches nothing.
  let run = run_job(&store, &engine, older.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Skipped(SkipReason::Superseded)));
  assert!(scheduler.calls().is_empty());
  assert_eq!(store.pending_attendees(resource.id).len(), 3);

  // First batch.
  let run = run_job(&store, &engine, newer.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert_eq!(
    scheduler.calls(),
    vec![Call::Refresh {
      uid: "refresh-2".to_string(),
      attendees: attendees(&["mailto:a@example.com", "mailto:b@example.com"]),
    }]
  );
  assert_eq!(store.pending_attendees(resource.id), attendees(&["mailto:c@example.com"]));

  // Second batch via the follow-up.
  let follow_ups = queued_refresh_jobs(&store);
  assert_eq!(follow_ups.len(), 1);
  let run = run_job(&store, &engine, follow_ups[0]).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert!(store.pending_attendees(resource.id).is_empty());
  assert_eq!(scheduler.count(|call| matches!(call, Call::Refresh { .. })), 2);

  // The last follow-up finds nothing and ends the chain.
  let follow_ups = queued_refresh_jobs(&store);
  assert_eq!(follow_ups.len(), 1);
  let run = run_job(&store, &engine, follow_ups[0]).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert!(queued_refresh_jobs(&store).is_empty());
  assert_eq!(scheduler.count(|call| matches!(call, Call::Refresh { .. })), 2);
  assert_eq!(engine.tracker().in_flight(), 0);
}

#[tokio::test]
async fn test_batch_deletes_exactly_the_refreshed_rows() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, batch_config(2));
  let (_home, resource) = organizer_fixture(&store, "refresh-3", &[]);

  // Duplicate rows can exist when triggers race.
  let mut txn = store.begin();
  for attendee in ["mailto:a@example.com", "mailto:a@example.com", "mailto:b@example.com", "mailto:c@example.com"] {
    txn.insert_pending_attendee(resource.id, attendee);
  }
  let handle = engine.refresh_attendees(&mut txn, &resource, &[]);
  txn.commit();
  assert_eq!(store.pending_attendees(resource.id).len(), 4);

  let run = run_job(&store, &engine, handle.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert_eq!(
    scheduler.calls(),
    vec![Call::Refresh {
      uid: "refresh-3".to_string(),
      attendees: attendees(&["mailto:a@example.com", "mailto:b@example.com"]),
    }]
  );
  assert_eq!(store.pending_attendees(resource.id), attendees(&["mailto:c@example.com"]));
}

#[tokio::test]
async fn test_refresh_of_removed_resource_drains_without_calling_scheduler() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, batch_config(5));
  let (_home, resource) = organizer_fixture(&store, "refresh-4", &[]);

  let mut txn = store.begin();
  let handle = engine.refresh_attendees(&mut txn, &resource, &attendees(&["mailto:a@example.com"]));
  txn.commit();
  assert!(store.delete_calendar_object(resource.id));

  let run = run_job(&store, &engine, handle.job_id).await;
  assert!(matches!(run, JobRun::Finished(_)));
  assert!(scheduler.calls().is_empty());
  assert!(store.pending_attendees(resource.id).is_empty());
}

#[tokio::test]
async fn test_failed_refresh_keeps_pending_rows() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, batch_config(5));
  let (_home, resource) = organizer_fixture(&store, "refresh-5", &[]);

  let mut txn = store.begin();
  let handle = engine.refresh_attendees(&mut txn, &resource, &attendees(&["mailto:a@example.com"]));
  txn.commit();

  scheduler.fail_next(1);
  let run = run_job(&store, &engine, handle.job_id).await;
  assert!(matches!(run, JobRun::Failed(_)));
  assert_eq!(store.pending_attendees(resource.id), attendees(&["mailto:a@example.com"]));
  assert_eq!(queued_refresh_jobs(&store), vec![handle.job_id], "No follow-up from a rolled back batch");
}

#[tokio::test]
async fn test_uncommitted_trigger_does_not_supersede_committed_refresh() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, batch_config(5));
  let (_home, resource) = organizer_fixture(&store, "refresh-6", &[]);

  let mut txn = store.begin();
  let committed = engine.refresh_attendees(&mut txn, &resource, &attendees(&["mailto:a@example.com"]));
  txn.commit();

  // A second trigger is still open when the committed drain runs, and then rolls back.
  let mut racer = store.begin();
  engine.refresh_attendees(&mut racer, &resource, &attendees(&["mailto:b@example.com"]));

  let run = run_job(&store, &engine, committed.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert_eq!(
    scheduler.calls(),
    vec![Call::Refresh {
      uid: "refresh-6".to_string(),
      attendees: attendees(&["mailto:a@example.com"]),
    }]
  );

  racer.abort();
  assert!(store.pending_attendees(resource.id).is_empty());
  assert_eq!(queued_refresh_jobs(&store).len(), 1, "Only the follow-up drain remains");
}
