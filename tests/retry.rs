// file: tests/retry.rs
//! Tests for the delivery response and bounded retry policy.

mod common;

use crate::common::{
  build_engine, immediate_config, organizer_event, organizer_fixture, reply_message, schedule_status, setup_tracing,
  Call, FakeScheduler, ORGANIZER, PENDING,
};
use chrono::{Duration as ChronoDuration, Utc};
use itipkeeper::{
  run_job, Calendar, ComponentUpdateState, Engine, JobRun, ScheduleAction, Store, WorkError, WorkHandle, WorkOutcome,
  WorkQueueConfig,
};
use std::time::Duration as StdDuration;

const ALICE: &str = "mailto:alice@example.com";
const BOB: &str = "mailto:bob@example.com";

fn retry_config(max_temporary_failures: u32) -> WorkQueueConfig {
  WorkQueueConfig {
    max_temporary_failures,
    temporary_failure_delay_seconds: 30.0,
    ..immediate_config()
  }
}

fn enqueue_send(store: &Store, engine: &Engine, uid: &str, attendees: &[&str]) -> (u64, WorkHandle) {
  let (home, resource) = organizer_fixture(store, uid, attendees);
  let itip = Calendar::parse(&organizer_event(uid, attendees)).unwrap();
  let mut txn = store.begin();
  let handle = engine
    .schedule_organizer_send(
      &mut txn,
      ScheduleAction::Modify,
      &home,
      Some(&resource),
      attendees[0],
      &itip,
      false,
      ChronoDuration::zero(),
    )
    .unwrap();
  txn.commit();
  (resource.id, handle)
}

#[tokio::test]
async fn test_all_pending_is_temporary_below_maximum() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, retry_config(2));
  let (resource_id, handle) = enqueue_send(&store, &engine, "retry-1", &[ALICE]);
  let original = store.calendar_object(resource_id).unwrap();

  scheduler.script(&[(ALICE, PENDING)]);
  let run = run_job(&store, &engine, handle.job_id).await;
  assert!(
    matches!(run, JobRun::Failed(WorkError::Temporary { delay }) if delay == StdDuration::from_secs(30)),
    "Unexpected run result: {:?}",
    run
  );

  // The attempt rolled back completely.
  assert_eq!(store.calendar_object(resource_id), Some(original));
  assert_eq!(store.work_groups().len(), 1);
  assert!(store.job(handle.job_id).is_some());
  assert_eq!(engine.tracker().in_flight(), 1);

  store.record_job_failure(handle.job_id, Utc::now()).unwrap();
  scheduler.script(&[(ALICE, PENDING)]);
  let run = run_job(&store, &engine, handle.job_id).await;
  assert!(matches!(run, JobRun::Failed(WorkError::Temporary { .. })));
}

#[tokio::test]
async fn test_all_pending_at_maximum_is_recorded_as_unavailable() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, retry_config(2));
  let (resource_id, handle) = enqueue_send(&store, &engine, "retry-2", &[ALICE]);

  store.record_job_failure(handle.job_id, Utc::now()).unwrap();
  store.record_job_failure(handle.job_id, Utc::now()).unwrap();
  assert_eq!(store.job(handle.job_id).map(|job| job.failed), Some(2));

  scheduler.script(&[(ALICE, PENDING)]);
  let run = run_job(&store, &engine, handle.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));

  assert_eq!(schedule_status(&store, resource_id, "ATTENDEE", ALICE).as_deref(), Some("5.1"));
  let object = store.calendar_object(resource_id).unwrap();
  assert_eq!(object.update_state, Some(ComponentUpdateState::OrganizerItipUpdate));
  assert!(store.job(handle.job_id).is_none());
  assert_eq!(engine.tracker().in_flight(), 0);
}

#[tokio::test]
async fn test_partial_permanent_failure_is_recorded_immediately() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, retry_config(3));
  let (resource_id, handle) = enqueue_send(&store, &engine, "retry-3", &[ALICE, BOB]);

  scheduler.script(&[(ALICE, "3.7;Invalid calendar user"), (BOB, PENDING)]);
  let run = run_job(&store, &engine, handle.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));

  assert_eq!(schedule_status(&store, resource_id, "ATTENDEE", ALICE).as_deref(), Some("3.7"));
  assert_eq!(schedule_status(&store, resource_id, "ATTENDEE", BOB).as_deref(), Some("1.0"));
}

#[tokio::test]
async fn test_delivered_responses_leave_calendar_untouched() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, retry_config(3));
  let (resource_id, handle) = enqueue_send(&store, &engine, "retry-4", &[ALICE]);
  let original = store.calendar_object(resource_id).unwrap();

  let run = run_job(&store, &engine, handle.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert_eq!(store.calendar_object(resource_id), Some(original));
  assert_eq!(
    scheduler.calls(),
    vec![Call::OrganizerSend {
      uid: "retry-4".to_string(),
      attendee: ALICE.to_string(),
    }]
  );
}

#[tokio::test]
async fn test_reply_failure_is_recorded_on_organizer_property() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let engine = build_engine(&scheduler, retry_config(3));

  let attendee_home = store.create_home("alice", ALICE);
  let attendee_copy = store
    .create_calendar_object(attendee_home.id, "invite.ics", &organizer_event("reply-1", &[ALICE]))
    .unwrap();
  let reply = Calendar::parse(&reply_message("reply-1", ALICE, "ACCEPTED")).unwrap();

  let mut txn = store.begin();
  let handle = engine
    .schedule_reply(&mut txn, &attendee_home, Some(&attendee_copy), &reply)
    .unwrap();
  txn.commit();

  scheduler.script(&[(ORGANIZER, "5.3;No scheduling support for user")]);
  let run = run_job(&store, &engine, handle.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));

  assert_eq!(
    scheduler.calls(),
    vec![Call::Reply {
      uid: "reply-1".to_string(),
      originator: ALICE.to_string(),
      recipient: ORGANIZER.to_string(),
    }]
  );
  assert_eq!(
    schedule_status(&store, attendee_copy.id, "ORGANIZER", ORGANIZER).as_deref(),
    Some("5.3")
  );
  let object = store.calendar_object(attendee_copy.id).unwrap();
  assert_eq!(object.update_state, Some(ComponentUpdateState::AttendeeItipUpdate));
}
