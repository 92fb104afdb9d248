// file: tests/chaining.rs
//! Tests for chaining of related work and organizer fan-out.

mod common;

use crate::common::{
  build_engine, immediate_config, organizer_event, organizer_fixture, reply_message, setup_tracing, Call,
  FakeScheduler,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use itipkeeper::work::{OrganizerSendWork, ReplyWork};
use itipkeeper::{
  run_job, Calendar, JobRun, NewWork, ScheduleAction, Store, WorkOutcome, WorkPayload, WorkQueueConfig, WorkType,
};

const ALICE: &str = "mailto:alice@example.com";
const BOB: &str = "mailto:bob@example.com";
const CAROL: &str = "mailto:carol@example.com";

fn send(home_id: u64, resource_id: u64, uid: &str, attendee: &str, not_before: DateTime<Utc>) -> NewWork {
  NewWork::new(
    uid,
    home_id,
    Some(resource_id),
    WorkPayload::OrganizerSend(OrganizerSendWork {
      action: ScheduleAction::Modify,
      attendee: attendee.to_string(),
      itip_msg: organizer_event(uid, &[attendee]),
      no_refresh: false,
    }),
    not_before,
  )
}

#[tokio::test]
async fn test_finished_send_promotes_next_send_of_same_uid() {
  setup_tracing();
  let store = Store::new();
  let engine = build_engine(&FakeScheduler::new(), immediate_config());
  let (home, resource) = organizer_fixture(&store, "chain-1", &[ALICE, BOB]);
  let later = Utc::now() + ChronoDuration::hours(1);

  let mut txn = store.begin();
  let first = engine.enqueue(&mut txn, send(home.id, resource.id, "chain-1", ALICE, Utc::now()));
  let second = engine.enqueue(&mut txn, send(home.id, resource.id, "chain-1", BOB, later));
  let unrelated = engine.enqueue(&mut txn, send(home.id, resource.id, "chain-other", CAROL, later));
  txn.commit();

  let run = run_job(&store, &engine, first.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));

  let promoted = store.job(second.job_id).unwrap();
  assert!(promoted.not_before <= Utc::now(), "Sibling should be eligible now");
  assert_eq!(store.job(unrelated.job_id).unwrap().not_before, later);
}

#[tokio::test]
async fn test_sibling_of_other_kind_keeps_its_schedule() {
  setup_tracing();
  let store = Store::new();
  let engine = build_engine(&FakeScheduler::new(), immediate_config());
  let (home, resource) = organizer_fixture(&store, "chain-2", &[ALICE]);
  let later = Utc::now() + ChronoDuration::hours(1);

  let mut txn = store.begin();
  let first = engine.enqueue(&mut txn, send(home.id, resource.id, "chain-2", ALICE, Utc::now()));
  let reply = engine.enqueue(
    &mut txn,
    NewWork::new(
      "chain-2",
      home.id,
      None,
      WorkPayload::Reply(ReplyWork {
        itip_msg: reply_message("chain-2", ALICE, "ACCEPTED"),
      }),
      later,
    ),
  );
  let next_send = engine.enqueue(&mut txn, send(home.id, resource.id, "chain-2", BOB, later));
  txn.commit();

  let run = run_job(&store, &engine, first.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));

  // Only the oldest sibling is considered, and it is a reply.
  assert_eq!(store.job(reply.job_id).unwrap().not_before, later);
  assert_eq!(store.job(next_send.job_id).unwrap().not_before, later);
}

#[tokio::test]
async fn test_non_coalescible_work_does_not_chain() {
  setup_tracing();
  let store = Store::new();
  let engine = build_engine(&FakeScheduler::new(), immediate_config());
  let (home, resource) = organizer_fixture(&store, "chain-3", &[ALICE]);
  let later = Utc::now() + ChronoDuration::hours(1);

  let mut txn = store.begin();
  let reply = engine.enqueue(
    &mut txn,
    NewWork::new(
      "chain-3",
      home.id,
      None,
      WorkPayload::Reply(ReplyWork {
        itip_msg: reply_message("chain-3", ALICE, "DECLINED"),
      }),
      Utc::now(),
    ),
  );
  let queued_send = engine.enqueue(&mut txn, send(home.id, resource.id, "chain-3", ALICE, later));
  txn.commit();

  let run = run_job(&store, &engine, reply.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert_eq!(store.job(queued_send.job_id).unwrap().not_before, later);
}

#[tokio::test]
async fn test_organizer_change_fans_out_staggered_sends() {
  setup_tracing();
  let scheduler = FakeScheduler::new();
  let store = Store::new();
  let config = WorkQueueConfig {
    stagger_seconds: 2.0,
    ..immediate_config()
  };
  let engine = build_engine(&scheduler, config);
  let (home, resource) = organizer_fixture(&store, "fanout-1", &[ALICE, BOB, CAROL]);
  let calendar = Calendar::parse(&organizer_event("fanout-1", &[ALICE, BOB, CAROL])).unwrap();

  let mut txn = store.begin();
  let handle = engine.schedule_organizer(
    &mut txn,
    "fanout-1",
    ScheduleAction::Create,
    &home,
    Some(&resource),
    None,
    Some(&calendar),
    false,
  );
  txn.commit();

  let run = run_job(&store, &engine, handle.job_id).await;
  assert_eq!(run, JobRun::Finished(WorkOutcome::Completed));
  assert_eq!(
    scheduler.calls(),
    vec![Call::OrganizerChange {
      uid: "fanout-1".to_string()
    }]
  );

  let mut sends: Vec<_> = store
    .jobs()
    .into_iter()
    .filter(|job| job.work_type == WorkType::OrganizerSend)
    .collect();
  sends.sort_by_key(|job| job.job_id);
  assert_eq!(sends.len(), 3);
  let gaps: Vec<i64> = sends
    .windows(2)
    .map(|pair| (pair[1].not_before - pair[0].not_before).num_milliseconds())
    .collect();
  assert!(
    gaps.iter().all(|gap| (1900..=2100).contains(gap)),
    "Sends should be staggered by two seconds: {:?}",
    gaps
  );
  assert_eq!(engine.tracker().in_flight(), 3);
}
