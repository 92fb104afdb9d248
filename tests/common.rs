//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use itipkeeper::{
  CalendarHome, CalendarObject, Engine, ImplicitScheduler, ItipKeeper, OrganizerChange, OrganizerMessage,
  OrganizerSend, ScheduleResponse, SchedulingError, SendResult, Store, Transaction, WorkQueueConfig,
};
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;

pub const ORGANIZER: &str = "mailto:organizer@example.com";
pub const DELIVERED: &str = "1.2;Delivered";
pub const PENDING: &str = "1.0;Pending";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// --- Calendar fixtures ---

// An organizer's copy of an event with the given attendees.
pub fn organizer_event(uid: &str, attendees: &[&str]) -> String {
  let mut lines = vec![
    "BEGIN:VCALENDAR".to_string(),
    "VERSION:2.0".to_string(),
    "PRODID:-//itipkeeper//tests//EN".to_string(),
    "BEGIN:VEVENT".to_string(),
    format!("UID:{uid}"),
    "DTSTART:20261020T100000Z".to_string(),
    "DTEND:20261020T110000Z".to_string(),
    "SUMMARY:Planning".to_string(),
    format!("ORGANIZER;CN=Organizer:{ORGANIZER}"),
  ];
  for attendee in attendees {
    lines.push(format!("ATTENDEE;PARTSTAT=NEEDS-ACTION:{attendee}"));
  }
  lines.push("END:VEVENT".to_string());
  lines.push("END:VCALENDAR".to_string());
  lines.join("\r\n") + "\r\n"
}

// An iTIP REPLY from `attendee` to the fixture organizer.
pub fn reply_message(uid: &str, attendee: &str, partstat: &str) -> String {
  [
    "BEGIN:VCALENDAR".to_string(),
    "VERSION:2.0".to_string(),
    "METHOD:REPLY".to_string(),
    "BEGIN:VEVENT".to_string(),
    format!("UID:{uid}"),
    format!("ORGANIZER:{ORGANIZER}"),
    format!("ATTENDEE;PARTSTAT={partstat}:{attendee}"),
    "END:VEVENT".to_string(),
    "END:VCALENDAR".to_string(),
  ]
  .join("\r\n")
    + "\r\n"
}

// --- Recording scheduler ---

/// One call received by the fake scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
  OrganizerChange { uid: String },
  OrganizerSend { uid: String, attendee: String },
  Refresh { uid: String, attendees: Vec<String> },
  Reply { uid: String, originator: String, recipient: String },
  AutoReply { uid: String, resource_id: u64 },
}

/// An `ImplicitScheduler` that records calls and answers from a script.
///
/// Deliveries report `1.2` for every recipient unless a scripted status is queued.
#[derive(Default)]
pub struct FakeScheduler {
  calls: Mutex<Vec<Call>>,
  scripted: Mutex<VecDeque<Vec<(String, String)>>>,
  delay: Mutex<StdDuration>,
  fail_remaining: AtomicUsize,
  panic_next: AtomicBool,
  active_per_uid: Mutex<HashMap<String, usize>>,
  max_active_per_uid: AtomicUsize,
  contexts_seen: Mutex<Vec<Option<u32>>>,
  send_result_resource: Mutex<Option<u64>>,
}

impl FakeScheduler {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().clone()
  }

  pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
    self.calls.lock().iter().filter(|call| predicate(call)).count()
  }

  /// Queues the statuses of the next delivery, as `(recipient, request_status)` pairs.
  pub fn script(&self, statuses: &[(&str, &str)]) {
    self.scripted.lock().push_back(
      statuses
        .iter()
        .map(|(recipient, status)| (recipient.to_string(), status.to_string()))
        .collect(),
    );
  }

  pub fn set_delay(&self, delay: StdDuration) {
    *self.delay.lock() = delay;
  }

  /// Fails the next `count` calls with a processing error.
  pub fn fail_next(&self, count: usize) {
    self.fail_remaining.store(count, Ordering::SeqCst);
  }

  pub fn panic_next(&self) {
    self.panic_next.store(true, Ordering::SeqCst);
  }

  pub fn max_active_per_uid(&self) -> usize {
    self.max_active_per_uid.load(Ordering::SeqCst)
  }

  /// Makes organizer sends report `resource_id` as the object to annotate, whatever
  /// resource the send itself carried.
  pub fn report_send_resource(&self, resource_id: u64) {
    *self.send_result_resource.lock() = Some(resource_id);
  }

  /// Attempt numbers seen through the task-local work context, `None` outside a worker.
  pub fn contexts_seen(&self) -> Vec<Option<u32>> {
    self.contexts_seen.lock().clone()
  }

  async fn enter(&self, uid: &str, call: Call) -> Result<(), SchedulingError> {
    self.calls.lock().push(call);
    self
      .contexts_seen
      .lock()
      .push(itipkeeper::try_get_current_work_context().map(|ctx| ctx.attempt));

    if self.panic_next.swap(false, Ordering::SeqCst) {
      panic!("scheduler forced panic");
    }
    let failing = self
      .fail_remaining
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(SchedulingError::Processing(format!("forced failure for {uid}")));
    }

    let active = {
      let mut map = self.active_per_uid.lock();
      let entry = map.entry(uid.to_string()).or_default();
      *entry += 1;
      *entry
    };
    self.max_active_per_uid.fetch_max(active, Ordering::SeqCst);

    let delay = *self.delay.lock();
    if delay > StdDuration::ZERO {
      tokio::time::sleep(delay).await;
    }

    if let Some(entry) = self.active_per_uid.lock().get_mut(uid) {
      *entry -= 1;
    }
    Ok(())
  }

  fn response_for(&self, recipients: &[&str]) -> ScheduleResponse {
    match self.scripted.lock().pop_front() {
      Some(statuses) => statuses
        .iter()
        .fold(ScheduleResponse::new(), |acc, (recipient, status)| acc.with(recipient, status)),
      None => recipients
        .iter()
        .fold(ScheduleResponse::new(), |acc, recipient| acc.with(recipient, DELIVERED)),
    }
  }
}

#[async_trait]
impl ImplicitScheduler for FakeScheduler {
  async fn process_organizer_change(
    &self,
    _txn: &mut Transaction,
    change: OrganizerChange<'_>,
  ) -> Result<Vec<OrganizerMessage>, SchedulingError> {
    self
      .enter(change.uid, Call::OrganizerChange { uid: change.uid.to_string() })
      .await?;
    let Some(calendar) = change.calendar_new.or(change.calendar_old) else {
      return Ok(Vec::new());
    };
    Ok(
      calendar
        .attendees()
        .into_iter()
        .map(|attendee| OrganizerMessage {
          action: change.action,
          attendee: attendee.to_string(),
          itip_msg: calendar.to_string(),
          no_refresh: false,
        })
        .collect(),
    )
  }

  async fn send_organizer_message(
    &self,
    txn: &mut Transaction,
    message: OrganizerSend<'_>,
  ) -> Result<SendResult, SchedulingError> {
    self
      .enter(
        message.uid,
        Call::OrganizerSend {
          uid: message.uid.to_string(),
          attendee: message.attendee.to_string(),
        },
      )
      .await?;
    let resource_id = (*self.send_result_resource.lock()).or(message.resource.map(|resource| resource.id));
    Ok(SendResult {
      resource: resource_id.and_then(|id| txn.calendar_object(id)),
      responses: vec![self.response_for(&[message.attendee])],
    })
  }

  async fn refresh_attendees(
    &self,
    _txn: &mut Transaction,
    organizer_resource: &CalendarObject,
    attendees: &[String],
  ) -> Result<(), SchedulingError> {
    self
      .enter(
        &organizer_resource.uid,
        Call::Refresh {
          uid: organizer_resource.uid.clone(),
          attendees: attendees.to_vec(),
        },
      )
      .await
  }

  async fn send_reply(
    &self,
    _txn: &mut Transaction,
    _home: &CalendarHome,
    itip_msg: &itipkeeper::Calendar,
    originator: &str,
    recipient: &str,
  ) -> Result<ScheduleResponse, SchedulingError> {
    let uid = itip_msg.uid().unwrap_or_default().to_string();
    self
      .enter(
        &uid,
        Call::Reply {
          uid: uid.clone(),
          originator: originator.to_string(),
          recipient: recipient.to_string(),
        },
      )
      .await?;
    Ok(self.response_for(&[recipient]))
  }

  async fn send_attendee_reply(
    &self,
    _txn: &mut Transaction,
    _home: &CalendarHome,
    resource: &CalendarObject,
  ) -> Result<ScheduleResponse, SchedulingError> {
    self
      .enter(
        &resource.uid,
        Call::AutoReply {
          uid: resource.uid.clone(),
          resource_id: resource.id,
        },
      )
      .await?;
    Ok(self.response_for(&[ORGANIZER]))
  }
}

// --- Setup helpers ---

/// A config with every delay at zero, otherwise defaults.
pub fn immediate_config() -> WorkQueueConfig {
  WorkQueueConfig::immediate()
}

pub fn build_engine(scheduler: &Arc<FakeScheduler>, config: WorkQueueConfig) -> Engine {
  Engine::new(config, scheduler.clone())
}

/// A store with the organizer's home and calendar object for `uid`.
pub fn organizer_fixture(store: &Store, uid: &str, attendees: &[&str]) -> (CalendarHome, CalendarObject) {
  let home = store.create_home("organizer", ORGANIZER);
  let resource = store
    .create_calendar_object(home.id, &format!("{uid}.ics"), &organizer_event(uid, attendees))
    .expect("fixture calendar should parse");
  (home, resource)
}

// Builds a runtime with short timings for tests.
pub fn build_runtime(store: &Store, engine: &Engine, max_workers: usize) -> ItipKeeper {
  ItipKeeper::builder()
    .max_workers(max_workers)
    .store(store.clone())
    .engine(engine.clone())
    .poll_interval(StdDuration::from_millis(20))
    .lock_retry_delay(StdDuration::from_millis(20))
    .crash_retry_base_delay(StdDuration::from_millis(10))
    .build()
    .expect("runtime should build")
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: StdDuration, condition: impl Fn() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if condition() {
      return true;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
  condition()
}

/// The `SCHEDULE-STATUS` recorded for `recipient` on a stored calendar object.
pub fn schedule_status(store: &Store, resource_id: u64, property: &str, recipient: &str) -> Option<String> {
  let object = store.calendar_object(resource_id)?;
  let calendar = object.calendar().ok()?;
  let status = calendar
    .properties_named(property)
    .find(|p| p.value() == recipient)?
    .parameter("SCHEDULE-STATUS")?
    .to_string();
  Some(status)
}
