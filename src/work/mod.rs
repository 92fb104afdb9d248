//! Scheduling work items and the engine that executes them.
//!
//! Every work item is one row in the group ledger (`work::group`) plus one kind row
//! carrying a [`WorkPayload`]. The [`Engine`] owns the lifecycle shared by all kinds:
//! locking, the implicit-processing lock, response handling, chaining and in-flight
//! accounting. The kind-specific enqueue and execute steps live in the submodules.

pub mod group;
pub mod migrate;
mod organizer;
pub mod refresh;
mod reply;
pub mod response;

use crate::config::WorkQueueConfig;
use crate::error::WorkError;
use crate::job::{JobId, Priority, Weight, WorkId, DEFAULT_WEIGHT};
use crate::scheduling::ImplicitScheduler;
use crate::store::{HomeId, ResourceId, Transaction, WorkRow};
use crate::tracker::InFlightTracker;

use group::WorkGroup;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info_span, Instrument};

/// The five kinds of scheduling work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkType {
  /// Process an organizer's change into per-attendee sends.
  Organizer,
  /// Deliver one organizer message to one attendee.
  OrganizerSend,
  /// Deliver an attendee's reply to the organizer.
  Reply,
  /// Re-send the organizer's copy to a batch of attendees.
  Refresh,
  /// Send an automatic attendee reply.
  AutoReply,
}

impl WorkType {
  /// Kinds whose queued siblings are pulled forward when one of them completes.
  pub fn is_coalescible(self) -> bool {
    matches!(self, WorkType::OrganizerSend)
  }
}

impl fmt::Display for WorkType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkType::Organizer => "organizer",
      WorkType::OrganizerSend => "organizer_send",
      WorkType::Reply => "reply",
      WorkType::Refresh => "refresh",
      WorkType::AutoReply => "auto_reply",
    };
    f.write_str(name)
  }
}

/// What an organizer did to a scheduling object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleAction {
  Create,
  Modify,
  Remove,
}

impl fmt::Display for ScheduleAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ScheduleAction::Create => "create",
      ScheduleAction::Modify => "modify",
      ScheduleAction::Remove => "remove",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizerWork {
  pub action: ScheduleAction,
  /// Serialized calendar before the change. `None` on create.
  pub icalendar_text_old: Option<String>,
  /// Serialized calendar after the change. `None` on remove.
  pub icalendar_text_new: Option<String>,
  pub attendee_count: usize,
  pub smart_merge: bool,
  /// Organizer calendar user address at the time of the change.
  pub organizer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizerSendWork {
  pub action: ScheduleAction,
  pub attendee: String,
  pub itip_msg: String,
  pub no_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyWork {
  pub itip_msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshWork {
  /// Number of attendees in the triggering request (or remaining after a batch).
  pub attendee_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReplyWork {
  pub partstat: String,
}

/// Kind-specific data of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkPayload {
  Organizer(OrganizerWork),
  OrganizerSend(OrganizerSendWork),
  Reply(ReplyWork),
  Refresh(RefreshWork),
  AutoReply(AutoReplyWork),
}

impl WorkPayload {
  pub fn work_type(&self) -> WorkType {
    match self {
      WorkPayload::Organizer(_) => WorkType::Organizer,
      WorkPayload::OrganizerSend(_) => WorkType::OrganizerSend,
      WorkPayload::Reply(_) => WorkType::Reply,
      WorkPayload::Refresh(_) => WorkType::Refresh,
      WorkPayload::AutoReply(_) => WorkType::AutoReply,
    }
  }
}

/// A loaded work item: its group row joined with its kind row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
  pub work_id: WorkId,
  pub job_id: JobId,
  pub icalendar_uid: String,
  pub home_resource_id: HomeId,
  pub resource_id: Option<ResourceId>,
  pub payload: WorkPayload,
}

impl WorkItem {
  pub(crate) fn from_rows(group: WorkGroup, row: WorkRow) -> Self {
    Self {
      work_id: row.work_id,
      job_id: group.job_id,
      icalendar_uid: group.icalendar_uid,
      home_resource_id: row.home_resource_id,
      resource_id: row.resource_id,
      payload: row.payload,
    }
  }

  pub fn work_type(&self) -> WorkType {
    self.payload.work_type()
  }
}

/// Everything needed to create a work item together with its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWork {
  pub icalendar_uid: String,
  pub home_resource_id: HomeId,
  pub resource_id: Option<ResourceId>,
  pub payload: WorkPayload,
  pub not_before: DateTime<Utc>,
  pub priority: Priority,
  pub weight: Weight,
  pub pause: bool,
}

impl NewWork {
  pub fn new(
    icalendar_uid: &str,
    home_resource_id: HomeId,
    resource_id: Option<ResourceId>,
    payload: WorkPayload,
    not_before: DateTime<Utc>,
  ) -> Self {
    Self {
      icalendar_uid: icalendar_uid.to_string(),
      home_resource_id,
      resource_id,
      payload,
      not_before,
      priority: Priority::default(),
      weight: DEFAULT_WEIGHT,
      pause: false,
    }
  }

  pub fn with_pause(mut self, pause: bool) -> Self {
    self.pause = pause;
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_weight(mut self, weight: Weight) -> Self {
    self.weight = weight;
    self
  }
}

/// Ids of a freshly created work item and its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkHandle {
  pub work_id: WorkId,
  pub job_id: JobId,
}

/// Result of executing a work item that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
  Completed,
  Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// The calendar home or object the work refers to no longer exists.
  MissingResource,
  /// A later refresh for the same resource will do this work.
  Superseded,
}

/// Name of the lock serializing implicit processing of one iCalendar UID.
pub fn implicit_uid_lock_key(uid: &str) -> String {
  format!("ImplicitUIDLock:{}", hex::encode(Sha256::digest(uid.as_bytes())))
}

/// Enqueues and executes scheduling work.
///
/// Cloning is cheap; all clones share the configuration, the in-flight tracker
/// and the scheduler.
#[derive(Clone)]
pub struct Engine {
  config: Arc<WorkQueueConfig>,
  tracker: InFlightTracker,
  scheduler: Arc<dyn ImplicitScheduler>,
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine")
      .field("config", &self.config)
      .field("in_flight", &self.tracker.in_flight())
      .field("scheduler", &format_args!("Arc<dyn ImplicitScheduler>"))
      .finish()
  }
}

impl Engine {
  pub fn new(config: WorkQueueConfig, scheduler: Arc<dyn ImplicitScheduler>) -> Self {
    Self {
      config: Arc::new(config),
      tracker: InFlightTracker::new(),
      scheduler,
    }
  }

  /// Shares an existing tracker, e.g. one per pod across several engines.
  pub fn with_tracker(mut self, tracker: InFlightTracker) -> Self {
    self.tracker = tracker;
    self
  }

  pub fn config(&self) -> &WorkQueueConfig {
    &self.config
  }

  pub fn tracker(&self) -> &InFlightTracker {
    &self.tracker
  }

  /// Creates a work item and counts it as in flight once `txn` commits.
  pub fn enqueue(&self, txn: &mut Transaction, new: NewWork) -> WorkHandle {
    let work_type = new.payload.work_type();
    let uid = new.icalendar_uid.clone();
    let not_before = new.not_before;
    let pause = new.pause;
    let handle = txn.create_work(new);
    let tracker = self.tracker.clone();
    txn.post_commit(move || tracker.enqueued());
    debug!(
      work_id = handle.work_id,
      job_id = handle.job_id,
      %uid,
      %work_type,
      %not_before,
      pause,
      "Enqueued scheduling work."
    );
    handle
  }

  pub(crate) fn dequeued(&self, txn: &mut Transaction) {
    let tracker = self.tracker.clone();
    txn.post_commit(move || tracker.dequeued());
  }

  /// Takes the UID group lock and the item's row lock without waiting.
  pub fn lock(&self, txn: &mut Transaction, item: &WorkItem) -> bool {
    group::lock(txn, item)
  }

  /// Executes `item` inside `txn`, logging the outcome once.
  ///
  /// The caller is expected to have locked the item and deleted its row. On `Ok` the
  /// item counts as finished once `txn` commits; errors are returned untouched.
  pub async fn run_work(&self, txn: &mut Transaction, item: &WorkItem) -> Result<WorkOutcome, WorkError> {
    let span = info_span!(
      "schedule_work",
      work_id = item.work_id,
      job_id = item.job_id,
      uid = %item.icalendar_uid,
      work_type = %item.work_type()
    );

    async {
      debug!("Executing scheduling work.");
      let result = self.execute(txn, item).await;
      match &result {
        Ok(outcome) => {
          self.dequeued(txn);
          debug!(?outcome, "Scheduling work finished.");
        }
        Err(WorkError::Temporary { delay }) => {
          debug!(?delay, "Scheduling work deferred after temporary delivery failure.");
        }
        Err(error) => {
          error!(%error, "Scheduling work failed.");
        }
      }
      result
    }
    .instrument(span)
    .await
  }

  async fn execute(&self, txn: &mut Transaction, item: &WorkItem) -> Result<WorkOutcome, WorkError> {
    let outcome = match &item.payload {
      WorkPayload::Organizer(work) => self.execute_organizer(txn, item, work).await?,
      WorkPayload::OrganizerSend(work) => self.execute_organizer_send(txn, item, work).await?,
      WorkPayload::Reply(work) => self.execute_reply(txn, item, work).await?,
      WorkPayload::Refresh(_) => self.execute_refresh(txn, item).await?,
      WorkPayload::AutoReply(_) => self.execute_auto_reply(txn, item).await?,
    };
    self.after_work(txn, item)?;
    Ok(outcome)
  }

  /// Pulls the next coalescible sibling forward so it runs right after this item.
  fn after_work(&self, txn: &mut Transaction, item: &WorkItem) -> Result<(), WorkError> {
    if let Some(next) = group::chain_next(txn, item, Utc::now())? {
      debug!(next_work_id = next, "Chained next scheduling work.");
    }
    Ok(())
  }

  /// Serializes implicit processing of `uid` with every other writer of that UID.
  pub(crate) async fn acquire_implicit_lock(&self, txn: &mut Transaction, uid: &str) {
    txn.acquire_named_lock(&implicit_uid_lock_key(uid)).await;
  }

  pub(crate) fn scheduler(&self) -> &dyn ImplicitScheduler {
    self.scheduler.as_ref()
  }
}
