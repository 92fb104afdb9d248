//! In-process transactional store.
//!
//! Holds the durable job records, the work ledger (group rows plus one kind row per
//! work item), pending refresh attendees, and the calendar homes and objects the work
//! refers to. All access to work data goes through a [`Transaction`]; the job
//! primitive operations used by the runtime (claim, release, failure accounting) are
//! single atomic statements on the store itself.

pub mod lock;
mod txn;

pub use lock::{NamedLockGuard, NamedLocks};
pub use txn::Transaction;

use crate::error::StoreError;
use crate::ical::{Calendar, ParseError};
use crate::job::{JobId, JobRecord, JobState, WorkId};
use crate::work::group::WorkGroup;
use crate::work::WorkPayload;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};

pub type HomeId = u64;
pub type ResourceId = u64;

/// Why a calendar object was last rewritten by the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentUpdateState {
  /// Organizer copy updated with attendee delivery status.
  OrganizerItipUpdate,
  /// Attendee copy updated with organizer delivery status.
  AttendeeItipUpdate,
}

/// A calendar user's home collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarHome {
  pub id: HomeId,
  pub uid: String,
  pub calendar_user_address: String,
}

/// A stored calendar object resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarObject {
  pub id: ResourceId,
  pub home_id: HomeId,
  pub uid: String,
  pub name: String,
  pub calendar_data: String,
  pub update_state: Option<ComponentUpdateState>,
}

impl CalendarObject {
  pub fn calendar(&self) -> Result<Calendar, ParseError> {
    Calendar::parse(&self.calendar_data)
  }
}

/// The kind-specific row of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRow {
  pub work_id: WorkId,
  pub home_resource_id: HomeId,
  pub resource_id: Option<ResourceId>,
  pub payload: WorkPayload,
}

/// An attendee awaiting refresh. Rows are not unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingAttendee {
  pub resource_id: ResourceId,
  pub attendee: String,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
  pub jobs: BTreeMap<JobId, JobRecord>,
  pub groups: BTreeMap<WorkId, WorkGroup>,
  pub work: BTreeMap<WorkId, WorkRow>,
  pub pending_attendees: BTreeMap<u64, PendingAttendee>,
  pub homes: BTreeMap<HomeId, CalendarHome>,
  pub objects: BTreeMap<ResourceId, CalendarObject>,
  last_id: u64,
}

impl Tables {
  /// Shared id sequence. Ids are never reused, even if the allocating transaction aborts.
  pub fn next_id(&mut self) -> u64 {
    self.last_id += 1;
    self.last_id
  }
}

#[derive(Debug, Default)]
pub(crate) struct StoreInner {
  pub(crate) tables: Mutex<Tables>,
  pub(crate) locks: NamedLocks,
  pub(crate) committed: Notify,
}

/// Handle to the shared store. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct Store {
  inner: Arc<StoreInner>,
}

impl Store {
  pub fn new() -> Self {
    Self::default()
  }

  /// Starts a transaction. Dropping it without `commit` rolls it back.
  pub fn begin(&self) -> Transaction {
    Transaction::new(self.inner.clone())
  }

  pub fn locks(&self) -> &NamedLocks {
    &self.inner.locks
  }

  /// Resolves after the next commit that changed data.
  pub(crate) async fn committed(&self) {
    self.inner.committed.notified().await
  }

  fn notify(&self) {
    self.inner.committed.notify_one();
  }

  // --- Calendar data ---

  pub fn create_home(&self, uid: &str, calendar_user_address: &str) -> CalendarHome {
    let mut tables = self.inner.tables.lock();
    let home = CalendarHome {
      id: tables.next_id(),
      uid: uid.to_string(),
      calendar_user_address: calendar_user_address.to_string(),
    };
    tables.homes.insert(home.id, home.clone());
    home
  }

  /// Stores a calendar object, taking its UID from the calendar data.
  pub fn create_calendar_object(
    &self,
    home_id: HomeId,
    name: &str,
    calendar_data: &str,
  ) -> Result<CalendarObject, ParseError> {
    let calendar = Calendar::parse(calendar_data)?;
    let uid = calendar.uid().ok_or(ParseError::MissingProperty("UID"))?;

    let mut tables = self.inner.tables.lock();
    let object = CalendarObject {
      id: tables.next_id(),
      home_id,
      uid: uid.to_string(),
      name: name.to_string(),
      calendar_data: calendar_data.to_string(),
      update_state: None,
    };
    tables.objects.insert(object.id, object.clone());
    Ok(object)
  }

  pub fn delete_calendar_object(&self, id: ResourceId) -> bool {
    self.inner.tables.lock().objects.remove(&id).is_some()
  }

  pub fn calendar_home(&self, id: HomeId) -> Option<CalendarHome> {
    self.inner.tables.lock().homes.get(&id).cloned()
  }

  pub fn calendar_object(&self, id: ResourceId) -> Option<CalendarObject> {
    self.inner.tables.lock().objects.get(&id).cloned()
  }

  // --- Inspection ---

  pub fn job(&self, job_id: JobId) -> Option<JobRecord> {
    self.inner.tables.lock().jobs.get(&job_id).cloned()
  }

  pub fn jobs(&self) -> Vec<JobRecord> {
    self.inner.tables.lock().jobs.values().cloned().collect()
  }

  pub fn work_groups(&self) -> Vec<WorkGroup> {
    self.inner.tables.lock().groups.values().cloned().collect()
  }

  /// Pending refresh attendees of a resource, duplicates included, in insertion order.
  pub fn pending_attendees(&self, resource_id: ResourceId) -> Vec<String> {
    self
      .inner
      .tables
      .lock()
      .pending_attendees
      .values()
      .filter(|row| row.resource_id == resource_id)
      .map(|row| row.attendee.clone())
      .collect()
  }

  // --- Job primitive ---

  /// Claims the most urgent eligible job by stamping its lease.
  ///
  /// With a `max_load`, the summed weight of leased jobs stays within it: a job is
  /// only claimed if its weight fits the remaining budget, or if nothing is leased.
  pub(crate) fn claim_next(
    &self,
    now: DateTime<Utc>,
    lease: ChronoDuration,
    max_load: Option<u32>,
  ) -> Option<JobRecord> {
    let mut tables = self.inner.tables.lock();
    let load: u32 = tables
      .jobs
      .values()
      .filter(|job| job.holds_lease(now, lease))
      .map(|job| u32::from(job.weight))
      .sum();
    let fits = |job: &JobRecord| match max_load {
      Some(max_load) => load == 0 || load + u32::from(job.weight) <= max_load,
      None => true,
    };

    let job_id = tables
      .jobs
      .values()
      .filter(|job| job.is_eligible(now, lease) && fits(job))
      .min_by_key(|job| (Reverse(job.priority), job.not_before, job.job_id))
      .map(|job| job.job_id)?;

    let job = tables.jobs.get_mut(&job_id)?;
    job.assigned = Some(now);
    trace!(job_id, weight = job.weight, load, "Claimed job.");
    Some(job.clone())
  }

  /// Earliest instant at which a currently ineligible job could become claimable.
  pub(crate) fn next_due(&self, lease: ChronoDuration) -> Option<DateTime<Utc>> {
    self
      .inner
      .tables
      .lock()
      .jobs
      .values()
      .filter(|job| job.state == JobState::Queued && !job.pause)
      .map(|job| match job.assigned {
        Some(assigned) => job.not_before.max(assigned + lease),
        None => job.not_before,
      })
      .min()
  }

  /// Number of jobs that are queued and not paused.
  pub(crate) fn queued_count(&self) -> usize {
    self
      .inner
      .tables
      .lock()
      .jobs
      .values()
      .filter(|job| job.state == JobState::Queued && !job.pause)
      .count()
  }

  fn update_job<F>(&self, job_id: JobId, update: F) -> Result<JobRecord, StoreError>
  where
    F: FnOnce(&mut JobRecord),
  {
    let record = {
      let mut tables = self.inner.tables.lock();
      let job = tables
        .jobs
        .get_mut(&job_id)
        .ok_or(StoreError::JobNotFound(job_id))?;
      update(job);
      job.clone()
    };
    self.notify();
    Ok(record)
  }

  /// Drops the lease and defers the job without counting a failure.
  pub fn release_job(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<JobRecord, StoreError> {
    debug!(job_id, %not_before, "Releasing job.");
    self.update_job(job_id, |job| {
      job.assigned = None;
      job.not_before = not_before;
    })
  }

  /// Drops the lease, counts a failed attempt and defers the job.
  pub fn record_job_failure(
    &self,
    job_id: JobId,
    not_before: DateTime<Utc>,
  ) -> Result<JobRecord, StoreError> {
    self.update_job(job_id, |job| {
      job.assigned = None;
      job.failed += 1;
      job.not_before = not_before;
    })
  }

  /// Parks the job for good. It keeps its work rows so that it can be inspected.
  pub(crate) fn mark_job_failed(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
    self.update_job(job_id, |job| {
      job.assigned = None;
      job.pause = true;
      job.state = JobState::PermanentlyFailed;
    })
  }

  /// Makes the job eligible immediately.
  pub(crate) fn trigger_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, StoreError> {
    self.update_job(job_id, |job| job.not_before = now)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::work::{NewWork, ReplyWork};

  fn reply(store: &Store, uid: &str, weight: u8) -> JobId {
    let mut txn = store.begin();
    let handle = txn.create_work(
      NewWork::new(
        uid,
        1,
        None,
        WorkPayload::Reply(ReplyWork {
          itip_msg: String::new(),
        }),
        Utc::now() - ChronoDuration::seconds(1),
      )
      .with_weight(weight),
    );
    txn.commit();
    handle.job_id
  }

  #[test]
  fn claims_respect_load_budget() {
    let store = Store::new();
    let lease = ChronoDuration::seconds(60);
    let heavy = reply(&store, "a", 6);
    let light = reply(&store, "b", 3);
    let other = reply(&store, "c", 5);

    let now = Utc::now();
    // Nothing leased yet: the oldest job is taken even though it alone fills the budget.
    assert_eq!(store.claim_next(now, lease, Some(8)).map(|j| j.job_id), Some(heavy));
    // With 6 leased, neither 3 nor 5 fits within 8.
    assert_eq!(store.claim_next(now, lease, Some(8)).map(|j| j.job_id), None);

    store.release_job(heavy, now + ChronoDuration::hours(1)).unwrap();
    assert_eq!(store.claim_next(now, lease, Some(8)).map(|j| j.job_id), Some(light));
    assert_eq!(store.claim_next(now, lease, Some(8)).map(|j| j.job_id), Some(other));
    assert_eq!(store.claim_next(now, lease, Some(8)), None);
  }

  #[test]
  fn claims_are_unbounded_without_load_budget() {
    let store = Store::new();
    let lease = ChronoDuration::seconds(60);
    for uid in ["a", "b", "c"] {
      reply(&store, uid, 10);
    }
    let now = Utc::now();
    let claimed = std::iter::from_fn(|| store.claim_next(now, lease, None)).count();
    assert_eq!(claimed, 3);
  }
}
