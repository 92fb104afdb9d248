use super::lock::NamedLockGuard;
use super::{
  CalendarHome, CalendarObject, ComponentUpdateState, HomeId, PendingAttendee, ResourceId, StoreInner,
  Tables, WorkRow,
};
use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobState, WorkId};
use crate::work::group::WorkGroup;
use crate::work::{NewWork, WorkHandle, WorkItem, WorkType};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

type Redo = Box<dyn FnOnce(&mut Tables) + Send>;
type PostCommitHook = Box<dyn FnOnce() + Send>;

/// Uncommitted versions of rows keyed like the table they shadow. `None` marks a row
/// this transaction deleted.
struct Overlay<K, V> {
  rows: BTreeMap<K, Option<V>>,
}

impl<K, V> Default for Overlay<K, V> {
  fn default() -> Self {
    Self { rows: BTreeMap::new() }
  }
}

impl<K: Ord + Copy, V: Clone> Overlay<K, V> {
  fn get(&self, committed: &BTreeMap<K, V>, key: K) -> Option<V> {
    match self.rows.get(&key) {
      Some(row) => row.clone(),
      None => committed.get(&key).cloned(),
    }
  }

  /// Visible rows matching `filter`, in key order.
  fn select(&self, committed: &BTreeMap<K, V>, filter: impl Fn(&V) -> bool) -> Vec<(K, V)> {
    let mut visible: BTreeMap<K, V> = committed
      .iter()
      .filter(|(key, row)| !self.rows.contains_key(*key) && filter(row))
      .map(|(key, row)| (*key, row.clone()))
      .collect();
    visible.extend(
      self
        .rows
        .iter()
        .filter_map(|(key, row)| row.as_ref().filter(|row| filter(row)).map(|row| (*key, row.clone()))),
    );
    visible.into_iter().collect()
  }

  fn put(&mut self, key: K, row: V) {
    self.rows.insert(key, Some(row));
  }

  fn delete(&mut self, key: K) {
    self.rows.insert(key, None);
  }
}

/// This transaction's private view of the tables it has written.
#[derive(Default)]
struct Writes {
  jobs: Overlay<JobId, JobRecord>,
  groups: Overlay<WorkId, WorkGroup>,
  work: Overlay<WorkId, WorkRow>,
  pending_attendees: Overlay<u64, PendingAttendee>,
  objects: Overlay<ResourceId, CalendarObject>,
}

/// A unit of work against the [`Store`](super::Store).
///
/// Writes land in a private overlay that only this transaction reads, and in a redo
/// log. `commit` replays the redo log against the shared tables, then runs post-commit
/// hooks; `abort` (or dropping the transaction) discards both. Other transactions
/// therefore never observe uncommitted rows. Named locks taken through the
/// transaction are held until it finishes either way.
pub struct Transaction {
  store: Arc<StoreInner>,
  writes: Writes,
  redo: Vec<Redo>,
  post_commit: Vec<PostCommitHook>,
  locks: HashMap<String, NamedLockGuard>,
  finished: bool,
}

impl fmt::Debug for Transaction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transaction")
      .field("pending_writes", &self.redo.len())
      .field("post_commit_hooks", &self.post_commit.len())
      .field("locks", &self.locks.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl Transaction {
  pub(super) fn new(store: Arc<StoreInner>) -> Self {
    Self {
      store,
      writes: Writes::default(),
      redo: Vec::new(),
      post_commit: Vec::new(),
      locks: HashMap::new(),
      finished: false,
    }
  }

  pub fn commit(mut self) {
    self.finished = true;
    let redo = std::mem::take(&mut self.redo);
    let changed = !redo.is_empty();
    if changed {
      let mut tables = self.store.tables.lock();
      for apply in redo {
        apply(&mut tables);
      }
    }
    self.writes = Writes::default();
    self.locks.clear();
    let hooks = std::mem::take(&mut self.post_commit);
    trace!(changed, hooks = hooks.len(), "Committing transaction.");
    for hook in hooks {
      hook();
    }
    if changed {
      self.store.committed.notify_one();
    }
  }

  pub fn abort(mut self) {
    self.rollback();
  }

  fn rollback(&mut self) {
    self.finished = true;
    if !self.redo.is_empty() {
      debug!(writes = self.redo.len(), "Rolling back transaction.");
    }
    self.redo.clear();
    self.writes = Writes::default();
    self.post_commit.clear();
    self.locks.clear();
  }

  /// Registers a callback that runs only if this transaction commits.
  pub fn post_commit<F>(&mut self, hook: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.post_commit.push(Box::new(hook));
  }

  // --- Locks ---

  /// Waits for the named lock and holds it until the transaction ends.
  /// Re-acquiring a lock this transaction already holds returns immediately.
  pub async fn acquire_named_lock(&mut self, key: &str) {
    if self.locks.contains_key(key) {
      return;
    }
    let guard = self.store.locks.acquire(key).await;
    self.locks.insert(key.to_string(), guard);
  }

  /// Takes the named lock without waiting. Returns `false` if another transaction holds it.
  pub fn try_lock(&mut self, key: &str) -> bool {
    if self.locks.contains_key(key) {
      return true;
    }
    match self.store.locks.try_acquire(key) {
      Some(guard) => {
        self.locks.insert(key.to_string(), guard);
        true
      }
      None => false,
    }
  }

  // --- Internal helpers ---

  /// Reads committed tables through this transaction's own writes.
  fn read<R>(&self, f: impl FnOnce(&Tables, &Writes) -> R) -> R {
    f(&self.store.tables.lock(), &self.writes)
  }

  fn log(&mut self, redo: impl FnOnce(&mut Tables) + Send + 'static) {
    self.redo.push(Box::new(redo));
  }

  fn allocate_id(&self) -> u64 {
    self.store.tables.lock().next_id()
  }

  // --- Jobs ---

  pub fn job(&self, job_id: JobId) -> Option<JobRecord> {
    self.read(|t, w| w.jobs.get(&t.jobs, job_id))
  }

  /// Applies `update` to this transaction's view now and to the committed row at
  /// commit, so fields other writers changed meanwhile are kept.
  fn update_job<F>(&mut self, job_id: JobId, update: F) -> Result<(), StoreError>
  where
    F: Fn(&mut JobRecord) + Send + 'static,
  {
    let mut job = self.job(job_id).ok_or(StoreError::JobNotFound(job_id))?;
    update(&mut job);
    self.writes.jobs.put(job_id, job);
    self.log(move |t| {
      if let Some(job) = t.jobs.get_mut(&job_id) {
        update(job);
      }
    });
    Ok(())
  }

  pub fn set_job_not_before(
    &mut self,
    job_id: JobId,
    not_before: chrono::DateTime<chrono::Utc>,
  ) -> Result<(), StoreError> {
    self.update_job(job_id, move |job| job.not_before = not_before)
  }

  /// Pausing never touches permanently failed jobs, which stay paused.
  pub fn set_job_pause(&mut self, job_id: JobId, pause: bool) -> Result<(), StoreError> {
    self.update_job(job_id, move |job| {
      if job.state == JobState::Queued {
        job.pause = pause;
      }
    })
  }

  pub fn delete_job(&mut self, job_id: JobId) -> bool {
    if self.job(job_id).is_none() {
      return false;
    }
    self.writes.jobs.delete(job_id);
    self.log(move |t| {
      t.jobs.remove(&job_id);
    });
    true
  }

  // --- Work ledger ---

  /// Creates the job, the group row and the kind row in one step.
  pub fn create_work(&mut self, new: NewWork) -> WorkHandle {
    let job_id = self.allocate_id();
    let work_id = self.allocate_id();
    let work_type = new.payload.work_type();

    let job = JobRecord::new(job_id, work_type, new.priority, new.weight, new.not_before, new.pause);
    let group = WorkGroup {
      work_id,
      job_id,
      icalendar_uid: new.icalendar_uid,
      work_type,
    };
    let row = WorkRow {
      work_id,
      home_resource_id: new.home_resource_id,
      resource_id: new.resource_id,
      payload: new.payload,
    };

    self.writes.jobs.put(job_id, job.clone());
    self.writes.groups.put(work_id, group.clone());
    self.writes.work.put(work_id, row.clone());
    self.log(move |t| {
      t.jobs.insert(job_id, job);
      t.groups.insert(work_id, group);
      t.work.insert(work_id, row);
    });
    WorkHandle { work_id, job_id }
  }

  pub fn work_group(&self, work_id: WorkId) -> Option<WorkGroup> {
    self.read(|t, w| w.groups.get(&t.groups, work_id))
  }

  pub fn groups_for_job(&self, job_id: JobId) -> Vec<WorkGroup> {
    self.read(|t, w| {
      w.groups
        .select(&t.groups, |g| g.job_id == job_id)
        .into_iter()
        .map(|(_, g)| g)
        .collect()
    })
  }

  /// Group rows for a UID, oldest first.
  pub fn groups_for_uid(&self, uid: &str) -> Vec<WorkGroup> {
    self.read(|t, w| {
      w.groups
        .select(&t.groups, |g| g.icalendar_uid == uid)
        .into_iter()
        .map(|(_, g)| g)
        .collect()
    })
  }

  pub fn work_row(&self, work_id: WorkId) -> Option<WorkRow> {
    self.read(|t, w| w.work.get(&t.work, work_id))
  }

  /// Loads a full work item (group plus kind row).
  pub fn work_item(&self, work_id: WorkId) -> Option<WorkItem> {
    self.read(|t, w| {
      let group = w.groups.get(&t.groups, work_id)?;
      let row = w.work.get(&t.work, work_id)?;
      Some(WorkItem::from_rows(group, row))
    })
  }

  /// Work items matching `filter`, oldest first.
  pub fn work_items_where(&self, filter: impl Fn(&WorkItem) -> bool) -> Vec<WorkItem> {
    self.read(|t, w| {
      w.work
        .select(&t.work, |_| true)
        .into_iter()
        .filter_map(|(work_id, row)| {
          let group = w.groups.get(&t.groups, work_id)?;
          Some(WorkItem::from_rows(group, row))
        })
        .filter(|item| filter(item))
        .collect()
    })
  }

  pub fn has_work_of_type(&self, work_type: WorkType) -> bool {
    self.read(|t, w| !w.groups.select(&t.groups, |g| g.work_type == work_type).is_empty())
  }

  /// Deletes a work item: the kind row and, by cascade, its group row.
  /// Returns the deleted group, if the item existed.
  pub fn delete_work(&mut self, work_id: WorkId) -> Option<WorkGroup> {
    let row = self.work_row(work_id);
    let group = self.work_group(work_id);
    if row.is_none() && group.is_none() {
      return None;
    }
    self.writes.work.delete(work_id);
    self.writes.groups.delete(work_id);
    self.log(move |t| {
      t.work.remove(&work_id);
      t.groups.remove(&work_id);
    });
    group
  }

  /// Removes a group row whose kind row has already gone.
  pub(crate) fn delete_orphan_group(&mut self, work_id: WorkId) {
    if self.work_group(work_id).is_some() {
      self.writes.groups.delete(work_id);
      self.log(move |t| {
        t.groups.remove(&work_id);
      });
    }
  }

  /// Removes only the kind row, leaving the group behind.
  #[cfg(test)]
  pub(crate) fn delete_work_row(&mut self, work_id: WorkId) {
    if self.work_row(work_id).is_some() {
      self.writes.work.delete(work_id);
      self.log(move |t| {
        t.work.remove(&work_id);
      });
    }
  }

  // --- Calendar data ---

  pub fn calendar_home(&self, home_id: HomeId) -> Option<CalendarHome> {
    self.read(|t, _| t.homes.get(&home_id).cloned())
  }

  pub fn calendar_object(&self, resource_id: ResourceId) -> Option<CalendarObject> {
    self.read(|t, w| w.objects.get(&t.objects, resource_id))
  }

  /// Rewrites a calendar object on behalf of the server, not a client.
  pub fn set_component_internal(
    &mut self,
    resource_id: ResourceId,
    calendar_data: String,
    update_state: ComponentUpdateState,
  ) -> Result<(), StoreError> {
    let mut object = self
      .calendar_object(resource_id)
      .ok_or(StoreError::ObjectNotFound(resource_id))?;
    object.calendar_data = calendar_data.clone();
    object.update_state = Some(update_state);
    self.writes.objects.put(resource_id, object);
    self.log(move |t| {
      if let Some(object) = t.objects.get_mut(&resource_id) {
        object.calendar_data = calendar_data;
        object.update_state = Some(update_state);
      }
    });
    Ok(())
  }

  // --- Pending refresh attendees ---

  /// Pending attendees of a resource, duplicates included, in insertion order.
  pub fn pending_attendees(&self, resource_id: ResourceId) -> Vec<String> {
    self.read(|t, w| {
      w.pending_attendees
        .select(&t.pending_attendees, |row| row.resource_id == resource_id)
        .into_iter()
        .map(|(_, row)| row.attendee)
        .collect()
    })
  }

  pub fn insert_pending_attendee(&mut self, resource_id: ResourceId, attendee: &str) {
    let row_id = self.allocate_id();
    let row = PendingAttendee {
      resource_id,
      attendee: attendee.to_string(),
    };
    self.writes.pending_attendees.put(row_id, row.clone());
    self.log(move |t| {
      t.pending_attendees.insert(row_id, row);
    });
  }

  /// Deletes every pending row of `resource_id` whose attendee is in `attendees`,
  /// duplicates included. Returns the number of rows removed.
  pub fn delete_pending_attendees(&mut self, resource_id: ResourceId, attendees: &[String]) -> usize {
    let doomed: Vec<u64> = self.read(|t, w| {
      w.pending_attendees
        .select(&t.pending_attendees, |row| {
          row.resource_id == resource_id && attendees.contains(&row.attendee)
        })
        .into_iter()
        .map(|(row_id, _)| row_id)
        .collect()
    });
    if doomed.is_empty() {
      return 0;
    }
    for row_id in &doomed {
      self.writes.pending_attendees.delete(*row_id);
    }
    let count = doomed.len();
    self.log(move |t| {
      for row_id in doomed {
        t.pending_attendees.remove(&row_id);
      }
    });
    count
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    if !self.finished {
      self.rollback();
    }
  }
}
