//! The work group ledger.
//!
//! Every work item has exactly one group row recording its iCalendar UID and kind.
//! Locking the UID group gives mutual exclusion between all work for one UID, no
//! matter which kind it is, and lets a finishing item find its queued siblings.

use super::{WorkItem, WorkType};
use crate::error::StoreError;
use crate::job::{JobId, WorkId};
use crate::store::Transaction;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkGroup {
  pub work_id: WorkId,
  pub job_id: JobId,
  pub icalendar_uid: String,
  pub work_type: WorkType,
}

pub(crate) fn group_lock_key(uid: &str) -> String {
  format!("schedule_work:uid:{uid}")
}

pub(crate) fn row_lock_key(work_id: WorkId) -> String {
  format!("schedule_work:row:{work_id}")
}

/// Try-locks the item's UID group, then the item's own row. Never waits.
///
/// A `false` result means another transaction is working on the same UID (or on this
/// very item) and the caller should retry later. Locks taken here are held until
/// `txn` ends.
pub fn lock(txn: &mut Transaction, item: &WorkItem) -> bool {
  if !txn.try_lock(&group_lock_key(&item.icalendar_uid)) {
    trace!(work_id = item.work_id, uid = %item.icalendar_uid, "UID group is locked.");
    return false;
  }
  if !txn.try_lock(&row_lock_key(item.work_id)) {
    trace!(work_id = item.work_id, "Work row is locked.");
    return false;
  }
  true
}

/// Loads the work owned by `job_id`, deleting group rows whose kind row is gone.
pub fn load_for_job(txn: &mut Transaction, job_id: JobId) -> Vec<WorkItem> {
  let mut items = Vec::new();
  for group in txn.groups_for_job(job_id) {
    match txn.work_item(group.work_id) {
      Some(item) => items.push(item),
      None => {
        warn!(job_id, work_id = group.work_id, uid = %group.icalendar_uid, "Removing orphaned work group.");
        txn.delete_orphan_group(group.work_id);
      }
    }
  }
  items
}

/// The oldest group for `uid` other than `excluding`, of any kind.
pub fn find_next_sibling(txn: &Transaction, uid: &str, excluding: WorkId) -> Option<WorkGroup> {
  txn
    .groups_for_uid(uid)
    .into_iter()
    .filter(|group| group.work_id != excluding)
    .min_by_key(|group| group.work_id)
}

/// Whether any work of `work_type` is queued.
pub fn has_work(txn: &Transaction, work_type: WorkType) -> bool {
  txn.has_work_of_type(work_type)
}

/// Makes the next sibling of a finished coalescible item eligible at `now`.
///
/// Only the oldest sibling is considered, and only if it is of the same kind; any other
/// kind keeps its own schedule. Returns the promoted work id.
pub fn chain_next(
  txn: &mut Transaction,
  item: &WorkItem,
  now: DateTime<Utc>,
) -> Result<Option<WorkId>, StoreError> {
  let work_type = item.work_type();
  if !work_type.is_coalescible() {
    return Ok(None);
  }

  match find_next_sibling(txn, &item.icalendar_uid, item.work_id) {
    Some(next) if next.work_type == work_type => {
      txn.set_job_not_before(next.job_id, now)?;
      debug!(
        work_id = item.work_id,
        next_work_id = next.work_id,
        next_job_id = next.job_id,
        "Promoted sibling work."
      );
      Ok(Some(next.work_id))
    }
    _ => Ok(None),
  }
}
