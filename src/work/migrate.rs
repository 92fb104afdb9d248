//! Moving queued scheduling work between pods.
//!
//! The source pod serializes a home's work with [`work_items_for_home`]; the destination
//! re-creates each item with [`Engine::migrate`], mapping resource ids to its own rows.
//! Migrated work arrives paused and runs only after [`unpause_work`].

use super::{Engine, NewWork, WorkItem, WorkPayload};
use crate::error::WorkError;
use crate::ical::{Calendar, ParseError};
use crate::store::{CalendarHome, CalendarObject, HomeId, ResourceId, Transaction};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A work item plus the ancillary rows it needs on another pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedWork {
  pub work: WorkItem,
  /// Pending refresh attendees of the item's resource. Only set for Refresh work.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub refresh_attendees: Vec<String>,
}

impl SerializedWork {
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }

  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}

/// Destination-side rows that correspond to a migrated item's source ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedIds {
  pub home: Option<CalendarHome>,
  pub resource: Option<CalendarObject>,
}

/// Serializes every work item of `home_id`, oldest first.
pub fn work_items_for_home(txn: &Transaction, home_id: HomeId) -> Vec<SerializedWork> {
  txn
    .work_items_where(|item| item.home_resource_id == home_id)
    .into_iter()
    .map(|work| {
      let refresh_attendees = match (&work.payload, work.resource_id) {
        (WorkPayload::Refresh(_), Some(resource_id)) => txn.pending_attendees(resource_id),
        _ => Vec::new(),
      };
      SerializedWork {
        work,
        refresh_attendees,
      }
    })
    .collect()
}

/// Pauses every job owning work for `home_id`. Returns the number of jobs touched.
pub fn pause_work(txn: &mut Transaction, home_id: HomeId) -> Result<usize, WorkError> {
  set_pause(txn, home_id, true)
}

/// Makes paused work for `home_id` claimable again.
pub fn unpause_work(txn: &mut Transaction, home_id: HomeId) -> Result<usize, WorkError> {
  set_pause(txn, home_id, false)
}

fn set_pause(txn: &mut Transaction, home_id: HomeId, pause: bool) -> Result<usize, WorkError> {
  let items = txn.work_items_where(|item| item.home_resource_id == home_id);
  for item in &items {
    txn.set_job_pause(item.job_id, pause)?;
  }
  debug!(home_id, pause, jobs = items.len(), "Updated pause state of home work.");
  Ok(items.len())
}

impl Engine {
  /// Re-creates a serialized item on this pod, paused.
  ///
  /// `map_ids` receives the source resource id and returns the local home and resource.
  /// Returns `Ok(false)` when the item cannot be placed: Organizer, Organizer-Send and
  /// Reply work need a resource only if they had one; Refresh and Auto-Reply always do.
  pub fn migrate<F>(&self, txn: &mut Transaction, record: &SerializedWork, map_ids: F) -> Result<bool, WorkError>
  where
    F: FnOnce(Option<ResourceId>) -> MappedIds,
  {
    let source = &record.work;
    let mapped = map_ids(source.resource_id);
    let Some(home) = mapped.home else {
      debug!(work_id = source.work_id, "No destination home for migrated work.");
      return Ok(false);
    };

    let now = Utc::now();
    let new = match &source.payload {
      WorkPayload::Organizer(work) => {
        if source.resource_id.is_some() && mapped.resource.is_none() {
          return Ok(false);
        }
        let text = work
          .icalendar_text_new
          .as_deref()
          .or(work.icalendar_text_old.as_deref())
          .ok_or(ParseError::NotCalendar)?;
        let calendar = Calendar::parse(text)?;
        let uid = calendar.uid().ok_or(ParseError::MissingProperty("UID"))?;
        let mut work = work.clone();
        work.organizer = home.calendar_user_address.clone();
        NewWork::new(
          uid,
          home.id,
          mapped.resource.as_ref().map(|r| r.id),
          WorkPayload::Organizer(work),
          now + self.config.request_delay(),
        )
      }
      WorkPayload::OrganizerSend(work) => {
        if source.resource_id.is_some() && mapped.resource.is_none() {
          return Ok(false);
        }
        let uid = message_uid(&work.itip_msg)?;
        NewWork::new(
          &uid,
          home.id,
          mapped.resource.as_ref().map(|r| r.id),
          source.payload.clone(),
          now + self.config.request_delay(),
        )
      }
      WorkPayload::Reply(work) => {
        if source.resource_id.is_some() && mapped.resource.is_none() {
          return Ok(false);
        }
        let uid = message_uid(&work.itip_msg)?;
        NewWork::new(
          &uid,
          home.id,
          mapped.resource.as_ref().map(|r| r.id),
          source.payload.clone(),
          now + self.config.reply_delay(),
        )
      }
      WorkPayload::Refresh(_) => {
        let Some(resource) = mapped.resource else {
          return Ok(false);
        };
        let handle = self.enqueue_refresh(txn, &resource, &record.refresh_attendees, true);
        info!(source_work_id = source.work_id, work_id = handle.work_id, "Migrated refresh work.");
        return Ok(true);
      }
      WorkPayload::AutoReply(_) => {
        let Some(resource) = mapped.resource else {
          return Ok(false);
        };
        NewWork::new(
          &resource.uid,
          home.id,
          Some(resource.id),
          source.payload.clone(),
          now + self.config.auto_reply_delay(),
        )
      }
    };

    let handle = self.enqueue(txn, new.with_pause(true));
    info!(
      source_work_id = source.work_id,
      work_id = handle.work_id,
      work_type = %source.work_type(),
      "Migrated scheduling work."
    );
    Ok(true)
  }

  /// Deletes all work of `home_id` after it has been migrated away.
  /// Returns the number of items removed.
  pub fn remove_work_for_home(&self, txn: &mut Transaction, home_id: HomeId) -> usize {
    let items = txn.work_items_where(|item| item.home_resource_id == home_id);
    let mut removed = 0;
    for item in items {
      if let Some(group) = txn.delete_work(item.work_id) {
        txn.delete_job(group.job_id);
        self.dequeued(txn);
        removed += 1;
      }
    }
    info!(home_id, removed, "Removed migrated scheduling work.");
    removed
  }
}

fn message_uid(itip_msg: &str) -> Result<String, WorkError> {
  let calendar = Calendar::parse(itip_msg)?;
  let uid = calendar.uid().ok_or(ParseError::MissingProperty("UID"))?;
  Ok(uid.to_string())
}
