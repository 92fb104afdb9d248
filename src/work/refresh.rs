//! Batched attendee refreshes.
//!
//! When an attendee changes their copy, the other attendees need the organizer's new
//! state. Triggers only record who needs a refresh; a Refresh work item later drains
//! those pending rows in fixed-size batches. Triggers that arrive while a drain is queued
//! merge into it: the newest queued item does the work and older ones become no-ops.

use super::{Engine, NewWork, RefreshWork, SkipReason, WorkHandle, WorkItem, WorkOutcome, WorkPayload};
use crate::error::WorkError;
use crate::store::{CalendarObject, Transaction};

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};

/// Distinct attendees in order of first appearance.
pub fn dedup_attendees(attendees: &[String]) -> Vec<String> {
  let mut seen = HashSet::new();
  attendees
    .iter()
    .filter(|attendee| seen.insert(attendee.as_str()))
    .cloned()
    .collect()
}

impl Engine {
  /// Records `attendees` as needing a refresh of `organizer_resource` and queues a drain.
  ///
  /// Attendees already pending for the resource are not recorded again. A new Refresh
  /// item is queued regardless, so that the newest trigger always has a drain behind it.
  pub fn refresh_attendees(
    &self,
    txn: &mut Transaction,
    organizer_resource: &CalendarObject,
    attendees: &[String],
  ) -> WorkHandle {
    self.enqueue_refresh(txn, organizer_resource, attendees, false)
  }

  pub(crate) fn enqueue_refresh(
    &self,
    txn: &mut Transaction,
    organizer_resource: &CalendarObject,
    attendees: &[String],
    pause: bool,
  ) -> WorkHandle {
    let pending: HashSet<String> = txn.pending_attendees(organizer_resource.id).into_iter().collect();
    let mut added = 0;
    for attendee in dedup_attendees(attendees) {
      if !pending.contains(&attendee) {
        txn.insert_pending_attendee(organizer_resource.id, &attendee);
        added += 1;
      }
    }
    debug!(
      resource_id = organizer_resource.id,
      requested = attendees.len(),
      added,
      "Recorded attendees pending refresh."
    );

    let not_before = Utc::now() + self.config.refresh_batch_delay();
    self.enqueue(
      txn,
      NewWork::new(
        &organizer_resource.uid,
        organizer_resource.home_id,
        Some(organizer_resource.id),
        WorkPayload::Refresh(RefreshWork {
          attendee_count: attendees.len(),
        }),
        not_before,
      )
      .with_pause(pause),
    )
  }

  pub(super) async fn execute_refresh(&self, txn: &mut Transaction, item: &WorkItem) -> Result<WorkOutcome, WorkError> {
    if is_superseded(txn, item) {
      debug!("A later refresh is queued for this resource; skipping.");
      return Ok(WorkOutcome::Skipped(SkipReason::Superseded));
    }
    let Some(resource_id) = item.resource_id else {
      return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
    };

    let pending = dedup_attendees(&txn.pending_attendees(resource_id));
    if pending.is_empty() {
      debug!(resource_id, "No attendees pending refresh.");
      return Ok(WorkOutcome::Completed);
    }

    let batch_size = self.config.refresh_batch_size().min(pending.len());
    let (batch, remaining) = pending.split_at(batch_size);
    let deleted = txn.delete_pending_attendees(resource_id, batch);

    // Always queue the next drain once a batch was taken; an empty follow-up just
    // completes, and it picks up anything triggered meanwhile.
    let not_before = Utc::now() + self.config.refresh_batch_interval();
    self.enqueue(
      txn,
      NewWork::new(
        &item.icalendar_uid,
        item.home_resource_id,
        Some(resource_id),
        WorkPayload::Refresh(RefreshWork {
          attendee_count: remaining.len(),
        }),
        not_before,
      ),
    );

    match txn.calendar_object(resource_id) {
      Some(resource) => {
        self.acquire_implicit_lock(txn, &resource.uid).await;
        self.scheduler().refresh_attendees(txn, &resource, batch).await?;
        info!(
          resource_id,
          refreshed = batch.len(),
          rows_deleted = deleted,
          remaining = remaining.len(),
          "Refreshed attendee batch."
        );
      }
      None => {
        debug!(resource_id, "Organizer copy is gone; dropping refresh batch.");
      }
    }
    Ok(WorkOutcome::Completed)
  }
}

/// True if a newer Refresh item exists for the same home and resource.
fn is_superseded(txn: &Transaction, item: &WorkItem) -> bool {
  !txn
    .work_items_where(|other| {
      matches!(other.payload, WorkPayload::Refresh(_))
        && other.home_resource_id == item.home_resource_id
        && other.resource_id == item.resource_id
        && other.work_id > item.work_id
    })
    .is_empty()
}
