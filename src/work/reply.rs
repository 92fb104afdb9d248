use super::{AutoReplyWork, Engine, NewWork, ReplyWork, SkipReason, WorkHandle, WorkItem, WorkOutcome, WorkPayload};
use crate::error::WorkError;
use crate::ical::{Calendar, ParseError};
use crate::store::{CalendarHome, CalendarObject, Transaction};

use chrono::Utc;
use tracing::debug;

impl Engine {
  /// Queues delivery of an attendee's reply. `resource` is the attendee's copy, which
  /// receives the delivery status.
  pub fn schedule_reply(
    &self,
    txn: &mut Transaction,
    home: &CalendarHome,
    resource: Option<&CalendarObject>,
    itip_msg: &Calendar,
  ) -> Result<WorkHandle, WorkError> {
    let uid = itip_msg.uid().ok_or(ParseError::MissingProperty("UID"))?;
    let payload = WorkPayload::Reply(ReplyWork {
      itip_msg: itip_msg.to_string(),
    });
    let not_before = Utc::now() + self.config.reply_delay();
    Ok(self.enqueue(
      txn,
      NewWork::new(uid, home.id, resource.map(|r| r.id), payload, not_before),
    ))
  }

  /// Queues an automatic reply from the attendee who owns `resource`.
  pub fn schedule_auto_reply(&self, txn: &mut Transaction, resource: &CalendarObject, partstat: &str) -> WorkHandle {
    let payload = WorkPayload::AutoReply(AutoReplyWork {
      partstat: partstat.to_string(),
    });
    let not_before = Utc::now() + self.config.auto_reply_delay();
    self.enqueue(
      txn,
      NewWork::new(&resource.uid, resource.home_id, Some(resource.id), payload, not_before),
    )
  }

  pub(super) async fn execute_reply(
    &self,
    txn: &mut Transaction,
    item: &WorkItem,
    work: &ReplyWork,
  ) -> Result<WorkOutcome, WorkError> {
    let Some(home) = txn.calendar_home(item.home_resource_id) else {
      debug!(home_id = item.home_resource_id, "Attendee home is gone; dropping reply.");
      return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
    };
    let resource = match item.resource_id {
      Some(id) => match txn.calendar_object(id) {
        Some(resource) => Some(resource),
        None => {
          debug!(resource_id = id, "Attendee copy is gone; dropping reply.");
          return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
        }
      },
      None => None,
    };

    let itip_msg = Calendar::parse(&work.itip_msg)?;
    let organizer = itip_msg
      .organizer()
      .ok_or(ParseError::MissingProperty("ORGANIZER"))?
      .to_string();

    self.acquire_implicit_lock(txn, &item.icalendar_uid).await;

    let response = self
      .scheduler()
      .send_reply(txn, &home, &itip_msg, &home.calendar_user_address, &organizer)
      .await?;

    debug!(%organizer, "Sent attendee reply.");
    if let Some(resource) = resource {
      self.process_responses(txn, item.job_id, &resource, &[response], false)?;
    }
    Ok(WorkOutcome::Completed)
  }

  pub(super) async fn execute_auto_reply(
    &self,
    txn: &mut Transaction,
    item: &WorkItem,
  ) -> Result<WorkOutcome, WorkError> {
    // Other queued auto-replies for this resource would send the same current state.
    let duplicates = txn.work_items_where(|other| {
      matches!(other.payload, WorkPayload::AutoReply(_))
        && other.resource_id == item.resource_id
        && other.work_id != item.work_id
    });
    for duplicate in duplicates {
      if let Some(group) = txn.delete_work(duplicate.work_id) {
        txn.delete_job(group.job_id);
        self.dequeued(txn);
        debug!(work_id = duplicate.work_id, "Coalesced duplicate auto-reply.");
      }
    }

    let Some(home) = txn.calendar_home(item.home_resource_id) else {
      debug!(home_id = item.home_resource_id, "Attendee home is gone; dropping auto-reply.");
      return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
    };
    let Some(resource) = item.resource_id.and_then(|id| txn.calendar_object(id)) else {
      debug!(resource_id = ?item.resource_id, "Attendee copy is gone; dropping auto-reply.");
      return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
    };

    self.acquire_implicit_lock(txn, &item.icalendar_uid).await;

    let response = self.scheduler().send_attendee_reply(txn, &home, &resource).await?;

    debug!("Sent automatic attendee reply.");
    self.process_responses(txn, item.job_id, &resource, &[response], false)?;
    Ok(WorkOutcome::Completed)
  }
}
