use super::{Engine, NewWork, OrganizerSendWork, OrganizerWork, ScheduleAction, SkipReason, WorkHandle, WorkItem, WorkOutcome, WorkPayload};
use crate::error::WorkError;
use crate::ical::{Calendar, ParseError};
use crate::scheduling::{OrganizerChange, OrganizerSend};
use crate::store::{CalendarHome, CalendarObject, Transaction};

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info};

impl Engine {
  /// Queues processing of an organizer's change to a scheduling object.
  ///
  /// `calendar_old` is absent on create and `calendar_new` on remove. The work becomes
  /// eligible after `request_delay_seconds`.
  #[allow(clippy::too_many_arguments)]
  pub fn schedule_organizer(
    &self,
    txn: &mut Transaction,
    uid: &str,
    action: ScheduleAction,
    home: &CalendarHome,
    resource: Option<&CalendarObject>,
    calendar_old: Option<&Calendar>,
    calendar_new: Option<&Calendar>,
    smart_merge: bool,
  ) -> WorkHandle {
    let attendee_count = calendar_new.or(calendar_old).map_or(0, |cal| cal.attendees().len());
    let payload = WorkPayload::Organizer(OrganizerWork {
      action,
      icalendar_text_old: calendar_old.map(Calendar::to_string),
      icalendar_text_new: calendar_new.map(Calendar::to_string),
      attendee_count,
      smart_merge,
      organizer: home.calendar_user_address.clone(),
    });
    let not_before = Utc::now() + self.config.request_delay();
    self.enqueue(
      txn,
      NewWork::new(uid, home.id, resource.map(|r| r.id), payload, not_before),
    )
  }

  /// Queues delivery of one organizer message to one attendee, `stagger` after the
  /// usual request delay.
  #[allow(clippy::too_many_arguments)]
  pub fn schedule_organizer_send(
    &self,
    txn: &mut Transaction,
    action: ScheduleAction,
    home: &CalendarHome,
    resource: Option<&CalendarObject>,
    attendee: &str,
    itip_msg: &Calendar,
    no_refresh: bool,
    stagger: ChronoDuration,
  ) -> Result<WorkHandle, WorkError> {
    let uid = itip_msg.uid().ok_or(ParseError::MissingProperty("UID"))?;
    let payload = WorkPayload::OrganizerSend(OrganizerSendWork {
      action,
      attendee: attendee.to_string(),
      itip_msg: itip_msg.to_string(),
      no_refresh,
    });
    let not_before = Utc::now() + self.config.request_delay() + stagger;
    Ok(self.enqueue(
      txn,
      NewWork::new(uid, home.id, resource.map(|r| r.id), payload, not_before),
    ))
  }

  pub(super) async fn execute_organizer(
    &self,
    txn: &mut Transaction,
    item: &WorkItem,
    work: &OrganizerWork,
  ) -> Result<WorkOutcome, WorkError> {
    let Some(home) = txn.calendar_home(item.home_resource_id) else {
      debug!(home_id = item.home_resource_id, "Organizer home is gone; dropping organizer work.");
      return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
    };
    // A removed organizer copy is expected for cancellations.
    let resource = item.resource_id.and_then(|id| txn.calendar_object(id));
    let calendar_old = work.icalendar_text_old.as_deref().map(Calendar::parse).transpose()?;
    let calendar_new = work.icalendar_text_new.as_deref().map(Calendar::parse).transpose()?;

    self.acquire_implicit_lock(txn, &item.icalendar_uid).await;

    let messages = self
      .scheduler()
      .process_organizer_change(
        txn,
        OrganizerChange {
          action: work.action,
          home: &home,
          resource: resource.as_ref(),
          uid: &item.icalendar_uid,
          calendar_old: calendar_old.as_ref(),
          calendar_new: calendar_new.as_ref(),
          smart_merge: work.smart_merge,
        },
      )
      .await?;

    info!(action = %work.action, sends = messages.len(), "Processed organizer change.");
    for (index, message) in messages.into_iter().enumerate() {
      let itip_msg = Calendar::parse(&message.itip_msg)?;
      self.schedule_organizer_send(
        txn,
        message.action,
        &home,
        resource.as_ref(),
        &message.attendee,
        &itip_msg,
        message.no_refresh,
        self.config.stagger(index),
      )?;
    }
    Ok(WorkOutcome::Completed)
  }

  pub(super) async fn execute_organizer_send(
    &self,
    txn: &mut Transaction,
    item: &WorkItem,
    work: &OrganizerSendWork,
  ) -> Result<WorkOutcome, WorkError> {
    let Some(home) = txn.calendar_home(item.home_resource_id) else {
      debug!(home_id = item.home_resource_id, "Organizer home is gone; dropping send.");
      return Ok(WorkOutcome::Skipped(SkipReason::MissingResource));
    };
    let resource = item.resource_id.and_then(|id| txn.calendar_object(id));
    let itip_msg = Calendar::parse(&work.itip_msg)?;

    self.acquire_implicit_lock(txn, &item.icalendar_uid).await;

    let result = self
      .scheduler()
      .send_organizer_message(
        txn,
        OrganizerSend {
          action: work.action,
          home: &home,
          resource: resource.as_ref(),
          uid: &item.icalendar_uid,
          organizer: &home.calendar_user_address,
          attendee: &work.attendee,
          itip_msg: &itip_msg,
          no_refresh: work.no_refresh,
        },
      )
      .await?;

    debug!(action = %work.action, attendee = %work.attendee, "Sent organizer message.");
    if let Some(resource) = result.resource {
      self.process_responses(txn, item.job_id, &resource, &result.responses, true)?;
    }
    Ok(WorkOutcome::Completed)
  }
}
