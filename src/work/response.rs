//! Delivery status handling shared by every kind that sends iTIP messages.

use super::Engine;
use crate::config::WorkQueueConfig;
use crate::error::WorkError;
use crate::ical::Calendar;
use crate::job::JobId;
use crate::scheduling::ScheduleResponse;
use crate::status::{status_code, MESSAGE_DELIVERED_CODE, MESSAGE_PENDING_CODE, SERVICE_UNAVAILABLE_CODE};
use crate::store::{CalendarObject, ComponentUpdateState, Transaction};

use tracing::{debug, info};

const SCHEDULE_STATUS: &str = "SCHEDULE-STATUS";

/// One recipient's delivery status, reduced to its `N.M` code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
  pub recipient: String,
  pub code: String,
}

impl DeliveryResult {
  pub fn is_delivered(&self) -> bool {
    self.code == MESSAGE_DELIVERED_CODE
  }

  pub fn is_pending(&self) -> bool {
    self.code == MESSAGE_PENDING_CODE
  }
}

/// Flattens responses into per-recipient results. The flag is `true` when every
/// recipient was delivered (vacuously so for no responses).
pub fn extract_scheduling_response(responses: &[ScheduleResponse]) -> (Vec<DeliveryResult>, bool) {
  let results: Vec<DeliveryResult> = responses
    .iter()
    .flat_map(|response| response.responses.iter())
    .map(|status| DeliveryResult {
      recipient: status.recipient.clone(),
      code: status_code(&status.request_status).to_string(),
    })
    .collect();
  let all_delivered = results.iter().all(DeliveryResult::is_delivered);
  (results, all_delivered)
}

/// Applies the bounded retry policy.
///
/// When at least one recipient is undelivered and all undelivered recipients are still
/// pending, the attempt is a temporary failure: below the retry budget this returns
/// [`WorkError::Temporary`], at or above it the pending codes become service-unavailable.
/// Any other mix (e.g. a permanent failure next to pending recipients) is recorded as is.
pub fn check_temporary_failure(
  failed: u32,
  config: &WorkQueueConfig,
  results: &mut [DeliveryResult],
) -> Result<(), WorkError> {
  let all_pending = {
    let mut undelivered = results.iter().filter(|result| !result.is_delivered()).peekable();
    undelivered.peek().is_some() && undelivered.all(DeliveryResult::is_pending)
  };
  if !all_pending {
    return Ok(());
  }

  if failed < config.max_temporary_failures {
    return Err(WorkError::Temporary {
      delay: config.temporary_failure_delay(),
    });
  }

  info!(failed, "Temporary delivery failures exhausted; marking recipients unavailable.");
  for result in results.iter_mut().filter(|result| result.is_pending()) {
    result.code = SERVICE_UNAVAILABLE_CODE.to_string();
  }
  Ok(())
}

/// Writes `SCHEDULE-STATUS` for every undelivered recipient onto the matching ATTENDEE
/// (organizer side) or ORGANIZER (attendee side) properties. Returns whether anything
/// changed.
pub fn handle_scheduling_response(results: &[DeliveryResult], calendar: &mut Calendar, is_organizer: bool) -> bool {
  let property = if is_organizer { "ATTENDEE" } else { "ORGANIZER" };
  let mut changed = false;
  for result in results.iter().filter(|result| !result.is_delivered()) {
    for prop in calendar.properties_named_mut(property) {
      if prop.value() == result.recipient {
        changed |= prop.set_parameter(SCHEDULE_STATUS, &result.code);
      }
    }
  }
  changed
}

impl Engine {
  /// Runs the response policy for a finished delivery and records undelivered statuses
  /// on `resource`. Returns `true` if the calendar object was rewritten.
  pub(crate) fn process_responses(
    &self,
    txn: &mut Transaction,
    job_id: JobId,
    resource: &CalendarObject,
    responses: &[ScheduleResponse],
    is_organizer: bool,
  ) -> Result<bool, WorkError> {
    let (mut results, all_delivered) = extract_scheduling_response(responses);
    if all_delivered {
      return Ok(false);
    }

    let failed = txn.job(job_id).map_or(0, |job| job.failed);
    check_temporary_failure(failed, &self.config, &mut results)?;

    // The scheduler may have rewritten the object during delivery; annotate what is stored.
    let current = txn.calendar_object(resource.id).unwrap_or_else(|| resource.clone());
    let mut calendar = current.calendar()?;
    if !handle_scheduling_response(&results, &mut calendar, is_organizer) {
      return Ok(false);
    }

    let state = if is_organizer {
      ComponentUpdateState::OrganizerItipUpdate
    } else {
      ComponentUpdateState::AttendeeItipUpdate
    };
    txn.set_component_internal(current.id, calendar.to_string(), state)?;
    debug!(resource_id = current.id, is_organizer, "Recorded delivery status on calendar object.");
    Ok(true)
  }
}
