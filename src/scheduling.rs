//! The boundary to the implicit scheduling machinery.
//!
//! Building iTIP messages, delivering them, and resolving calendar users all live
//! behind [`ImplicitScheduler`]. The work queue only decides *when* those operations
//! run, under which locks, and what happens to the delivery status they report.

use crate::error::SchedulingError;
use crate::ical::Calendar;
use crate::store::{CalendarHome, CalendarObject, Transaction};
use crate::work::ScheduleAction;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Delivery status for one recipient, as reported by the delivery layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
  pub recipient: String,
  /// Raw request status, e.g. `"1.2;Delivered"`.
  pub request_status: String,
}

/// The per-recipient result of one scheduling operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResponse {
  pub responses: Vec<RecipientStatus>,
}

impl ScheduleResponse {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, recipient: &str, request_status: &str) -> Self {
    self.responses.push(RecipientStatus {
      recipient: recipient.to_string(),
      request_status: request_status.to_string(),
    });
    self
  }
}

/// An organizer's change to a scheduling object, as captured when it was stored.
#[derive(Debug, Clone, Copy)]
pub struct OrganizerChange<'a> {
  pub action: ScheduleAction,
  pub home: &'a CalendarHome,
  /// `None` when the organizer's copy has been removed.
  pub resource: Option<&'a CalendarObject>,
  pub uid: &'a str,
  pub calendar_old: Option<&'a Calendar>,
  pub calendar_new: Option<&'a Calendar>,
  pub smart_merge: bool,
}

/// One iTIP message the organizer must send, produced by processing an [`OrganizerChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizerMessage {
  pub action: ScheduleAction,
  pub attendee: String,
  /// Serialized iTIP message.
  pub itip_msg: String,
  /// Suppress the attendee refresh this message would otherwise trigger.
  pub no_refresh: bool,
}

/// A single organizer-to-attendee delivery.
#[derive(Debug, Clone, Copy)]
pub struct OrganizerSend<'a> {
  pub action: ScheduleAction,
  pub home: &'a CalendarHome,
  pub resource: Option<&'a CalendarObject>,
  pub uid: &'a str,
  pub organizer: &'a str,
  pub attendee: &'a str,
  pub itip_msg: &'a Calendar,
  pub no_refresh: bool,
}

/// Outcome of an organizer delivery: the organizer's resource (if it still exists)
/// and the delivery responses to record on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResult {
  pub resource: Option<CalendarObject>,
  pub responses: Vec<ScheduleResponse>,
}

/// Performs implicit scheduling on behalf of the work queue.
///
/// Every call runs inside the transaction of the work item being executed, with the
/// item's UID locks held.
#[async_trait]
pub trait ImplicitScheduler: Send + Sync {
  /// Computes the iTIP messages an organizer change requires.
  async fn process_organizer_change(
    &self,
    txn: &mut Transaction,
    change: OrganizerChange<'_>,
  ) -> Result<Vec<OrganizerMessage>, SchedulingError>;

  /// Delivers one organizer message to one attendee.
  async fn send_organizer_message(
    &self,
    txn: &mut Transaction,
    message: OrganizerSend<'_>,
  ) -> Result<SendResult, SchedulingError>;

  /// Re-sends the organizer's current state to `attendees`.
  async fn refresh_attendees(
    &self,
    txn: &mut Transaction,
    organizer_resource: &CalendarObject,
    attendees: &[String],
  ) -> Result<(), SchedulingError>;

  /// Delivers a stored attendee reply from `originator` to `recipient`.
  async fn send_reply(
    &self,
    txn: &mut Transaction,
    home: &CalendarHome,
    itip_msg: &Calendar,
    originator: &str,
    recipient: &str,
  ) -> Result<ScheduleResponse, SchedulingError>;

  /// Builds and delivers a reply from the attendee's current copy of `resource`.
  async fn send_attendee_reply(
    &self,
    txn: &mut Transaction,
    home: &CalendarHome,
    resource: &CalendarObject,
  ) -> Result<ScheduleResponse, SchedulingError>;
}
