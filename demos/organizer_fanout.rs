//! demos/organizer_fanout.rs
//!
//! Runs an organizer change through the work queue: the change fans out into one
//! Organizer-Send per attendee, and one attendee's delivery stays pending until the
//! retry budget is spent and the organizer's copy is annotated with `5.1`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use itipkeeper::{
  Calendar, CalendarHome, CalendarObject, Engine, ImplicitScheduler, ItipKeeper, OrganizerChange, OrganizerMessage,
  OrganizerSend, ScheduleAction, ScheduleResponse, SchedulingError, SendResult, Store, Transaction, WorkQueueConfig,
};
use tracing::info;

const EVENT: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:demo-event\r\n\
DTSTART:20261020T100000Z\r\n\
SUMMARY:Roadmap review\r\n\
ORGANIZER:mailto:organizer@example.com\r\n\
ATTENDEE:mailto:alice@example.com\r\n\
ATTENDEE:mailto:bob@unreachable.example\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

/// Pretends to deliver: anything at `unreachable.example` stays pending.
struct LoggingScheduler;

#[async_trait]
impl ImplicitScheduler for LoggingScheduler {
  async fn process_organizer_change(
    &self,
    _txn: &mut Transaction,
    change: OrganizerChange<'_>,
  ) -> Result<Vec<OrganizerMessage>, SchedulingError> {
    let Some(calendar) = change.calendar_new.or(change.calendar_old) else {
      return Ok(Vec::new());
    };
    Ok(
      calendar
        .attendees()
        .into_iter()
        .map(|attendee| OrganizerMessage {
          action: change.action,
          attendee: attendee.to_string(),
          itip_msg: calendar.to_string(),
          no_refresh: false,
        })
        .collect(),
    )
  }

  async fn send_organizer_message(
    &self,
    txn: &mut Transaction,
    message: OrganizerSend<'_>,
  ) -> Result<SendResult, SchedulingError> {
    #[cfg(feature = "job_context")]
    {
      let ctx = itipkeeper::work_context!();
      info!(job_id = ctx.job_id, attempt = ctx.attempt, attendee = message.attendee, "Delivering.");
    }
    let status = if message.attendee.ends_with("unreachable.example") {
      "1.0;Pending"
    } else {
      "1.2;Delivered"
    };
    Ok(SendResult {
      resource: message.resource.and_then(|r| txn.calendar_object(r.id)),
      responses: vec![ScheduleResponse::new().with(message.attendee, status)],
    })
  }

  async fn refresh_attendees(
    &self,
    _txn: &mut Transaction,
    _organizer_resource: &CalendarObject,
    attendees: &[String],
  ) -> Result<(), SchedulingError> {
    info!(?attendees, "Refreshing attendees.");
    Ok(())
  }

  async fn send_reply(
    &self,
    _txn: &mut Transaction,
    _home: &CalendarHome,
    _itip_msg: &Calendar,
    _originator: &str,
    recipient: &str,
  ) -> Result<ScheduleResponse, SchedulingError> {
    Ok(ScheduleResponse::new().with(recipient, "1.2;Delivered"))
  }

  async fn send_attendee_reply(
    &self,
    _txn: &mut Transaction,
    _home: &CalendarHome,
    resource: &CalendarObject,
  ) -> Result<ScheduleResponse, SchedulingError> {
    let organizer = resource
      .calendar()
      .ok()
      .and_then(|cal| cal.organizer().map(str::to_string))
      .unwrap_or_default();
    Ok(ScheduleResponse::new().with(&organizer, "1.2;Delivered"))
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,itipkeeper=info,organizer_fanout=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let config = WorkQueueConfig {
    max_temporary_failures: 2,
    temporary_failure_delay_seconds: 0.5,
    ..WorkQueueConfig::immediate()
  };
  let store = Store::new();
  let engine = Engine::new(config, Arc::new(LoggingScheduler));
  let keeper = ItipKeeper::builder()
    .max_workers(2)
    .store(store.clone())
    .engine(engine.clone())
    .poll_interval(StdDuration::from_millis(100))
    .build()?;

  let home = store.create_home("organizer", "mailto:organizer@example.com");
  let resource = store.create_calendar_object(home.id, "demo-event.ics", EVENT)?;
  let calendar = resource.calendar()?;

  let mut txn = store.begin();
  engine.schedule_organizer(
    &mut txn,
    "demo-event",
    ScheduleAction::Create,
    &home,
    Some(&resource),
    None,
    Some(&calendar),
    false,
  );
  txn.commit();

  if !keeper.tracker().wait_idle_timeout(StdDuration::from_secs(10)).await {
    info!("Work still in flight after 10s.");
  }

  if let Some(object) = store.calendar_object(resource.id) {
    info!("Organizer copy after delivery:\n{}", object.calendar_data);
  }
  info!(metrics = ?keeper.get_metrics_snapshot().await?, "Final metrics.");

  keeper.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}
