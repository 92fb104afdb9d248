//! itipkeeper: An Asynchronous Calendar Scheduling Work Queue
//!
//! Turns changes to calendar events (organizer edits, attendee replies, auto-accept
//! decisions) into ordered, retried, eventually consistent iTIP deliveries, and records
//! delivery status back onto the originating calendar object.
//!
//! # Features
//!
//! - Five kinds of scheduling work: organizer change processing, per-attendee organizer
//!   sends, attendee replies, batched attendee refreshes and auto-replies.
//! - A work group ledger giving per-UID mutual exclusion across workers.
//! - Chaining of organizer sends that share a UID.
//! - Refresh fan-out in batches, with duplicate attendees merged.
//! - A bounded retry policy that downgrades exhausted transient failures to a
//!   `5.1` schedule status.
//! - Migration of queued work between pods, arriving paused.
//! - A coordinator/worker runtime with leases, crash backoff, metrics, queries and
//!   graceful or forced shutdown.
//! - An in-flight tracker to wait until all enqueued work has drained.
//! - Optional task-local work context (`WorkContext`) for scheduler implementations
//!   (requires the `job_context` feature).
//!
//! Message construction and delivery are supplied by the host through the
//! [`ImplicitScheduler`] trait.
//!
//! # Usage
//!
//! ```no_run
//! use itipkeeper::{Calendar, Engine, ItipKeeper, Store, WorkQueueConfig};
//! # use itipkeeper::ImplicitScheduler;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(scheduler: Arc<dyn ImplicitScheduler>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::new();
//! let engine = Engine::new(WorkQueueConfig::default(), scheduler);
//!
//! let keeper = ItipKeeper::builder()
//!     .max_workers(4)
//!     .store(store.clone())
//!     .engine(engine.clone())
//!     .build()?;
//!
//! let home = store.create_home("user01", "mailto:user01@example.com");
//! let reply = Calendar::parse(&std::fs::read_to_string("reply.ics")?)?;
//! let mut txn = store.begin();
//! engine.schedule_reply(&mut txn, &home, None, &reply)?;
//! txn.commit();
//!
//! keeper.tracker().wait_idle().await;
//! keeper.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//! # Ok(())
//! # }
//! ```

// Declare modules
mod command;
pub mod config;
mod coordinator;
pub mod error;
pub mod ical;
pub mod job;
pub mod metrics;
pub mod scheduler;
pub mod scheduling;
pub mod status;
pub mod store;
pub mod tracker;
pub mod work;
mod worker;

// Re-export key public types for easier use
pub use command::ShutdownMode;
pub use config::WorkQueueConfig;
pub use error::{BuildError, QueryError, SchedulingError, ShutdownError, StoreError, WorkError};
pub use ical::{Calendar, ParseError};
pub use job::{JobDetails, JobId, JobRecord, JobState, JobSummary, Priority, WorkId};
pub use metrics::MetricsSnapshot;
pub use scheduler::{ItipKeeper, SchedulerBuilder};
pub use scheduling::{
  ImplicitScheduler, OrganizerChange, OrganizerMessage, OrganizerSend, RecipientStatus, ScheduleResponse, SendResult,
};
pub use status::RequestStatus;
pub use store::{CalendarHome, CalendarObject, ComponentUpdateState, HomeId, ResourceId, Store, Transaction};
pub use tracker::InFlightTracker;
pub use work::migrate::{MappedIds, SerializedWork};
pub use work::{
  Engine, NewWork, ScheduleAction, SkipReason, WorkHandle, WorkItem, WorkOutcome, WorkPayload, WorkType,
};
pub use worker::{run_job, JobRun};

#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_work_context, WorkContext};
