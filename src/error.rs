use crate::ical::ParseError;
use crate::job::JobId;
use crate::store::ResourceId;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during the runtime building phase using `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
  #[error("An `Engine` must be supplied before the runtime can be built")]
  MissingEngine,
}

/// Errors raised by the in-process store when a referenced row does not exist.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("Calendar object resource {0} not found.")]
  ObjectNotFound(ResourceId),
}

/// Failure reported by an [`ImplicitScheduler`](crate::scheduling::ImplicitScheduler)
/// implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
  #[error("Calendar user '{0}' could not be resolved.")]
  UnknownCalendarUser(String),
  #[error("iTIP processing failed: {0}")]
  Processing(String),
}

/// The typed error taxonomy for executing a scheduling work item.
///
/// Only [`WorkError::Temporary`] is an expected outcome; everything else is an
/// unclassified failure that the job runtime retries with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
  /// Every recipient is still pending and the retry budget is not exhausted.
  /// The job is rescheduled after `delay`.
  #[error("Temporary delivery failure, retry in {delay:?}.")]
  Temporary { delay: Duration },
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Scheduling(#[from] SchedulingError),
  #[error("Invalid calendar data: {0}")]
  InvalidCalendarData(#[from] ParseError),
}

impl WorkError {
  /// True for the retry-later signal, false for crashes.
  pub fn is_temporary(&self) -> bool {
    matches!(self, WorkError::Temporary { .. })
  }
}

// --- Query Errors ---

/// Errors related to querying runtime state or job information
/// (e.g., via `get_job_details`, `get_metrics_snapshot`, `trigger_job_now`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("Runtime command channel is closed (likely shut down or panicked).")]
  SchedulerShutdown,
  #[error("Runtime did not respond to the query (Coordinator task may have panicked or shutdown unexpectedly).")]
  ResponseFailed,
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("Cannot trigger job {0}: Job is paused.")]
  TriggerFailedJobPaused(JobId),
  #[error("Cannot trigger job {0}: Job has permanently failed.")]
  TriggerFailedJobFailed(JobId),
}

// --- Shutdown Errors ---

/// Errors related to the runtime shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (runtime already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for runtime tasks (Coordinator, Workers) to complete shutdown.")]
  Timeout,
  #[error("A worker or coordinator task panicked during the shutdown process.")]
  TaskPanic,
}
