use crate::error::QueryError;
use crate::job::{JobDetails, JobId, JobSummary};
use crate::metrics::MetricsSnapshot;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Commands sent from the `ItipKeeper` handle to the central Coordinator task.
///
/// Each command includes a `oneshot::Sender` for the Coordinator to send the
/// response back to the requesting task.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Request detailed information about a specific job and its work item.
  GetJobDetails {
    job_id: JobId,
    responder: oneshot::Sender<Result<JobDetails, QueryError>>,
  },
  /// Request summary information for every job record in the store.
  ListAllJobs {
    responder: oneshot::Sender<Vec<JobSummary>>,
  },
  /// Request a snapshot of the current runtime metrics.
  GetMetricsSnapshot {
    responder: oneshot::Sender<MetricsSnapshot>,
  },
  /// Make a queued job eligible immediately.
  TriggerJobNow {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the runtime is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Wait for currently executing jobs to finish before shutting down.
  /// No new jobs are claimed.
  Graceful,
  /// Stop processing as soon as possible. Interrupted jobs roll back and are
  /// claimed again after their lease expires.
  Force,
}

/// Message sent from a Worker task back to the Coordinator after a job attempt.
#[derive(Debug)]
pub(crate) enum WorkerOutcome {
  /// The job stays queued and becomes eligible again at `next_run_time`.
  Reschedule {
    job_id: JobId,
    next_run_time: DateTime<Utc>,
    /// Failed attempts recorded on the job so far.
    failed: u32,
  },
  /// The job record is gone (finished) or parked (permanent failure).
  Complete {
    job_id: JobId,
    is_permanent_failure: bool,
  },
}
