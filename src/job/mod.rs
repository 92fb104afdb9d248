#[cfg(feature = "job_context")]
pub mod context;

use crate::work::WorkType;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

// --- Public Type Aliases ---

/// Identifier of a durable job record. Allocated from the store's id sequence.
pub type JobId = u64;

/// Identifier of a work item. Work ids grow monotonically, so "oldest" means "lowest id".
pub type WorkId = u64;

/// Relative cost hint carried on a job. Larger is heavier.
pub type Weight = u8;

/// Weight used for all scheduling work unless a caller overrides it.
pub const DEFAULT_WEIGHT: Weight = 5;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

/// Claim priority. Higher priorities are claimed first among due jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
  /// Waiting for (or undergoing) execution.
  Queued,
  /// Crashed `max_job_failures` times. Kept paused for inspection.
  PermanentlyFailed,
}

/// The durable job record that owns exactly one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
  pub job_id: JobId,
  pub work_type: WorkType,
  pub priority: Priority,
  pub weight: Weight,
  /// Earliest time the job may be claimed.
  pub not_before: DateTime<Utc>,
  /// Paused jobs are never claimed.
  pub pause: bool,
  /// Number of failed attempts (temporary failures and crashes).
  pub failed: u32,
  /// Lease stamp of the runtime that claimed the job.
  pub assigned: Option<DateTime<Utc>>,
  pub state: JobState,
}

impl JobRecord {
  pub(crate) fn new(
    job_id: JobId,
    work_type: WorkType,
    priority: Priority,
    weight: Weight,
    not_before: DateTime<Utc>,
    pause: bool,
  ) -> Self {
    Self {
      job_id,
      work_type,
      priority,
      weight,
      not_before,
      pause,
      failed: 0,
      assigned: None,
      state: JobState::Queued,
    }
  }

  /// Whether the job can be claimed at `now`. A lease older than `lease` is treated as
  /// abandoned by a crashed runtime.
  pub fn is_eligible(&self, now: DateTime<Utc>, lease: ChronoDuration) -> bool {
    self.state == JobState::Queued
      && !self.pause
      && self.not_before <= now
      && self.assigned.map_or(true, |assigned| assigned + lease <= now)
  }

  /// Whether a runtime currently holds an unexpired lease on the job.
  pub fn holds_lease(&self, now: DateTime<Utc>, lease: ChronoDuration) -> bool {
    self.state == JobState::Queued && self.assigned.map_or(false, |assigned| assigned + lease > now)
  }

  /// Calculates the next attempt time after a crash, using exponential backoff
  /// on the number of failures recorded so far.
  pub(crate) fn calculate_retry_time(&self, base_delay: StdDuration, now: DateTime<Utc>) -> DateTime<Utc> {
    let factor: u64 = 3;
    let max_exponent: u32 = 5;
    let exponent = std::cmp::min(self.failed, max_exponent);
    let factor_pow = factor.checked_pow(exponent).unwrap_or(u64::MAX);
    let base_millis: u64 = base_delay.as_millis().try_into().unwrap_or(u64::MAX);
    let backoff_millis = base_millis.checked_mul(factor_pow).unwrap_or(u64::MAX);

    match i64::try_from(backoff_millis) {
      Ok(millis) => now
        .checked_add_signed(ChronoDuration::milliseconds(millis))
        .unwrap_or_else(|| {
          warn!(job_id = self.job_id, attempt = self.failed + 1, "Exponential backoff duration overflowed.");
          now + ChronoDuration::days(365)
        }),
      Err(_) => {
        warn!(
          job_id = self.job_id,
          attempt = self.failed + 1,
          "Exponential backoff duration exceeds i64::MAX milliseconds."
        );
        now + ChronoDuration::days(365)
      }
    }
  }
}

// --- Public Snapshot Structs for Querying ---

/// A summary of a job's state, suitable for listing multiple jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
  pub job_id: JobId,
  pub work_type: WorkType,
  pub not_before: DateTime<Utc>,
  pub failed: u32,
  pub pause: bool,
  pub state: JobState,
}

impl From<&JobRecord> for JobSummary {
  fn from(job: &JobRecord) -> Self {
    Self {
      job_id: job.job_id,
      work_type: job.work_type,
      not_before: job.not_before,
      failed: job.failed,
      pause: job.pause,
      state: job.state,
    }
  }
}

/// Detailed information about a job and the work item it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails {
  pub job: JobRecord,
  /// The owned work item, `None` if it has already been consumed.
  pub work_id: Option<WorkId>,
  /// The iCalendar UID the work is grouped under.
  pub icalendar_uid: Option<String>,
}
