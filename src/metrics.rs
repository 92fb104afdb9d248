use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Execution Time Accumulator ---

/// Count and total of observed durations. Enough for a mean, no percentiles.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    let micros = usize::try_from(duration.as_micros()).unwrap_or(usize::MAX);
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(micros, Ordering::Relaxed);
  }

  /// Number of recorded durations.
  pub fn observations(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Sum of recorded durations, in microseconds.
  pub fn total_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Runtime Counters ---

/// Runtime metrics backed by atomic counters.
///
/// Cloned into the Coordinator and every Worker. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Counters ---
  /// Jobs claimed from the store and handed to a worker.
  pub jobs_claimed: Arc<AtomicUsize>,
  /// Work items that completed.
  pub jobs_executed_success: Arc<AtomicUsize>,
  /// Work items skipped because their target was gone or a later item superseded them.
  pub jobs_skipped: Arc<AtomicUsize>,
  /// Jobs found without work (already consumed or coalesced away).
  pub jobs_without_work: Arc<AtomicUsize>,
  /// Attempts deferred because another transaction held the UID lock.
  pub jobs_lock_deferred: Arc<AtomicUsize>,
  /// Attempts that ended in a temporary delivery failure.
  pub jobs_temporary_failed: Arc<AtomicUsize>,
  /// Attempts that failed with an unclassified error.
  pub jobs_crashed: Arc<AtomicUsize>,
  /// Attempts that panicked.
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Jobs parked after exhausting `max_job_failures`.
  pub jobs_permanently_failed: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Jobs queued and not paused.
  pub job_queue_scheduled_current: Arc<AtomicUsize>,
  /// Workers currently executing a job.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  pub job_execution_duration: Arc<SimpleHistogram>,
  /// Time between a job becoming due and a worker starting it.
  pub job_queue_wait_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_claimed: self.jobs_claimed.load(order),
      jobs_executed_success: self.jobs_executed_success.load(order),
      jobs_skipped: self.jobs_skipped.load(order),
      jobs_without_work: self.jobs_without_work.load(order),
      jobs_lock_deferred: self.jobs_lock_deferred.load(order),
      jobs_temporary_failed: self.jobs_temporary_failed.load(order),
      jobs_crashed: self.jobs_crashed.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_permanently_failed: self.jobs_permanently_failed.load(order),
      job_queue_scheduled_current: self.job_queue_scheduled_current.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.observations(),
      job_execution_duration_sum_micros: self.job_execution_duration.total_micros(),
      job_queue_wait_duration_count: self.job_queue_wait_duration.observations(),
      job_queue_wait_duration_sum_micros: self.job_queue_wait_duration.total_micros(),
    }
  }
}

// --- Snapshot ---

/// A snapshot of the runtime's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_claimed: usize,
  pub jobs_executed_success: usize,
  pub jobs_skipped: usize,
  pub jobs_without_work: usize,
  pub jobs_lock_deferred: usize,
  pub jobs_temporary_failed: usize,
  pub jobs_crashed: usize,
  pub jobs_panicked: usize,
  pub jobs_permanently_failed: usize,
  // Gauges
  pub job_queue_scheduled_current: usize,
  pub workers_active_current: usize,
  // Histogram Data
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
  pub job_queue_wait_duration_count: usize,
  pub job_queue_wait_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration in microseconds, `None` if nothing ran yet.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  /// Mean queue wait in microseconds, `None` if nothing ran yet.
  pub fn mean_queue_wait_micros(&self) -> Option<f64> {
    if self.job_queue_wait_duration_count == 0 {
      None
    } else {
      Some(self.job_queue_wait_duration_sum_micros as f64 / self.job_queue_wait_duration_count as f64)
    }
  }

  /// Attempts that did not finish the job this time round.
  pub fn failed_attempts(&self) -> usize {
    self.jobs_temporary_failed + self.jobs_crashed + self.jobs_panicked
  }
}
