use crate::command::{ShutdownMode, WorkerOutcome};
use crate::error::WorkError;
use crate::job::{JobId, WorkerId};
use crate::metrics::SchedulerMetrics;
use crate::store::{Store, Transaction};
use crate::work::{group, Engine, WorkOutcome};

#[cfg(feature = "job_context")]
use crate::job::context::{WorkContext, CURRENT_WORK_CONTEXT};

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn, Instrument};

/// A claimed job id and the time it became due.
pub(crate) type JobDispatch = (JobId, DateTime<Utc>);

/// Knobs the worker needs to settle a job after an attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
  pub lock_retry_delay: Duration,
  pub crash_retry_base_delay: Duration,
  pub max_job_failures: u32,
}

/// What happened inside the transaction of one job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
  /// The work item ran and the transaction committed.
  Finished(WorkOutcome),
  /// The job owned no work. The job record was deleted.
  NoWork,
  /// Another transaction holds the UID group or the row. Nothing changed.
  LockBusy,
  /// The work item failed. The transaction rolled back.
  Failed(WorkError),
}

/// Executes one job in its own transaction: load its work, lock it, consume it, and
/// run it. Commits on success and rolls back otherwise. Leaves lease and failure
/// accounting to the caller.
pub async fn run_job(store: &Store, engine: &Engine, job_id: JobId) -> JobRun {
  let mut txn = store.begin();

  let Some(item) = group::load_for_job(&mut txn, job_id).into_iter().next() else {
    return finish_without_work(txn, job_id);
  };

  if !engine.lock(&mut txn, &item) {
    txn.abort();
    return JobRun::LockBusy;
  }
  // The previous holder of the lock may have consumed the item before releasing it.
  if txn.work_item(item.work_id).is_none() {
    return finish_without_work(txn, job_id);
  }

  txn.delete_work(item.work_id);
  match engine.run_work(&mut txn, &item).await {
    Ok(outcome) => {
      txn.delete_job(job_id);
      txn.commit();
      JobRun::Finished(outcome)
    }
    Err(error) => {
      txn.abort();
      JobRun::Failed(error)
    }
  }
}

fn finish_without_work(mut txn: Transaction, job_id: JobId) -> JobRun {
  debug!(job_id, "Job owns no work; deleting it.");
  txn.delete_job(job_id);
  txn.commit();
  JobRun::NoWork
}

/// Represents a worker task responsible for executing jobs.
///
/// Workers wait for job assignments from the Coordinator via a shared channel,
/// run the job (catching panics), settle its record in the store, and report the
/// outcome back to the Coordinator.
pub(crate) struct Worker {
  id: WorkerId,
  store: Store,
  engine: Engine,
  settings: WorkerSettings,
  metrics: SchedulerMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  job_dispatch_rx: async_channel::Receiver<JobDispatch>,
  active_workers_counter: Arc<AtomicUsize>,
}

impl Worker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: WorkerId,
    store: Store,
    engine: Engine,
    settings: WorkerSettings,
    metrics: SchedulerMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
    job_dispatch_rx: async_channel::Receiver<JobDispatch>,
    active_workers_counter: Arc<AtomicUsize>,
  ) -> Self {
    Self {
      id,
      store,
      engine,
      settings,
      metrics,
      shutdown_rx,
      worker_outcome_tx,
      job_dispatch_rx,
      active_workers_counter,
    }
  }

  /// Runs the main loop for the worker task.
  pub async fn run(&mut self) {
    info!(worker_id = self.id, "Worker started. Waiting for jobs...");

    loop {
      if self.is_shutting_down() {
        break;
      }

      tokio::select! {
          biased;

          Ok(()) = self.shutdown_rx.changed() => {
              let mode = *self.shutdown_rx.borrow();
              if mode.is_some() {
                  info!(worker_id = self.id, ?mode, "Worker received shutdown signal.");
                  break;
              }
          }

          result = self.job_dispatch_rx.recv() => {
              match result {
                  Ok((job_id, due)) => {
                      debug!(worker_id = self.id, job_id, %due, "Received job dispatch.");
                      self.record_wait(job_id, due);

                      let span = tracing::info_span!("job_exec", worker_id = self.id, job_id);
                      self.execute_and_handle(job_id).instrument(span).await;
                  }
                  Err(e) => {
                      if !self.is_shutting_down() {
                          error!(worker_id = self.id, "Job dispatch channel closed unexpectedly. Worker exiting. Error: {:?}", e);
                      } else {
                          info!(worker_id = self.id, "Job dispatch channel closed during shutdown. Worker exiting.");
                      }
                      break;
                  }
              }
          }
      }
    }

    info!(worker_id = self.id, "Worker task shutting down.");
  }

  fn is_shutting_down(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  fn record_wait(&self, job_id: JobId, due: DateTime<Utc>) {
    let wait = (Utc::now() - due).to_std().unwrap_or(Duration::ZERO);
    self.metrics.job_queue_wait_duration.record(wait);
    trace!(worker_id = self.id, job_id, wait_ms = wait.as_millis(), "Recorded queue wait time.");
  }

  /// Runs the job, settles it, and sends the outcome to the coordinator.
  async fn execute_and_handle(&self, job_id: JobId) {
    let start = Instant::now();
    let exec_result = self.execute_job_logic(job_id).await;
    let duration = start.elapsed();
    self.metrics.job_execution_duration.record(duration);

    let outcome_str = match &exec_result {
      Ok(JobRun::Finished(WorkOutcome::Completed)) => "Completed",
      Ok(JobRun::Finished(WorkOutcome::Skipped(_))) => "Skipped",
      Ok(JobRun::NoWork) => "NoWork",
      Ok(JobRun::LockBusy) => "LockBusy",
      Ok(JobRun::Failed(error)) if error.is_temporary() => "Temporary",
      Ok(JobRun::Failed(_)) => "Failed",
      Err(()) => "Panic",
    };
    info!(duration_ms = duration.as_millis(), outcome = outcome_str, "Finished job attempt.");

    let outcome = self.settle(job_id, exec_result);
    debug!(worker_id = self.id, job_id, "Sending job outcome to coordinator.");
    if self.worker_outcome_tx.send(outcome).await.is_err() {
      warn!(
        worker_id = self.id,
        job_id, "Failed to send job outcome to coordinator (runtime likely shutdown)."
      );
    }

    let prev_count = self.active_workers_counter.fetch_sub(1, AtomicOrdering::Relaxed);
    self
      .metrics
      .workers_active_current
      .store(prev_count.saturating_sub(1), AtomicOrdering::Relaxed);
    debug!(worker_id = self.id, prev_active = prev_count, "Decremented active worker count.");
  }

  /// Runs the job on its own task so that a panic cannot take the worker down.
  /// Returns `Err(())` for a panic.
  async fn execute_job_logic(&self, job_id: JobId) -> Result<JobRun, ()> {
    let store = self.store.clone();
    let engine = self.engine.clone();
    let future_to_run = async move { run_job(&store, &engine, job_id).await }.in_current_span();

    #[cfg(feature = "job_context")]
    let context = WorkContext {
      job_id,
      attempt: self.store.job(job_id).map_or(0, |job| job.failed),
      worker_id: self.id,
    };
    #[cfg(feature = "job_context")]
    let task = tokio::spawn(CURRENT_WORK_CONTEXT.scope(context, future_to_run));
    #[cfg(not(feature = "job_context"))]
    let task = tokio::spawn(future_to_run);

    match task.await {
      Ok(run) => Ok(run),
      Err(join_error) => {
        if join_error.is_panic() {
          #[cfg(feature = "job_context")]
          error!("Job panicked! Context: {:?}", context);
          #[cfg(not(feature = "job_context"))]
          error!(job_id, "Job panicked!");
          self.metrics.jobs_panicked.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
          warn!(job_id, "Job task was cancelled during execution.");
        }
        Err(())
      }
    }
  }

  /// Updates the job record for the attempt's result and builds the coordinator outcome.
  fn settle(&self, job_id: JobId, result: Result<JobRun, ()>) -> WorkerOutcome {
    let now = Utc::now();
    match result {
      Ok(JobRun::Finished(WorkOutcome::Completed)) => {
        self.metrics.jobs_executed_success.fetch_add(1, AtomicOrdering::Relaxed);
        WorkerOutcome::Complete {
          job_id,
          is_permanent_failure: false,
        }
      }
      Ok(JobRun::Finished(WorkOutcome::Skipped(reason))) => {
        self.metrics.jobs_skipped.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(job_id, ?reason, "Work skipped.");
        WorkerOutcome::Complete {
          job_id,
          is_permanent_failure: false,
        }
      }
      Ok(JobRun::NoWork) => {
        self.metrics.jobs_without_work.fetch_add(1, AtomicOrdering::Relaxed);
        WorkerOutcome::Complete {
          job_id,
          is_permanent_failure: false,
        }
      }
      Ok(JobRun::LockBusy) => {
        self.metrics.jobs_lock_deferred.fetch_add(1, AtomicOrdering::Relaxed);
        let next_run_time = now + to_chrono(self.settings.lock_retry_delay);
        debug!(job_id, next_run = %next_run_time, "UID locked elsewhere; deferring job.");
        match self.store.release_job(job_id, next_run_time) {
          Ok(job) => WorkerOutcome::Reschedule {
            job_id,
            next_run_time,
            failed: job.failed,
          },
          Err(e) => self.job_vanished(job_id, e),
        }
      }
      Ok(JobRun::Failed(WorkError::Temporary { delay })) => {
        self.metrics.jobs_temporary_failed.fetch_add(1, AtomicOrdering::Relaxed);
        let next_run_time = now + to_chrono(delay);
        match self.store.record_job_failure(job_id, next_run_time) {
          Ok(job) => {
            info!(job_id, failed = job.failed, next_run = %next_run_time, "Temporary delivery failure; retrying later.");
            WorkerOutcome::Reschedule {
              job_id,
              next_run_time,
              failed: job.failed,
            }
          }
          Err(e) => self.job_vanished(job_id, e),
        }
      }
      Ok(JobRun::Failed(_)) => {
        self.metrics.jobs_crashed.fetch_add(1, AtomicOrdering::Relaxed);
        self.settle_crash(job_id, now)
      }
      Err(()) => self.settle_crash(job_id, now),
    }
  }

  fn settle_crash(&self, job_id: JobId, now: DateTime<Utc>) -> WorkerOutcome {
    let Some(job) = self.store.job(job_id) else {
      warn!(job_id, "Crashed job no longer exists.");
      return WorkerOutcome::Complete {
        job_id,
        is_permanent_failure: false,
      };
    };

    if job.failed + 1 >= self.settings.max_job_failures {
      let parked = self
        .store
        .record_job_failure(job_id, job.not_before)
        .and_then(|_| self.store.mark_job_failed(job_id));
      if let Err(e) = parked {
        return self.job_vanished(job_id, e);
      }
      self.metrics.jobs_permanently_failed.fetch_add(1, AtomicOrdering::Relaxed);
      error!(
        job_id,
        failed = job.failed + 1,
        max_failures = self.settings.max_job_failures,
        "Job failed permanently after exhausting retries."
      );
      return WorkerOutcome::Complete {
        job_id,
        is_permanent_failure: true,
      };
    }

    let next_run_time = job.calculate_retry_time(self.settings.crash_retry_base_delay, now);
    match self.store.record_job_failure(job_id, next_run_time) {
      Ok(job) => {
        info!(
          worker_id = self.id,
          job_id,
          retry_attempt = job.failed,
          max_failures = self.settings.max_job_failures,
          next_run = %next_run_time,
          "Job failed, scheduling retry."
        );
        WorkerOutcome::Reschedule {
          job_id,
          next_run_time,
          failed: job.failed,
        }
      }
      Err(e) => self.job_vanished(job_id, e),
    }
  }

  fn job_vanished(&self, job_id: JobId, error: crate::error::StoreError) -> WorkerOutcome {
    warn!(worker_id = self.id, job_id, %error, "Job record disappeared while settling.");
    WorkerOutcome::Complete {
      job_id,
      is_permanent_failure: false,
    }
  }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
  ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}
