use crate::command::{CoordinatorCommand, ShutdownMode, WorkerOutcome};
use crate::error::QueryError;
use crate::job::{JobDetails, JobState, JobSummary};
use crate::metrics::SchedulerMetrics;
use crate::store::Store;
use crate::worker::JobDispatch;

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Internal state owned by the Coordinator task.
#[derive(Debug)]
pub(crate) struct CoordinatorState {
  store: Store,
  // Receivers
  cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
  // Sender
  job_dispatch_tx: async_channel::Sender<JobDispatch>,
  // Metrics & Counters
  metrics: SchedulerMetrics,
  active_workers_counter: Arc<AtomicUsize>,
  max_workers: usize,
  poll_interval: Duration,
  lease_duration: ChronoDuration,
  max_load: Option<u32>,
}

impl CoordinatorState {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    store: Store,
    cmd_rx: mpsc::Receiver<CoordinatorCommand>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    job_dispatch_tx: async_channel::Sender<JobDispatch>,
    worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
    metrics: SchedulerMetrics,
    active_workers_counter: Arc<AtomicUsize>,
    max_workers: usize,
    poll_interval: Duration,
    lease_duration: ChronoDuration,
    max_load: Option<u32>,
  ) -> Self {
    Self {
      store,
      cmd_rx,
      shutdown_rx,
      worker_outcome_rx,
      job_dispatch_tx,
      metrics,
      active_workers_counter,
      max_workers,
      poll_interval,
      lease_duration,
      max_load,
    }
  }
}

/// The central Coordinator task.
///
/// Claims due jobs from the store and hands them to idle workers. It wakes on store
/// commits, worker outcomes, commands, and a timer aimed at the next due job.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  shutting_down: Option<ShutdownMode>,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    Self {
      state,
      shutting_down: None,
    }
  }

  /// Runs the main event loop for the Coordinator.
  pub async fn run(&mut self) {
    info!("Coordinator started.");
    let store = self.state.store.clone();

    loop {
      self.update_gauge_metrics();
      if self.shutting_down.is_none() {
        self.try_dispatch_jobs().await;
      }
      let sleep_duration = self.calculate_sleep();

      tokio::select! {
          biased;

          Ok(()) = self.state.shutdown_rx.changed() => {
              let shutdown_mode_opt = *self.state.shutdown_rx.borrow();
              if shutdown_mode_opt != self.shutting_down {
                  match shutdown_mode_opt {
                      Some(mode) => {
                          self.shutting_down = Some(mode);
                          info!(?mode, "Coordinator received shutdown signal.");
                          if mode == ShutdownMode::Force {
                              info!("Forced shutdown initiated, coordinator loop breaking.");
                              break;
                          }
                      }
                      None => {
                          warn!("Shutdown signal unexpectedly cleared. Resuming normal operation.");
                          self.shutting_down = None;
                      }
                  }
              }
          },

          // Commands are served even while draining.
          maybe_cmd = self.state.cmd_rx.recv() => {
              if let Some(cmd) = maybe_cmd {
                  self.handle_command(cmd);
              } else if self.shutting_down.is_none() {
                  warn!("Command channel closed unexpectedly. Initiating graceful shutdown.");
                  self.shutting_down = Some(ShutdownMode::Graceful);
              }
          },

          maybe_outcome = self.state.worker_outcome_rx.recv() => {
              match maybe_outcome {
                  Some(outcome) => self.handle_worker_outcome(outcome),
                  None => {
                      if self.shutting_down.is_none() {
                          error!("Worker outcome channel closed unexpectedly!");
                      }
                  }
              }
          },

          () = store.committed(), if self.shutting_down.is_none() => {
              trace!("Woken by store commit.");
          },

          () = sleep(sleep_duration) => {
              trace!("Timer fired.");
          },
      }

      if self.shutting_down == Some(ShutdownMode::Graceful) {
        let active_count = self.state.active_workers_counter.load(AtomicOrdering::Relaxed);
        if active_count == 0 {
          info!(
            "Graceful shutdown: All workers idle ({}/{} active). Coordinator exiting.",
            active_count, self.state.max_workers
          );
          break;
        }
        trace!(active_workers = active_count, "Graceful shutdown: Waiting for active workers.");
      }
    }

    info!("Coordinator task shutting down.");
    // Wakes any worker still waiting for a dispatch.
    self.state.job_dispatch_tx.close();
  }

  fn update_gauge_metrics(&self) {
    self
      .state
      .metrics
      .job_queue_scheduled_current
      .store(self.state.store.queued_count(), AtomicOrdering::Relaxed);
    self.state.metrics.workers_active_current.store(
      self.state.active_workers_counter.load(AtomicOrdering::Relaxed),
      AtomicOrdering::Relaxed,
    );
  }

  fn handle_command(&mut self, cmd: CoordinatorCommand) {
    match cmd {
      CoordinatorCommand::GetJobDetails { job_id, responder } => {
        let result = match self.state.store.job(job_id) {
          Some(job) => {
            let group = {
              let txn = self.state.store.begin();
              txn.groups_for_job(job_id).into_iter().next()
            };
            Ok(JobDetails {
              job,
              work_id: group.as_ref().map(|g| g.work_id),
              icalendar_uid: group.map(|g| g.icalendar_uid),
            })
          }
          None => Err(QueryError::JobNotFound(job_id)),
        };
        let _ = responder.send(result);
      }
      CoordinatorCommand::ListAllJobs { responder } => {
        let summaries = self.state.store.jobs().iter().map(JobSummary::from).collect();
        let _ = responder.send(summaries);
      }
      CoordinatorCommand::GetMetricsSnapshot { responder } => {
        self.update_gauge_metrics();
        let _ = responder.send(self.state.metrics.snapshot());
      }
      CoordinatorCommand::TriggerJobNow { job_id, responder } => {
        let result = match self.state.store.job(job_id) {
          None => Err(QueryError::JobNotFound(job_id)),
          Some(job) if job.state == JobState::PermanentlyFailed => Err(QueryError::TriggerFailedJobFailed(job_id)),
          Some(job) if job.pause => Err(QueryError::TriggerFailedJobPaused(job_id)),
          Some(_) => self
            .state
            .store
            .trigger_job(job_id, Utc::now())
            .map(|_| info!(job_id, "Job triggered to run now."))
            .map_err(|_| QueryError::JobNotFound(job_id)),
        };
        let _ = responder.send(result);
      }
    }
  }

  fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) {
    trace!(?outcome, "Received worker outcome.");
    match outcome {
      WorkerOutcome::Reschedule {
        job_id,
        next_run_time,
        failed,
      } => {
        debug!(job_id, next_run = %next_run_time, failed, "Job rescheduled.");
      }
      WorkerOutcome::Complete {
        job_id,
        is_permanent_failure,
      } => {
        if is_permanent_failure {
          warn!(job_id, "Job parked after permanent failure.");
        } else {
          debug!(job_id, "Job complete.");
        }
      }
    }
  }

  /// Claims due jobs while workers are free.
  async fn try_dispatch_jobs(&mut self) {
    loop {
      let active_workers = self.state.active_workers_counter.load(AtomicOrdering::Relaxed);
      if active_workers >= self.state.max_workers {
        trace!("Dispatch check: All workers busy ({}/{})", active_workers, self.state.max_workers);
        break;
      }

      let Some(job) = self
        .state
        .store
        .claim_next(Utc::now(), self.state.lease_duration, self.state.max_load) else {
        trace!("Dispatch check: No eligible job.");
        break;
      };

      let prev_active = self.state.active_workers_counter.fetch_add(1, AtomicOrdering::Relaxed);
      self
        .state
        .metrics
        .workers_active_current
        .store(prev_active + 1, AtomicOrdering::Relaxed);
      self.state.metrics.jobs_claimed.fetch_add(1, AtomicOrdering::Relaxed);

      trace!(job_id = job.job_id, work_type = %job.work_type, "Attempting dispatch via channel.");
      if let Err(e) = self.state.job_dispatch_tx.send((job.job_id, job.not_before)).await {
        error!(job_id = job.job_id, "Failed to send job dispatch, channel closed? {:?}", e);
        let prev = self.state.active_workers_counter.fetch_sub(1, AtomicOrdering::Relaxed);
        self
          .state
          .metrics
          .workers_active_current
          .store(prev.saturating_sub(1), AtomicOrdering::Relaxed);
        if let Err(e) = self.state.store.release_job(job.job_id, job.not_before) {
          warn!(job_id = job.job_id, error = %e, "Could not release undispatched job.");
        }
        break;
      }
    }
  }

  /// Time until the next job could become due, capped by the poll interval.
  fn calculate_sleep(&self) -> Duration {
    if self.shutting_down.is_some() {
      return Duration::from_millis(50);
    }

    let active_workers = self.state.active_workers_counter.load(AtomicOrdering::Relaxed);
    if active_workers >= self.state.max_workers {
      // Worker outcomes wake the loop when capacity frees up.
      return self.state.poll_interval;
    }

    match self.state.store.next_due(self.state.lease_duration) {
      // A due job left unclaimed while workers run is waiting on the load budget.
      Some(next_due) if next_due <= Utc::now() && active_workers > 0 => self.state.poll_interval,
      Some(next_due) => {
        let until = (next_due - Utc::now())
          .to_std()
          .unwrap_or(Duration::ZERO)
          .max(Duration::from_millis(1));
        trace!(next_due = %next_due, sleep_duration = ?until, "Calculated next timer wakeup.");
        until.min(self.state.poll_interval)
      }
      None => self.state.poll_interval,
    }
  }
}
