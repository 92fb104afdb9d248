use crate::command::{CoordinatorCommand, ShutdownMode, WorkerOutcome};
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{BuildError, QueryError, ShutdownError};
use crate::job::{JobDetails, JobId, JobSummary};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::store::Store;
use crate::tracker::InFlightTracker;
use crate::work::Engine;
use crate::worker::{JobDispatch, Worker, WorkerSettings};

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures::future::try_join_all;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_CHANNEL_BOUND: usize = 128; // For command and outcome channels
const DEFAULT_JOB_DISPATCH_BOUND: usize = 1; // For coordinator -> worker job dispatch
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CRASH_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_JOB_FAILURES: u32 = 5;

/// Builder for configuring and creating an `ItipKeeper` runtime.
///
/// # Example
///
/// ```no_run
/// use itipkeeper::{Engine, ItipKeeper, Store, WorkQueueConfig};
/// # use itipkeeper::ImplicitScheduler;
/// # use std::sync::Arc;
///
/// # async fn run(scheduler: Arc<dyn ImplicitScheduler>) -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::new();
/// let engine = Engine::new(WorkQueueConfig::default(), scheduler);
/// let keeper = ItipKeeper::builder()
///     .max_workers(4)
///     .store(store)
///     .engine(engine)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SchedulerBuilder {
  max_workers: Option<usize>,
  store: Option<Store>,
  engine: Option<Engine>,
  poll_interval: Duration,
  lease_duration: Duration,
  lock_retry_delay: Duration,
  crash_retry_base_delay: Duration,
  max_job_failures: u32,
  max_load: Option<u32>,
  command_buffer_size: usize,
  job_dispatch_buffer_size: usize,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      max_workers: None,
      store: None,
      engine: None,
      poll_interval: DEFAULT_POLL_INTERVAL,
      lease_duration: DEFAULT_LEASE_DURATION,
      lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
      crash_retry_base_delay: DEFAULT_CRASH_RETRY_BASE_DELAY,
      max_job_failures: DEFAULT_MAX_JOB_FAILURES,
      max_load: None,
      command_buffer_size: DEFAULT_CHANNEL_BOUND,
      job_dispatch_buffer_size: DEFAULT_JOB_DISPATCH_BOUND,
    }
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the number of worker tasks, i.e. how many jobs may run concurrently.
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  /// The store to claim jobs from. A fresh empty store is used if unset.
  pub fn store(mut self, store: Store) -> Self {
    self.store = Some(store);
    self
  }

  /// The engine that executes work items. Required.
  pub fn engine(mut self, engine: Engine) -> Self {
    self.engine = Some(engine);
    self
  }

  /// Upper bound on how long the coordinator sleeps without re-checking the store.
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval.max(Duration::from_millis(1));
    self
  }

  /// How long a claimed job stays assigned before another claim may take it over.
  pub fn lease_duration(mut self, lease: Duration) -> Self {
    self.lease_duration = lease;
    self
  }

  /// Delay before a job deferred by a busy UID lock becomes eligible again.
  pub fn lock_retry_delay(mut self, delay: Duration) -> Self {
    self.lock_retry_delay = delay;
    self
  }

  /// Base of the exponential backoff applied to jobs that crash or panic.
  pub fn crash_retry_base_delay(mut self, delay: Duration) -> Self {
    self.crash_retry_base_delay = delay;
    self
  }

  /// Failed attempts after which a job is parked as permanently failed.
  pub fn max_job_failures(mut self, failures: u32) -> Self {
    self.max_job_failures = failures.max(1);
    self
  }

  /// Caps the summed weight of jobs running at once. Unlimited if unset; a single job
  /// heavier than the cap still runs, alone.
  pub fn max_load(mut self, load: u32) -> Self {
    self.max_load = Some(load);
    self
  }

  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  pub fn job_dispatch_buffer_size(mut self, size: usize) -> Self {
    // Ensure buffer is at least 1
    self.job_dispatch_buffer_size = size.max(1);
    self
  }

  /// Spawns the coordinator and workers on the current Tokio runtime.
  ///
  /// # Panics
  /// Panics if called outside a Tokio runtime.
  pub fn build(self) -> Result<ItipKeeper, BuildError> {
    let max_workers = self
      .max_workers
      .filter(|count| *count > 0)
      .ok_or(BuildError::MissingOrZeroMaxWorkers)?;
    let engine = self.engine.ok_or(BuildError::MissingEngine)?;
    let store = self.store.unwrap_or_default();
    let lease_duration =
      ChronoDuration::from_std(self.lease_duration).unwrap_or_else(|_| ChronoDuration::seconds(300));

    // --- Initialize Shared State & Channels ---
    let metrics = SchedulerMetrics::new();
    let active_workers_counter = Arc::new(AtomicUsize::new(0));

    let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(self.command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (job_dispatch_tx, job_dispatch_rx) = async_channel::bounded::<JobDispatch>(self.job_dispatch_buffer_size);
    let (worker_outcome_tx, worker_outcome_rx) = mpsc::channel::<WorkerOutcome>(self.command_buffer_size);

    // --- Spawn Coordinator ---
    let coordinator_state = CoordinatorState::new(
      store.clone(),
      cmd_rx,
      shutdown_rx.clone(),
      job_dispatch_tx,
      worker_outcome_rx,
      metrics.clone(),
      active_workers_counter.clone(),
      max_workers,
      self.poll_interval,
      lease_duration,
      self.max_load,
    );

    let coordinator_handle = Handle::current().spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
      info!("Coordinator task finished.");
    });

    // --- Spawn Workers ---
    let settings = WorkerSettings {
      lock_retry_delay: self.lock_retry_delay,
      crash_retry_base_delay: self.crash_retry_base_delay,
      max_job_failures: self.max_job_failures,
    };
    let mut worker_handles = Vec::with_capacity(max_workers);
    for worker_id in 0..max_workers {
      let mut worker = Worker::new(
        worker_id,
        store.clone(),
        engine.clone(),
        settings,
        metrics.clone(),
        shutdown_rx.clone(),
        worker_outcome_tx.clone(),
        job_dispatch_rx.clone(),
        active_workers_counter.clone(),
      );
      worker_handles.push(Handle::current().spawn(async move {
        worker.run().await;
      }));
    }
    // Workers hold the clones.
    drop(worker_outcome_tx);

    info!(max_workers, "ItipKeeper runtime started.");
    Ok(ItipKeeper {
      store,
      engine,
      cmd_tx,
      shutdown_tx,
      coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
      worker_handles: Arc::new(Mutex::new(worker_handles)),
    })
  }
}

/// Handle to a running scheduling work queue.
///
/// Work is enqueued through the [`Engine`] inside store transactions; the runtime picks
/// it up once the transaction commits and its `not_before` has passed.
#[derive(Debug)]
pub struct ItipKeeper {
  store: Store,
  engine: Engine,
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ItipKeeper {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn engine(&self) -> &Engine {
    &self.engine
  }

  /// The tracker counting work enqueued through this runtime's engine.
  pub fn tracker(&self) -> &InFlightTracker {
    self.engine.tracker()
  }

  pub async fn get_job_details(&self, job_id: JobId) -> Result<JobDetails, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    let cmd = CoordinatorCommand::GetJobDetails { job_id, responder };
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| QueryError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)?
  }

  pub async fn list_all_jobs(&self) -> Result<Vec<JobSummary>, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    let cmd = CoordinatorCommand::ListAllJobs { responder };
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| QueryError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  pub async fn get_metrics_snapshot(&self) -> Result<MetricsSnapshot, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    let cmd = CoordinatorCommand::GetMetricsSnapshot { responder };
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| QueryError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Makes a queued job eligible immediately, ignoring its `not_before`.
  ///
  /// Fails for paused jobs and for jobs parked after permanent failure.
  pub async fn trigger_job_now(&self, job_id: JobId) -> Result<(), QueryError> {
    let (responder, response_rx) = oneshot::channel();
    let cmd = CoordinatorCommand::TriggerJobNow { job_id, responder };
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| QueryError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)?
  }

  /// Stops claiming jobs and waits for running jobs to finish.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Stops immediately. Jobs still running roll back and are picked up again once
  /// their lease expires.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let coordinator_handle = self.coordinator_handle.lock().await.take();
    let worker_handles = {
      let mut guard = self.worker_handles.lock().await;
      std::mem::take(&mut *guard)
    };

    let mut tasks = Vec::with_capacity(1 + worker_handles.len());
    if let Some(coord_handle) = coordinator_handle {
      tasks.push(tokio::spawn(async move {
        coord_handle.await.map_err(|e| {
          error!("Coordinator task panicked: {:?}", e);
          ShutdownError::TaskPanic
        })
      }));
    } else {
      warn!("Coordinator handle missing during shutdown wait.");
    }

    for (i, handle) in worker_handles.into_iter().enumerate() {
      tasks.push(tokio::spawn(async move {
        handle.await.map_err(|e| {
          error!(worker_id = i, "Worker task panicked: {:?}", e);
          ShutdownError::TaskPanic
        })
      }));
    }

    if tasks.is_empty() {
      warn!("No tasks found to await during shutdown.");
      return Ok(());
    }

    let join_all_fut = async {
      let results = try_join_all(tasks).await.map_err(|join_err| {
        error!("A shutdown watcher task failed: {:?}", join_err);
        ShutdownError::TaskPanic
      })?;
      results.into_iter().collect::<Result<Vec<()>, ShutdownError>>().map(|_| ())
    };

    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(joined) => joined,
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => join_all_fut.await,
    };

    match &result {
      Ok(()) => info!("All tasks joined successfully."),
      Err(e) => error!("Error during shutdown task joining: {:?}", e),
    }
    result
  }
}
