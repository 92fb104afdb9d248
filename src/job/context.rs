use super::{JobId, WorkerId};

/// Contextual information about the job a worker is executing, available via task-locals.
/// Accessible from `ImplicitScheduler` implementations using `try_get_current_work_context()`
/// or the `work_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkContext {
  /// The job being executed.
  pub job_id: JobId,
  /// Failed attempts recorded before this one.
  pub attempt: u32,
  /// The worker running the job.
  pub worker_id: WorkerId,
}

tokio::task_local! {
    /// Provides access to the current `WorkContext` within a job's execution scope.
    /// Set by the worker if the `job_context` feature is enabled.
    pub static CURRENT_WORK_CONTEXT: WorkContext;
}

/// Attempts to retrieve the current `WorkContext`.
///
/// Returns `None` when called outside a job executed by the runtime.
pub fn try_get_current_work_context() -> Option<WorkContext> {
  CURRENT_WORK_CONTEXT.try_with(|ctx| *ctx).ok()
}

/// Retrieves the current `WorkContext`, panicking if called outside a job executed
/// by the runtime.
///
/// # Panics
/// Panics if the `CURRENT_WORK_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! work_context {
  () => {
    $crate::job::context::CURRENT_WORK_CONTEXT.with(|ctx| *ctx)
  };
}
