//! Interchangeable strategies for running node tasks.

mod fixed;
mod handle;
mod isolated;
mod same_thread;
mod work_stealing;

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    ConfigurationParameters, ExecutorKind, ParallelSettings, StrategyRegistry,
};
use crate::error::{EngineError, JoinError};
use crate::lock::ResourceLock;
use crate::node::{ExecutionMode, UniqueId};

pub use crate::service::fixed::FixedPoolService;
pub use crate::service::handle::TaskHandle;
pub(crate) use crate::service::handle::TaskCell;
pub use crate::service::isolated::IsolatingService;
pub use crate::service::same_thread::SameThreadService;
pub use crate::service::work_stealing::WorkStealingService;

/// A unit of work handed to an [`ExecutorService`].
pub trait ScheduledTask: Send {
    fn unique_id(&self) -> &UniqueId;

    fn execution_mode(&self) -> ExecutionMode;

    /// The lock to hold while the task executes.
    fn resource_lock(&self) -> ResourceLock;

    fn execute(self: Box<Self>);

    /// Called instead of `execute` when the task will never run, either
    /// because its lock could not be acquired or because the service shut
    /// down first.
    fn abandon(self: Box<Self>, error: anyhow::Error);
}

pub trait ExecutorService: Send + Sync {
    /// Schedules a task, returning a handle to await its completion.
    fn submit(&self, task: Box<dyn ScheduledTask>) -> TaskHandle;

    /// Runs a batch of sibling tasks and returns once all of them completed.
    ///
    /// Tasks in [`ExecutionMode::SameThread`] run on the calling thread, in
    /// order. A panic of any task is resumed on the calling thread.
    fn invoke_all(&self, tasks: Vec<Box<dyn ScheduledTask>>);

    /// Shuts the service down once every task submitted so far completed,
    /// including tasks whose handles were cancelled. Tasks submitted
    /// afterwards are abandoned.
    fn close(&self);
}

/// Executes a task while holding its resource lock.
pub(crate) fn execute_locked(task: Box<dyn ScheduledTask>) {
    let lock = task.resource_lock();
    match lock.acquire() {
        Ok(_guard) => task.execute(),
        Err(error) => {
            tracing::debug!(id = %task.unique_id(), %error, "couldn't acquire resource lock");
            task.abandon(error.into());
        }
    }
}

/// Runs a task on the calling thread, handing back its outcome as an
/// already completed handle.
pub(crate) fn execute_inline(task: Box<dyn ScheduledTask>) -> TaskHandle {
    TaskHandle::from_outcome(catch_unwind(AssertUnwindSafe(|| execute_locked(task))))
}

/// Joins every handle, then resumes the first panic among them.
pub(crate) fn join_all(handles: impl IntoIterator<Item = TaskHandle>) {
    let mut panic = None;
    for handle in handles {
        match handle.join() {
            Ok(()) | Err(JoinError::Cancelled) | Err(JoinError::Abandoned) => {}
            Err(JoinError::Panicked(payload)) => {
                panic.get_or_insert(payload);
            }
        }
    }

    if let Some(payload) = panic {
        resume_unwind(payload.into_inner());
    }
}

/// Splits a batch into the tasks that may run concurrently and the ones
/// that must run on the calling thread, keeping the order within each.
pub(crate) fn partition(
    tasks: Vec<Box<dyn ScheduledTask>>,
) -> (Vec<Box<dyn ScheduledTask>>, Vec<Box<dyn ScheduledTask>>) {
    tasks
        .into_iter()
        .partition(|task| task.execution_mode() == ExecutionMode::Concurrent)
}

/// Builds the executor service described by the configuration parameters.
///
/// Parallel execution is off unless `kasane.parallel.enabled` is set, in
/// which case `kasane.parallel.executor` picks the pool and the
/// `kasane.parallel.config.*` keys size it.
pub fn from_configuration(
    parameters: &dyn ConfigurationParameters,
    registry: &StrategyRegistry,
) -> Result<Arc<dyn ExecutorService>, EngineError> {
    let settings = ParallelSettings::from_parameters(parameters)?;
    if !settings.enabled {
        tracing::debug!("parallel execution disabled");
        return Ok(Arc::new(SameThreadService));
    }

    let configuration = registry.configuration(parameters)?;
    tracing::debug!(?settings, ?configuration, "parallel execution enabled");

    let service: Arc<dyn ExecutorService> = match settings.executor {
        ExecutorKind::WorkStealing => Arc::new(WorkStealingService::new(configuration)?),
        ExecutorKind::FixedPool => Arc::new(FixedPoolService::new(configuration)?),
    };

    Ok(match settings.isolation_boundary {
        Some(boundary) => Arc::new(IsolatingService::new(
            service,
            boundary,
            Duration::from_millis(settings.grace_period_ms),
        )),
        None => service,
    })
}
