use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::service::{ExecutorService, ScheduledTask, TaskHandle};

/// Runs every task right away on the calling thread.
///
/// Nothing ever runs concurrently, so resource locks are not acquired.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameThreadService;

impl ExecutorService for SameThreadService {
    fn submit(&self, task: Box<dyn ScheduledTask>) -> TaskHandle {
        TaskHandle::from_outcome(catch_unwind(AssertUnwindSafe(|| task.execute())))
    }

    fn invoke_all(&self, tasks: Vec<Box<dyn ScheduledTask>>) {
        for task in tasks {
            task.execute();
        }
    }

    fn close(&self) {}
}
