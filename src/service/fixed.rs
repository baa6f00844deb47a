use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::ParallelExecutionConfiguration;
use crate::error::PoolError;
use crate::node::ExecutionMode;
use crate::service::{
    ExecutorService, ScheduledTask, TaskCell, TaskHandle, execute_inline, execute_locked,
    join_all, partition,
};

/// A fixed number of `rayon` threads.
///
/// A batch of siblings is split up front: the tasks that must not run
/// concurrently run on the submitting thread in the order they were given, the
/// rest are spawned onto the pool and awaited together. A thread awaiting a
/// task nobody picked up yet runs it itself.
pub struct FixedPoolService {
    pool: Mutex<Option<ThreadPool>>,
    spawned: Mutex<Vec<Weak<TaskCell>>>,
}

impl FixedPoolService {
    pub fn new(config: ParallelExecutionConfiguration) -> Result<Self, PoolError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.parallelism())
            .thread_name(|i| format!("kasane-fixed-{i}"))
            .build()?;

        tracing::debug!(threads = config.parallelism(), "started fixed pool");
        Ok(Self {
            pool: Mutex::new(Some(pool)),
            spawned: Mutex::new(Vec::new()),
        })
    }

    fn track(&self, cell: &Arc<TaskCell>) {
        let mut spawned = self.spawned.lock();
        if spawned.len() == spawned.capacity() {
            spawned.retain(|cell| cell.strong_count() > 0);
        }
        spawned.push(Arc::downgrade(cell));
    }
}

impl ExecutorService for FixedPoolService {
    fn submit(&self, task: Box<dyn ScheduledTask>) -> TaskHandle {
        if task.execution_mode() == ExecutionMode::SameThread {
            return execute_inline(task);
        }

        let cell = TaskCell::new(task);

        match self.pool.lock().as_ref() {
            Some(pool) => {
                self.track(&cell);
                let job = cell.clone();
                pool.spawn(move || {
                    job.run();
                });
            }
            None => cell.abandon(PoolError::Closed.into()),
        }

        TaskHandle::new(cell)
    }

    fn invoke_all(&self, tasks: Vec<Box<dyn ScheduledTask>>) {
        let (concurrent, sequential) = partition(tasks);
        let spawned: Vec<TaskHandle> = concurrent
            .into_iter()
            .map(|task| self.submit(task))
            .collect();

        sequential.into_iter().for_each(execute_locked);
        join_all(spawned);
    }

    fn close(&self) {
        // Settling a task may submit more of them, so drain until nothing is
        // left. Whatever nobody waits for any more still runs to completion.
        loop {
            let outstanding: Vec<Arc<TaskCell>> = self
                .spawned
                .lock()
                .drain(..)
                .filter_map(|cell| cell.upgrade())
                .collect();
            if outstanding.is_empty() {
                break;
            }

            tracing::debug!(outstanding = outstanding.len(), "settling tasks before close");
            outstanding.iter().for_each(|cell| cell.settle());
        }

        // Dropping the pool lets its threads exit once they are idle.
        drop(self.pool.lock().take());
    }
}
