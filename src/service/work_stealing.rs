use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::blocking::{self, Compensator};
use crate::config::ParallelExecutionConfiguration;
use crate::error::PoolError;
use crate::node::ExecutionMode;
use crate::service::{
    ExecutorService, ScheduledTask, TaskCell, TaskHandle, execute_inline, execute_locked,
    join_all, partition,
};

static NEXT_POOL: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// `(pool, worker)` of the pool thread we are on, if any.
    static WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// A work-stealing pool that keeps its parallelism while workers block.
///
/// Tasks forked by a worker go to the back of its own deque and are taken
/// back from there, so a worker keeps descending into the subtree it is
/// working on. Idle workers take from the shared injector first and then
/// steal the oldest task of another worker. A worker about to block on a
/// resource lock or a join tells the pool, which starts another worker while
/// fewer than `parallelism` workers are runnable.
pub struct WorkStealingService {
    pool: Arc<Pool>,
}

impl WorkStealingService {
    pub fn new(config: ParallelExecutionConfiguration) -> Result<Self, PoolError> {
        let pool = Arc::new_cyclic(|this| Pool {
            id: NEXT_POOL.fetch_add(1, Ordering::Relaxed),
            config,
            this: this.clone(),
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            settled: Condvar::new(),
        });

        let started = {
            let mut state = pool.state.lock();
            (0..pool.config.core_pool_size()).try_for_each(|_| pool.spawn_worker(&mut state))
        };

        if let Err(error) = started {
            pool.shutdown();
            return Err(error);
        }

        tracing::debug!(
            pool = pool.id,
            parallelism = pool.config.parallelism(),
            max_pool_size = pool.config.max_pool_size(),
            "started work-stealing pool"
        );
        Ok(Self { pool })
    }

    /// The number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.state.lock().workers
    }
}

impl ExecutorService for WorkStealingService {
    fn submit(&self, task: Box<dyn ScheduledTask>) -> TaskHandle {
        if task.execution_mode() == ExecutionMode::SameThread {
            return execute_inline(task);
        }

        let cell = TaskCell::new(task);
        if let Err(error) = self.pool.push(cell.clone()) {
            cell.abandon(error.into());
        }
        TaskHandle::new(cell)
    }

    fn invoke_all(&self, tasks: Vec<Box<dyn ScheduledTask>>) {
        if tasks.len() == 1 {
            tasks.into_iter().for_each(execute_locked);
            return;
        }

        let (concurrent, sequential) = partition(tasks);
        let forked: Vec<TaskHandle> = concurrent
            .into_iter()
            .map(|task| self.submit(task))
            .collect();

        sequential.into_iter().for_each(execute_locked);

        // The most recently forked tasks are at the back of our own deque,
        // joining them first lets this thread run them itself.
        join_all(forked.into_iter().rev());
    }

    fn close(&self) {
        self.pool.shutdown();
    }
}

impl Drop for WorkStealingService {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

struct Pool {
    id: usize,
    config: ParallelExecutionConfiguration,
    this: Weak<Pool>,
    state: Mutex<State>,
    available: Condvar,
    /// Signalled when the last queued task was taken care of.
    settled: Condvar,
}

#[derive(Default)]
struct State {
    injector: VecDeque<Arc<TaskCell>>,
    locals: HashMap<usize, VecDeque<Arc<TaskCell>>>,
    next_worker: usize,
    workers: usize,
    idle: usize,
    blocked: usize,
    /// Queued tasks no worker has taken care of yet.
    in_flight: usize,
    shutdown: bool,
    threads: HashMap<usize, JoinHandle<()>>,
}

impl State {
    fn find(&mut self, worker: usize) -> Option<Arc<TaskCell>> {
        if let Some(cell) = self.locals.get_mut(&worker).and_then(VecDeque::pop_back) {
            return Some(cell);
        }
        if let Some(cell) = self.injector.pop_front() {
            return Some(cell);
        }
        self.locals.values_mut().find_map(VecDeque::pop_front)
    }

    fn drain(&mut self) -> Vec<Arc<TaskCell>> {
        let mut cells: Vec<_> = self.injector.drain(..).collect();
        for local in self.locals.values_mut() {
            cells.extend(local.drain(..));
        }
        cells
    }
}

impl Pool {
    fn spawn_worker(&self, state: &mut State) -> Result<(), PoolError> {
        let pool = self.this.upgrade().ok_or(PoolError::Closed)?;
        let worker = state.next_worker;

        let handle = thread::Builder::new()
            .name(format!("kasane-worker-{}-{worker}", self.id))
            .spawn(move || pool.work(worker))?;

        state.next_worker += 1;
        state.workers += 1;
        state.locals.insert(worker, VecDeque::new());
        state.threads.insert(worker, handle);

        tracing::debug!(pool = self.id, worker, workers = state.workers, "spawned worker");
        Ok(())
    }

    fn push(&self, cell: Arc<TaskCell>) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(PoolError::Closed);
        }

        let local = WORKER
            .get()
            .filter(|(pool, _)| *pool == self.id)
            .and_then(|(_, worker)| state.locals.get_mut(&worker));

        match local {
            Some(deque) => deque.push_back(cell),
            None => state.injector.push_back(cell),
        }
        state.in_flight += 1;

        let idle = state.idle > 0;
        drop(state);
        if idle {
            self.available.notify_one();
        }
        Ok(())
    }

    fn work(self: Arc<Self>, worker: usize) {
        WORKER.set(Some((self.id, worker)));
        blocking::install(Some(self.clone() as Arc<dyn Compensator>));

        while let Some(cell) = self.next(worker) {
            cell.run();
            self.settle_one();
        }

        blocking::install(None);
        WORKER.set(None);
        tracing::debug!(pool = self.id, worker, "worker exited");
    }

    /// Blocks until there is work for `worker`. `None` tells the worker to
    /// exit, either because the pool shut down or because it has been idle
    /// for longer than the keep-alive while the pool is above its core size.
    fn next(&self, worker: usize) -> Option<Arc<TaskCell>> {
        let mut state = self.state.lock();
        let mut timed_out = false;

        loop {
            if let Some(cell) = state.find(worker) {
                return Some(cell);
            }

            if state.shutdown {
                state.workers -= 1;
                state.locals.remove(&worker);
                return None;
            }

            if timed_out && state.workers > self.config.core_pool_size() {
                state.workers -= 1;
                state.locals.remove(&worker);
                // Nobody will join a retired worker, its handle detaches it.
                state.threads.remove(&worker);
                return None;
            }

            state.idle += 1;
            timed_out = self
                .available
                .wait_for(&mut state, self.config.keep_alive())
                .timed_out();
            state.idle -= 1;
        }
    }

    fn settle_one(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.settled.notify_all();
        }
    }

    /// Waits until every queued task was taken care of, including tasks
    /// nobody waits for any more. A worker of this pool cannot wait for
    /// its own queue and returns right away.
    fn quiesce(&self) {
        if WORKER.get().is_some_and(|(pool, _)| pool == self.id) {
            return;
        }

        let mut state = self.state.lock();
        if state.in_flight > 0 {
            tracing::debug!(pool = self.id, in_flight = state.in_flight, "settling tasks before shutdown");
        }
        while state.in_flight > 0 && !state.shutdown {
            self.settled.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.quiesce();

        let (cells, threads) = {
            let mut state = self.state.lock();
            state.shutdown = true;
            let cells = state.drain();
            state.in_flight -= cells.len();
            (cells, std::mem::take(&mut state.threads))
        };
        self.settled.notify_all();
        self.available.notify_all();

        if !cells.is_empty() {
            tracing::debug!(pool = self.id, pending = cells.len(), "abandoning tasks");
        }
        for cell in cells {
            cell.abandon(PoolError::Closed.into());
        }

        let current = thread::current().id();
        for handle in threads.into_values() {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!(pool = self.id, "worker thread panicked");
            }
        }
    }
}

impl Compensator for Pool {
    fn begin_blocking(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        state.blocked += 1;

        let runnable = state.workers.saturating_sub(state.blocked);
        if state.shutdown || runnable >= self.config.parallelism() {
            return Ok(());
        }

        if state.workers < self.config.max_pool_size() {
            tracing::debug!(pool = self.id, runnable, "compensating for blocked worker");
            if let Err(error) = self.spawn_worker(&mut state) {
                state.blocked -= 1;
                return Err(error);
            }
            return Ok(());
        }

        if runnable >= self.config.minimum_runnable() || self.config.saturate() {
            return Ok(());
        }

        state.blocked -= 1;
        Err(PoolError::Saturated {
            max_pool_size: self.config.max_pool_size(),
        })
    }

    fn end_blocking(&self) {
        self.state.lock().blocked -= 1;
    }
}
