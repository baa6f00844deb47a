use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::blocking;
use crate::interrupt::Interrupt;
use crate::lock::ResourceLock;
use crate::node::{ExecutionMode, UniqueId};
use crate::service::{ExecutorService, ScheduledTask, TaskHandle};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs every subtree rooted at an isolation boundary on a thread of its own.
///
/// A task is at a boundary when the kind of the last segment of its unique
/// id matches. Such a task still goes through the wrapped service, but the
/// thread picking it up only spawns a fresh thread for it and waits, so no
/// thread-local state set up by the subtree leaks into unrelated ones.
pub struct IsolatingService {
    inner: Arc<dyn ExecutorService>,
    boundary: String,
    grace_period: Duration,
}

impl IsolatingService {
    pub fn new(inner: Arc<dyn ExecutorService>, boundary: String, grace_period: Duration) -> Self {
        Self {
            inner,
            boundary,
            grace_period,
        }
    }

    fn isolate(&self, task: Box<dyn ScheduledTask>) -> Box<dyn ScheduledTask> {
        let at_boundary = task
            .unique_id()
            .last_segment()
            .is_some_and(|segment| segment.kind() == self.boundary);

        if at_boundary {
            Box::new(IsolatedTask::new(task, self.grace_period))
        } else {
            task
        }
    }
}

impl ExecutorService for IsolatingService {
    fn submit(&self, task: Box<dyn ScheduledTask>) -> TaskHandle {
        self.inner.submit(self.isolate(task))
    }

    fn invoke_all(&self, tasks: Vec<Box<dyn ScheduledTask>>) {
        let tasks = tasks.into_iter().map(|task| self.isolate(task)).collect();
        self.inner.invoke_all(tasks);
    }

    fn close(&self) {
        self.inner.close();
    }
}

type Slot = Arc<Mutex<Option<Box<dyn ScheduledTask>>>>;

struct IsolatedTask {
    id: UniqueId,
    mode: ExecutionMode,
    lock: ResourceLock,
    task: Slot,
    grace_period: Duration,
}

impl IsolatedTask {
    fn new(task: Box<dyn ScheduledTask>, grace_period: Duration) -> Self {
        Self {
            id: task.unique_id().clone(),
            mode: task.execution_mode(),
            lock: task.resource_lock(),
            task: Arc::new(Mutex::new(Some(task))),
            grace_period,
        }
    }

    fn spawn(&self, flag: Interrupt) -> std::io::Result<Receiver<thread::Result<()>>> {
        let (tx, rx) = channel();
        let slot = self.task.clone();

        thread::Builder::new()
            .name(format!("kasane-isolated-{}", self.id))
            .spawn(move || {
                flag.install();
                let Some(task) = slot.lock().take() else {
                    return;
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| task.execute()));
                let _ = tx.send(outcome);
            })?;

        Ok(rx)
    }

    /// Waits for the isolated thread. Once the waiting thread is
    /// interrupted, the interruption is passed on and the isolated thread
    /// gets the grace period to wind down.
    fn wait(&self, rx: &Receiver<thread::Result<()>>, child: &Interrupt) -> Option<thread::Result<()>> {
        let interrupt = Interrupt::current();
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(outcome) => return Some(outcome),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) if interrupt.is_interrupted() => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        child.interrupt();
        match rx.recv_timeout(self.grace_period) {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                tracing::warn!(
                    id = %self.id,
                    grace_period = ?self.grace_period,
                    "isolated thread did not terminate after interruption, giving up on it"
                );
                None
            }
        }
    }
}

impl ScheduledTask for IsolatedTask {
    fn unique_id(&self) -> &UniqueId {
        &self.id
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn resource_lock(&self) -> ResourceLock {
        self.lock.clone()
    }

    fn execute(self: Box<Self>) {
        let child = Interrupt::default();
        let rx = match self.spawn(child.clone()) {
            Ok(rx) => rx,
            Err(error) => {
                tracing::error!(id = %self.id, %error, "couldn't spawn isolated thread");
                if let Some(task) = self.task.lock().take() {
                    task.abandon(error.into());
                }
                return;
            }
        };

        let wait = || self.wait(&rx, &child);
        let outcome = blocking::managed_block(&wait).unwrap_or_else(|_| wait());

        if let Some(Err(payload)) = outcome {
            resume_unwind(payload);
        }
    }

    fn abandon(self: Box<Self>, error: anyhow::Error) {
        if let Some(task) = self.task.lock().take() {
            task.abandon(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;
    use crate::service::SameThreadService;
    use crate::testing::{FnTask, engine_id};

    fn isolating(grace_period: Duration) -> IsolatingService {
        IsolatingService::new(Arc::new(SameThreadService), "class".into(), grace_period)
    }

    #[test]
    fn test_boundary_runs_on_fresh_thread() {
        let service = isolating(Duration::from_secs(1));
        let caller = thread::current().id();
        let (tx, rx) = channel();

        let isolated = {
            let tx = tx.clone();
            FnTask::new("isolated", move || {
                let current = thread::current();
                tx.send(("isolated", current.id(), current.name().map(str::to_string)))
                    .unwrap();
            })
            .with_id(engine_id().append("class", "Printer"))
        };
        let plain = FnTask::new("plain", move || {
            let current = thread::current();
            tx.send(("plain", current.id(), current.name().map(str::to_string)))
                .unwrap();
        });

        service.invoke_all(vec![isolated.boxed(), plain.boxed()]);

        let (_, isolated_thread, isolated_name) = rx.recv().unwrap();
        let (_, plain_thread, _) = rx.recv().unwrap();
        assert_ne!(isolated_thread, caller);
        assert_eq!(plain_thread, caller);
        assert_eq!(
            isolated_name.as_deref(),
            Some("kasane-isolated-[engine:test]/[class:Printer]")
        );
    }

    #[test]
    fn test_interruption_is_propagated() {
        let service = Arc::new(isolating(Duration::from_secs(5)));
        let (flag_tx, flag_rx) = channel();
        let (stopped_tx, stopped_rx) = channel();

        let waiter = {
            let service = service.clone();
            thread::spawn(move || {
                flag_tx.send(Interrupt::current()).unwrap();
                service.invoke_all(vec![
                    FnTask::new("spinning", move || {
                        while !Interrupt::current().is_interrupted() {
                            thread::sleep(Duration::from_millis(1));
                        }
                        stopped_tx.send(()).unwrap();
                    })
                    .with_id(engine_id().append("class", "Spinning"))
                    .boxed(),
                ]);
            })
        };

        flag_rx.recv().unwrap().interrupt();
        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_gives_up_after_grace_period() {
        let service = isolating(Duration::from_millis(20));
        let (release_tx, release_rx) = channel::<()>();

        Interrupt::current().interrupt();
        service.invoke_all(vec![
            FnTask::new("stubborn", move || {
                let _ = release_rx.recv();
            })
            .with_id(engine_id().append("class", "Stubborn"))
            .boxed(),
        ]);
        Interrupt::current().clear();

        drop(release_tx);
    }

    #[test]
    fn test_panics_reach_the_caller() {
        let service = isolating(Duration::from_secs(1));
        let payload = catch_unwind(AssertUnwindSafe(|| {
            service.invoke_all(vec![
                FnTask::new("bad", || panic!("isolated failure"))
                    .with_id(engine_id().append("class", "Bad"))
                    .boxed(),
            ]);
        }))
        .unwrap_err();

        assert_eq!(
            crate::error::panic_message(payload.as_ref()),
            "isolated failure"
        );
    }
}
