use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::blocking;
use crate::error::{JoinError, PanicPayload, Unrecoverable, panic_message};
use crate::service::{ScheduledTask, execute_locked};

enum State {
    /// Submitted, nobody has claimed the task yet.
    Pending(Box<dyn ScheduledTask>),
    Running,
    Finished,
    /// The payload goes to the first joiner, later joiners get a copy of
    /// the same kind.
    Panicked {
        payload: Option<Box<dyn Any + Send>>,
        message: String,
        unrecoverable: bool,
    },
    Abandoned,
}

struct Slot {
    state: State,
    cancelled: bool,
}

impl Slot {
    fn is_done(&self) -> bool {
        !matches!(self.state, State::Pending(_) | State::Running)
    }

    fn outcome(&mut self) -> Result<(), JoinError> {
        if self.cancelled {
            return Err(JoinError::Cancelled);
        }

        match &mut self.state {
            State::Finished => Ok(()),
            State::Panicked {
                payload,
                message,
                unrecoverable,
            } => {
                let payload = payload.take().unwrap_or_else(|| {
                    if *unrecoverable {
                        Box::new(Unrecoverable(message.clone()))
                    } else {
                        Box::new(message.clone())
                    }
                });
                Err(JoinError::Panicked(PanicPayload::new(payload)))
            }
            State::Abandoned => Err(JoinError::Abandoned),
            State::Pending(_) | State::Running => {
                unreachable!("outcome of an unfinished task")
            }
        }
    }
}

/// Shared between a submitted task, the thread that eventually runs it, and
/// any number of handles waiting for it.
pub(crate) struct TaskCell {
    slot: Mutex<Slot>,
    done: Condvar,
}

impl TaskCell {
    pub(crate) fn new(task: Box<dyn ScheduledTask>) -> Arc<Self> {
        Self::with_state(State::Pending(task))
    }

    fn with_state(state: State) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                state,
                cancelled: false,
            }),
            done: Condvar::new(),
        })
    }

    fn claim(&self) -> Option<Box<dyn ScheduledTask>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut slot.state, State::Running) {
            State::Pending(task) => Some(task),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Runs the task under its resource lock, unless someone else already
    /// claimed it. Returns whether the task ran on this thread.
    pub(crate) fn run(&self) -> bool {
        let Some(task) = self.claim() else {
            return false;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| execute_locked(task)));
        self.complete(outcome);
        true
    }

    /// Marks the task as no longer going to run. A task nobody has claimed
    /// yet is told why.
    pub(crate) fn abandon(&self, error: anyhow::Error) {
        let Some(task) = self.claim() else {
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| task.abandon(error)));
        self.finish(State::Abandoned);

        if let Err(payload) = outcome {
            if payload.is::<Unrecoverable>() {
                resume_unwind(payload);
            }
            tracing::warn!(
                failure = %panic_message(payload.as_ref()),
                "abandoned task panicked"
            );
        }
    }

    /// Runs the task here unless it was claimed already, then waits until it
    /// completed. Cancellation of its handles is no reason to stop waiting.
    pub(crate) fn settle(&self) {
        if self.run() {
            return;
        }

        let mut slot = self.slot.lock();
        while !slot.is_done() {
            self.done.wait(&mut slot);
        }
    }

    pub(crate) fn complete(&self, outcome: thread::Result<()>) {
        let state = match outcome {
            Ok(()) => State::Finished,
            Err(payload) => State::Panicked {
                message: panic_message(payload.as_ref()),
                unrecoverable: payload.is::<Unrecoverable>(),
                payload: Some(payload),
            },
        };
        self.finish(state);
    }

    fn finish(&self, state: State) {
        self.slot.lock().state = state;
        self.done.notify_all();
    }

    fn wait(&self) -> Result<(), JoinError> {
        let mut slot = self.slot.lock();
        while !slot.is_done() && !slot.cancelled {
            self.done.wait(&mut slot);
        }
        slot.outcome()
    }
}

/// Completion handle of a submitted task.
///
/// Handles are cheap to clone and all clones observe the same task.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self { cell }
    }

    /// A handle of a task which finished already.
    pub fn completed() -> Self {
        Self::new(TaskCell::with_state(State::Finished))
    }

    pub(crate) fn from_outcome(outcome: thread::Result<()>) -> Self {
        let cell = TaskCell::with_state(State::Running);
        cell.complete(outcome);
        Self::new(cell)
    }

    /// Waits for the task to complete.
    ///
    /// A task no worker has picked up yet is run on the calling thread
    /// instead. Panics of the task are handed back as
    /// [`JoinError::Panicked`].
    pub fn join(&self) -> Result<(), JoinError> {
        if self.cell.slot.lock().cancelled {
            return Err(JoinError::Cancelled);
        }

        self.cell.run();

        if self.is_done() {
            return self.cell.wait();
        }

        // A pool at its limit may refuse to compensate, the wait happens
        // regardless.
        let wait = || self.cell.wait();
        blocking::managed_block(&wait).unwrap_or_else(|_| wait())
    }

    /// Detaches every waiter from the task. The task itself still runs to
    /// completion. Returns false when the task has completed already.
    pub fn cancel(&self) -> bool {
        let mut slot = self.cell.slot.lock();
        if slot.is_done() {
            return false;
        }

        slot.cancelled = true;
        drop(slot);
        self.cell.done.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        self.cell.slot.lock().is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.slot.lock().cancelled
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;
    use crate::testing::FnTask;

    #[test]
    fn test_join_runs_unclaimed_task_inline() {
        let caller = thread::current().id();
        let (tx, rx) = channel();
        let cell = TaskCell::new(FnTask::new("inline", move || tx.send(thread::current().id()).unwrap()).boxed());
        let handle = TaskHandle::new(cell);

        assert!(!handle.is_done());
        handle.join().unwrap();
        assert!(handle.is_done());
        assert_eq!(rx.recv().unwrap(), caller);
    }

    #[test]
    fn test_task_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cell = TaskCell::new(
            FnTask::new("once", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .boxed(),
        );

        assert!(cell.run());
        assert!(!cell.run());
        TaskHandle::new(cell).join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_waits_for_running_task() {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();
        let cell = TaskCell::new(
            FnTask::new("slow", move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .boxed(),
        );

        let worker = {
            let cell = cell.clone();
            thread::spawn(move || cell.run())
        };
        started_rx.recv().unwrap();

        let handle = TaskHandle::new(cell);
        let joiner = {
            let handle = handle.clone();
            thread::spawn(move || handle.join().is_ok())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_done());
        release_tx.send(()).unwrap();

        assert!(worker.join().unwrap());
        assert!(joiner.join().unwrap());
    }

    #[test]
    fn test_panics_are_handed_to_every_joiner() {
        let handle = TaskHandle::new(TaskCell::new(
            FnTask::new("panics", || panic!("exploded")).boxed(),
        ));

        let first = handle.join().unwrap_err();
        let second = handle.join().unwrap_err();

        match (first, second) {
            (JoinError::Panicked(first), JoinError::Panicked(second)) => {
                assert_eq!(first.message(), "exploded");
                assert_eq!(second.message(), "exploded");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unrecoverable_panics_stay_unrecoverable_for_every_joiner() {
        let handle = TaskHandle::new(TaskCell::new(
            FnTask::new("fatal", || std::panic::panic_any(Unrecoverable("out of memory".into())))
                .boxed(),
        ));

        for _ in 0..2 {
            match handle.join() {
                Err(JoinError::Panicked(payload)) => {
                    assert!(payload.is::<Unrecoverable>());
                    assert_eq!(payload.message(), "out of memory");
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn test_join_error_converts_into_anyhow() {
        let handle = TaskHandle::new(TaskCell::new(
            FnTask::new("panics", || panic!("exploded")).boxed(),
        ));

        let joined = || -> anyhow::Result<()> {
            handle.join()?;
            Ok(())
        };
        let error = joined().unwrap_err();
        assert_eq!(error.to_string(), "Task panicked: exploded");
        assert!(error.downcast_ref::<JoinError>().is_some());
    }

    #[test]
    fn test_unrecoverable_panic_while_abandoning_is_resumed() {
        let cell = TaskCell::new(
            FnTask::new("abandoned", || unreachable!("never runs"))
                .on_abandon(|_| std::panic::panic_any(Unrecoverable("fatal".into())))
                .boxed(),
        );
        let handle = TaskHandle::new(cell.clone());

        let payload = catch_unwind(AssertUnwindSafe(|| {
            cell.abandon(anyhow::anyhow!("pool closed"));
        }))
        .unwrap_err();

        assert!(payload.is::<Unrecoverable>());
        assert!(matches!(handle.join(), Err(JoinError::Abandoned)));
    }

    #[test]
    fn test_ordinary_panic_while_abandoning_is_logged() {
        let cell = TaskCell::new(
            FnTask::new("abandoned", || unreachable!("never runs"))
                .on_abandon(|_| panic!("listener failure"))
                .boxed(),
        );

        cell.abandon(anyhow::anyhow!("pool closed"));
        assert!(matches!(TaskHandle::new(cell).join(), Err(JoinError::Abandoned)));
    }

    #[test]
    fn test_settle_waits_for_cancelled_task() {
        let (started_tx, started_rx) = channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let cell = TaskCell::new(
            FnTask::new("detached", move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .boxed(),
        );
        let handle = TaskHandle::new(cell.clone());

        let worker = {
            let cell = cell.clone();
            thread::spawn(move || cell.run())
        };
        started_rx.recv().unwrap();
        assert!(handle.cancel());

        cell.settle();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_cancel_detaches_but_task_still_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cell = TaskCell::new(
            FnTask::new("cancelled", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .boxed(),
        );
        let handle = TaskHandle::new(cell.clone());

        assert!(handle.cancel());
        assert!(matches!(handle.join(), Err(JoinError::Cancelled)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        assert!(cell.run());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!handle.cancel());
    }

    #[test]
    fn test_abandoned_task_is_told_why() {
        let (tx, rx) = channel();
        let cell = TaskCell::new(
            FnTask::new("abandoned", || unreachable!("never runs"))
                .on_abandon(move |error| tx.send(error.to_string()).unwrap())
                .boxed(),
        );
        let handle = TaskHandle::new(cell.clone());

        cell.abandon(anyhow::anyhow!("pool closed"));
        assert_eq!(rx.recv().unwrap(), "pool closed");
        assert!(matches!(handle.join(), Err(JoinError::Abandoned)));
        assert!(!cell.run());
    }

    #[test]
    fn test_completed_handle() {
        let handle = TaskHandle::completed();
        assert!(handle.is_done());
        assert!(handle.join().is_ok());
    }
}
