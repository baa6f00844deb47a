use std::any::Any;
use std::cell::RefCell;
use std::fmt::{Debug, Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Aborted, JoinError, PanicError, Unrecoverable, panic_message};

/// A collected failure, together with the failures that were suppressed in
/// its favour.
///
/// Cloning is cheap and clones share identity, so the suppressed list of a
/// throwable is visible through every clone.
#[derive(Clone)]
pub struct Throwable(Arc<Inner>);

struct Inner {
    error: anyhow::Error,
    suppressed: Mutex<Vec<Throwable>>,
}

impl Throwable {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Throwable(Arc::new(Inner {
            error: error.into(),
            suppressed: Mutex::new(Vec::new()),
        }))
    }

    /// Converts a panic payload. `Aborted` payloads keep their type so that
    /// they are still classified as aborts, anything else becomes a
    /// [`PanicError`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<Aborted>() {
            Ok(aborted) => Throwable::new(*aborted),
            Err(payload) => Throwable::new(PanicError(panic_message(payload.as_ref()))),
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0.error
    }

    pub fn is<E>(&self) -> bool
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.error.is::<E>()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.error.downcast_ref::<E>()
    }

    pub fn suppressed(&self) -> Vec<Throwable> {
        self.0.suppressed.lock().clone()
    }

    /// Attaches `other` as suppressed. A throwable never suppresses itself.
    pub fn add_suppressed(&self, other: Throwable) {
        if !self.ptr_eq(&other) {
            self.0.suppressed.lock().push(other);
        }
    }

    pub fn ptr_eq(&self, other: &Throwable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Display for Throwable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0.error, f)
    }
}

impl Debug for Throwable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let suppressed = self.0.suppressed.lock();
        f.debug_struct("Throwable")
            .field("error", &format_args!("{}", self.0.error))
            .field("suppressed", &*suppressed)
            .finish()
    }
}

impl From<anyhow::Error> for Throwable {
    fn from(error: anyhow::Error) -> Self {
        Throwable::new(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Successful,
    Aborted,
    Failed,
}

/// The single outcome reported for a node.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    status: Status,
    throwable: Option<Throwable>,
}

impl ExecutionResult {
    pub fn successful() -> Self {
        Self {
            status: Status::Successful,
            throwable: None,
        }
    }

    pub fn aborted(throwable: Throwable) -> Self {
        Self {
            status: Status::Aborted,
            throwable: Some(throwable),
        }
    }

    pub fn failed(throwable: Throwable) -> Self {
        Self {
            status: Status::Failed,
            throwable: Some(throwable),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn throwable(&self) -> Option<&Throwable> {
        self.throwable.as_ref()
    }
}

/// Decides whether a collected throwable means "aborted" rather than
/// "failed".
pub type AbortPredicate = Arc<dyn Fn(&Throwable) -> bool + Send + Sync>;

/// Classifies [`Aborted`] errors and panics as aborts.
pub fn default_abort_predicate() -> AbortPredicate {
    Arc::new(|throwable: &Throwable| throwable.is::<Aborted>())
}

/// Accumulates the failures of every lifecycle phase of one node.
///
/// The first throwable is retained and later ones are attached to it as
/// suppressed, except that a failure displaces a retained abort, which is
/// then suppressed by the failure instead.
pub struct ThrowableCollector {
    abort_predicate: AbortPredicate,
    throwable: RefCell<Option<Throwable>>,
}

impl ThrowableCollector {
    pub fn new(abort_predicate: AbortPredicate) -> Self {
        Self {
            abort_predicate,
            throwable: RefCell::new(None),
        }
    }

    /// Runs `block`, collecting the error it returns or the panic it raises.
    ///
    /// An [`Unrecoverable`] error or panic is not collected, it continues to
    /// unwind past the collector.
    pub fn execute(&self, block: impl FnOnce() -> anyhow::Result<()>) {
        match catch_unwind(AssertUnwindSafe(block)) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => match error.downcast::<Unrecoverable>() {
                Ok(unrecoverable) => resume_unwind(Box::new(unrecoverable)),
                Err(error) => match joined_unrecoverable(&error) {
                    Some(unrecoverable) => resume_unwind(Box::new(unrecoverable)),
                    None => self.add(Throwable::new(error)),
                },
            },
            Err(payload) => {
                if payload.is::<Unrecoverable>() {
                    resume_unwind(payload);
                }
                self.add(Throwable::from_panic(payload));
            }
        }
    }

    pub fn add(&self, throwable: Throwable) {
        let mut retained = self.throwable.borrow_mut();
        let Some(current) = retained.clone() else {
            *retained = Some(throwable);
            return;
        };

        if self.is_aborted(&current) && !self.is_aborted(&throwable) {
            throwable.add_suppressed(current);
            *retained = Some(throwable);
        } else {
            current.add_suppressed(throwable);
        }
    }

    pub fn throwable(&self) -> Option<Throwable> {
        self.throwable.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.throwable.borrow().is_none()
    }

    pub fn to_result(&self) -> ExecutionResult {
        match self.throwable() {
            None => ExecutionResult::successful(),
            Some(throwable) if self.is_aborted(&throwable) => ExecutionResult::aborted(throwable),
            Some(throwable) => ExecutionResult::failed(throwable),
        }
    }

    fn is_aborted(&self, throwable: &Throwable) -> bool {
        (self.abort_predicate)(throwable)
    }
}

impl Default for ThrowableCollector {
    fn default() -> Self {
        Self::new(default_abort_predicate())
    }
}

/// A joined task that died of an [`Unrecoverable`] takes the joining node
/// down with it, however the join error was wrapped.
fn joined_unrecoverable(error: &anyhow::Error) -> Option<Unrecoverable> {
    error.chain().find_map(|cause| match cause.downcast_ref::<JoinError>() {
        Some(JoinError::Panicked(payload)) if payload.is::<Unrecoverable>() => {
            Some(Unrecoverable(payload.message()))
        }
        _ => None,
    })
}
