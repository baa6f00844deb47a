use std::any::Any;
use std::fmt::{Debug, Formatter};

use parking_lot::Mutex;
use thiserror::Error;

use crate::node::UniqueId;
use crate::resource::ExclusiveResource;

/// Failures that stop a run as a whole. Per-node failures never end up here,
/// they are reported through the listener instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Root node '{0}' must not declare exclusive resources")]
    RootDeclaresResources(UniqueId),

    #[error("Invalid parallel execution configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Couldn't start the executor service:\n{0}")]
    Pool(#[from] PoolError),

    #[error("Unrecoverable failure:\n{0}")]
    Unrecoverable(#[from] Unrecoverable),

    #[error("Execution panicked outside of any node: {0}")]
    Panicked(String),

    #[error("Root task was abandoned before it completed")]
    Abandoned,
}

impl EngineError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<Unrecoverable>() {
            Ok(unrecoverable) => EngineError::Unrecoverable(*unrecoverable),
            Err(payload) => EngineError::Panicked(panic_message(payload.as_ref())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration parameter '{key}' must be set")]
    Missing { key: String },

    #[error("Configuration parameter '{key}' has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unknown parallel execution strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Unknown executor service '{0}'")]
    UnknownExecutor(String),

    #[error("Custom parallel execution strategy '{0}' is not registered")]
    UnregisteredStrategy(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to build thread pool:\n{0}")]
    Build(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn worker thread:\n{0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker pool is saturated at {max_pool_size} threads")]
    Saturated { max_pool_size: usize },

    #[error("Executor service has been closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Interrupted while waiting for {0}")]
    Interrupted(ExclusiveResource),

    #[error("Couldn't block for {resource}:\n{source}")]
    Rejected {
        resource: ExclusiveResource,
        source: PoolError,
    },
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task panicked: {}", .0.message())]
    Panicked(PanicPayload),

    #[error("Task was abandoned before it could run")]
    Abandoned,
}

/// The payload a task panicked with.
///
/// The payload is kept behind a mutex so that a [`JoinError`] can travel as
/// an `anyhow::Error`.
pub struct PanicPayload(Mutex<Box<dyn Any + Send>>);

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        Self(Mutex::new(payload))
    }

    pub fn message(&self) -> String {
        panic_message(self.0.lock().as_ref())
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.lock().is::<T>()
    }

    /// The payload, ready for `std::panic::resume_unwind`.
    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.0.into_inner()
    }
}

impl Debug for PanicPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}

/// An assumption did not hold, the node should be reported as aborted rather
/// than failed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Aborted(pub String);

/// A condition which compromises the whole process. It is never attributed to
/// a single node and terminates the run.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Unrecoverable(pub String);

/// A panic raised by a node hook, captured as an error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PanicError(pub String);

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<Unrecoverable>() {
        e.to_string()
    } else if let Some(e) = payload.downcast_ref::<Aborted>() {
        e.to_string()
    } else {
        String::from("panicked with unknown payload")
    }
}
