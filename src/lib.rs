#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod blocking;
mod cancel;
mod collector;
pub mod config;
mod engine;
mod error;
mod interrupt;
mod listener;
pub mod lock;
mod node;
mod resource;
pub mod service;
mod walker;

#[cfg(feature = "logging")]
pub mod logging;

#[cfg(test)]
mod testing;

pub use crate::cancel::CancellationToken;
pub use crate::collector::{
    AbortPredicate, ExecutionResult, Status, Throwable, ThrowableCollector,
    default_abort_predicate,
};
pub use crate::engine::{DynamicExecutor, HierarchicalExecutor};
pub use crate::error::*;
pub use crate::interrupt::Interrupt;
pub use crate::listener::{ExecutionListener, LoggingListener, NoopListener};
pub use crate::lock::{LockManager, ResourceLock, ResourceLockGuard};
pub use crate::node::{
    Descriptor, ExecutionContext, ExecutionMode, Node, Segment, SkipResult, UniqueId,
};
pub use crate::resource::{ExclusiveResource, GLOBAL_KEY, LockMode};
pub use crate::service::{
    ExecutorService, FixedPoolService, IsolatingService, SameThreadService, ScheduledTask,
    TaskHandle, WorkStealingService,
};
pub use crate::walker::{ExecutionAdvisory, NodeTreeWalker};
