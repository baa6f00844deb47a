mod dynamic;
mod task;

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::collector::{AbortPredicate, default_abort_predicate};
use crate::error::{EngineError, JoinError};
use crate::listener::{ExecutionListener, NoopListener};
use crate::lock::LockManager;
use crate::node::{ExecutionContext, Node};
use crate::service::ExecutorService;
use crate::walker::NodeTreeWalker;

pub use crate::engine::dynamic::DynamicExecutor;
use crate::engine::task::{NodeTask, TaskContext};

/// Runs a tree of nodes to completion.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use kasane::{HierarchicalExecutor, Node, SameThreadService};
/// # fn run(root: Arc<dyn Node<String>>) -> Result<(), kasane::EngineError> {
/// HierarchicalExecutor::new(root, String::new(), Arc::new(SameThreadService)).execute()
/// # }
/// ```
pub struct HierarchicalExecutor<C: ExecutionContext> {
    root: Arc<dyn Node<C>>,
    root_context: C,
    service: Arc<dyn ExecutorService>,
    listener: Arc<dyn ExecutionListener>,
    cancellation: CancellationToken,
    abort_predicate: AbortPredicate,
}

impl<C: ExecutionContext> HierarchicalExecutor<C> {
    pub fn new(root: Arc<dyn Node<C>>, root_context: C, service: Arc<dyn ExecutorService>) -> Self {
        Self {
            root,
            root_context,
            service,
            listener: Arc::new(NoopListener),
            cancellation: CancellationToken::new(),
            abort_predicate: default_abort_predicate(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Decides which collected failures count as aborted, by default
    /// [`Aborted`](crate::Aborted) errors.
    pub fn with_abort_predicate(mut self, abort_predicate: AbortPredicate) -> Self {
        self.abort_predicate = abort_predicate;
        self
    }

    /// Blocks until every node of the tree, including the dynamically
    /// registered ones, finished or was skipped. The service is closed
    /// afterwards.
    ///
    /// Failures of nodes are only ever reported to the listener. An error
    /// is returned for invalid trees and unrecoverable failures.
    pub fn execute(self) -> Result<(), EngineError> {
        let span = tracing::info_span!("execute", root = %self.root.unique_id());
        let _enter = span.enter();

        let outcome = self.run();
        self.service.close();

        match &outcome {
            Ok(()) => tracing::info!("execution finished"),
            Err(error) => tracing::error!(%error, "execution failed"),
        }
        outcome
    }

    fn run(&self) -> Result<(), EngineError> {
        let manager = LockManager::new();
        let advisory = NodeTreeWalker::new(&manager).walk::<C, dyn Node<C>>(&*self.root)?;

        let task_context = TaskContext {
            listener: self.listener.clone(),
            service: self.service.clone(),
            advisory: Arc::new(advisory),
            cancellation: self.cancellation.clone(),
            abort_predicate: self.abort_predicate.clone(),
        };

        let root = NodeTask::new(
            task_context,
            self.root.clone(),
            self.root_context.clone(),
            None,
        );

        match self.service.submit(Box::new(root)).join() {
            Ok(()) => Ok(()),
            Err(JoinError::Panicked(payload)) => Err(EngineError::from_panic(payload.into_inner())),
            Err(JoinError::Abandoned | JoinError::Cancelled) => Err(EngineError::Abandoned),
        }
    }
}
