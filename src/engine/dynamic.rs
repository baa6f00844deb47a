use std::collections::HashMap;
use std::panic::resume_unwind;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::collector::{ExecutionResult, Throwable};
use crate::engine::task::{NodeTask, TaskContext};
use crate::error::JoinError;
use crate::listener::ExecutionListener;
use crate::node::{ExecutionContext, ExecutionMode, Node, UniqueId};
use crate::service::TaskHandle;

enum DynamicTask {
    /// Registered, but `submit` did not return yet.
    Unscheduled,
    Scheduled(TaskHandle),
}

/// Registers nodes discovered while a node executes.
///
/// Registered nodes are scheduled right away with the context of the
/// registering node and through the same executor service. The registering
/// node does not finish before all of them did.
pub struct DynamicExecutor<C: ExecutionContext> {
    task_context: TaskContext,
    context: C,
    forced: Option<ExecutionMode>,
    unfinished: Arc<Mutex<HashMap<UniqueId, DynamicTask>>>,
}

impl<C: ExecutionContext> DynamicExecutor<C> {
    pub(crate) fn new(task_context: TaskContext, context: C, forced: Option<ExecutionMode>) -> Self {
        Self {
            task_context,
            context,
            forced,
            unfinished: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedules `node`, reporting to the listener of the run.
    pub fn execute(&self, node: Arc<dyn Node<C>>) -> TaskHandle {
        self.schedule(node, self.task_context.clone())
    }

    /// Schedules `node`, reporting its events and the events of its
    /// descendants to `listener` instead of the listener of the run.
    pub fn execute_with_listener(
        &self,
        node: Arc<dyn Node<C>>,
        listener: Arc<dyn ExecutionListener>,
    ) -> TaskHandle {
        self.schedule(node, self.task_context.with_listener(listener))
    }

    fn schedule(&self, node: Arc<dyn Node<C>>, task_context: TaskContext) -> TaskHandle {
        let listener = task_context.listener.clone();
        listener.dynamic_node_registered(&*node);

        let resources = node.exclusive_resources();
        if !resources.is_empty() {
            let resources: Vec<String> = resources.iter().map(ToString::to_string).collect();
            let error = anyhow!(
                "Dynamic nodes must not declare exclusive resources: {}",
                resources.join(", ")
            );
            listener.execution_started(&*node);
            listener.execution_finished(&*node, &ExecutionResult::failed(Throwable::new(error)));
            return TaskHandle::completed();
        }

        let id = node.unique_id().clone();
        self.unfinished
            .lock()
            .insert(id.clone(), DynamicTask::Unscheduled);

        let unfinished = self.unfinished.clone();
        let finished = id.clone();
        let task = NodeTask::new(task_context, node, self.context.clone(), self.forced)
            .with_finalizer(move || {
                unfinished.lock().remove(&finished);
            });

        let handle = self.task_context.service.submit(Box::new(task));

        // The task may have completed during `submit` already.
        if let Some(entry) = self.unfinished.lock().get_mut(&id) {
            *entry = DynamicTask::Scheduled(handle.clone());
        }
        handle
    }

    /// Waits for every registered node which did not finish yet.
    ///
    /// Nodes whose handle was cancelled are not waited for.
    pub(crate) fn await_finished(&self) -> anyhow::Result<()> {
        let handles: Vec<TaskHandle> = self
            .unfinished
            .lock()
            .values()
            .filter_map(|task| match task {
                DynamicTask::Scheduled(handle) => Some(handle.clone()),
                DynamicTask::Unscheduled => None,
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(()) | Err(JoinError::Cancelled) => {}
                Err(JoinError::Panicked(payload)) => resume_unwind(payload.into_inner()),
                Err(JoinError::Abandoned) => {
                    return Err(anyhow!("Dynamic node was abandoned before it could run"));
                }
            }
        }
        Ok(())
    }
}
