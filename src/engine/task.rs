use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use anyhow::anyhow;

use crate::cancel::CancellationToken;
use crate::collector::{AbortPredicate, Throwable, ThrowableCollector};
use crate::engine::DynamicExecutor;
use crate::error::{Unrecoverable, panic_message};
use crate::interrupt::Interrupt;
use crate::listener::ExecutionListener;
use crate::lock::ResourceLock;
use crate::node::{Descriptor, ExecutionContext, ExecutionMode, Node, SkipResult, UniqueId};
use crate::service::{ExecutorService, ScheduledTask};
use crate::walker::ExecutionAdvisory;

/// Everything the tasks of one run share.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) listener: Arc<dyn ExecutionListener>,
    pub(crate) service: Arc<dyn ExecutorService>,
    pub(crate) advisory: Arc<ExecutionAdvisory>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) abort_predicate: AbortPredicate,
}

impl TaskContext {
    pub(crate) fn with_listener(&self, listener: Arc<dyn ExecutionListener>) -> Self {
        Self {
            listener,
            ..self.clone()
        }
    }
}

type Finalizer = Box<dyn FnOnce() + Send>;

/// Drives the lifecycle of a single node and schedules its children.
pub(crate) struct NodeTask<C: ExecutionContext> {
    task_context: TaskContext,
    node: Arc<dyn Node<C>>,
    parent_context: C,
    forced: Option<ExecutionMode>,
    finalizer: Option<Finalizer>,
}

impl<C: ExecutionContext> NodeTask<C> {
    pub(crate) fn new(
        task_context: TaskContext,
        node: Arc<dyn Node<C>>,
        parent_context: C,
        forced: Option<ExecutionMode>,
    ) -> Self {
        Self {
            task_context,
            node,
            parent_context,
            forced,
            finalizer: None,
        }
    }

    /// Runs `finalizer` once the task completed, however it completed.
    pub(crate) fn with_finalizer(mut self, finalizer: impl FnOnce() + Send + 'static) -> Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    fn descriptor(&self) -> &dyn Descriptor {
        &*self.node
    }

    /// The mode children of this node are forced into, if any. Static
    /// children may be forced on their own account on top of this.
    fn forced_for_children(&self) -> Option<ExecutionMode> {
        self.forced.or_else(|| {
            self.task_context
                .advisory
                .forced_descendant_mode(self.node.unique_id())
        })
    }

    fn run(mut self) {
        let collector = ThrowableCollector::new(self.task_context.abort_predicate.clone());
        let mut context = None;
        let mut skip = SkipResult::Proceed;
        let mut started = false;

        collector.execute(|| {
            context = Some(self.node.prepare(&self.parent_context)?);
            Ok(())
        });

        if collector.is_empty()
            && let Some(context) = &context
        {
            if self.task_context.cancellation.is_cancellation_requested() {
                skip = SkipResult::skip("Execution cancelled");
            } else {
                collector.execute(|| {
                    skip = self.node.should_be_skipped(context)?;
                    Ok(())
                });
            }
        }

        if collector.is_empty()
            && !skip.is_skipped()
            && let Some(context) = &mut context
        {
            self.task_context.listener.execution_started(self.descriptor());
            started = true;
            self.execute_recursively(&collector, context);
        }

        if let Some(context) = &context {
            collector.execute(|| self.node.cleanup(context));
        }

        self.report_completion(&collector, context.as_ref(), &skip, started);

        Interrupt::current().clear();
        drop(context);
        if let Some(finalizer) = self.finalizer.take() {
            finalizer();
        }
    }

    fn execute_recursively(&self, collector: &ThrowableCollector, context: &mut C) {
        let mut invocations = 0usize;
        let outer = context.clone();

        collector.execute(|| {
            self.node.around(&outer, &mut |around: &C| {
                invocations += 1;
                if invocations == 1 {
                    *context = around.clone();
                    self.invoke(collector, context);
                }
            })?;

            match invocations {
                1 => Ok(()),
                0 => Err(anyhow!(
                    "around() of {} did not invoke the wrapped execution",
                    self.node.unique_id()
                )),
                n => Err(anyhow!(
                    "around() of {} invoked the wrapped execution {n} times, it must be invoked exactly once",
                    self.node.unique_id()
                )),
            }
        });
    }

    /// `before`, `execute`, the children and `after`, in that order.
    fn invoke(&self, collector: &ThrowableCollector, context: &mut C) {
        let mut dynamic = None;

        collector.execute(|| {
            *context = self.node.before(context)?;
            let children = self.node.children();

            let executor = dynamic.insert(DynamicExecutor::new(
                self.task_context.clone(),
                context.clone(),
                self.forced_for_children(),
            ));
            *context = self.node.execute(context, executor)?;

            if !children.is_empty() {
                let tasks = children
                    .into_iter()
                    .map(|child| self.child_task(child, context.clone()))
                    .collect();
                self.task_context.service.invoke_all(tasks);
            }
            Ok(())
        });

        if let Some(dynamic) = dynamic {
            collector.execute(|| dynamic.await_finished());
        }

        collector.execute(|| self.node.after(context));
    }

    fn child_task(&self, child: Arc<dyn Node<C>>, context: C) -> Box<dyn ScheduledTask> {
        let forced = self
            .task_context
            .advisory
            .forced_execution_mode(child.unique_id())
            .or(self.forced_for_children());

        Box::new(NodeTask::new(self.task_context.clone(), child, context, forced))
    }

    fn report_completion(
        &self,
        collector: &ThrowableCollector,
        context: Option<&C>,
        skip: &SkipResult,
        started: bool,
    ) {
        let listener = &self.task_context.listener;

        if collector.is_empty() && skip.is_skipped() {
            if let Some(context) = context {
                self.notify("node_skipped", || self.node.node_skipped(context, skip));
            }
            listener.execution_skipped(self.descriptor(), skip.reason());
            return;
        }

        if !started {
            // Listeners always see a start before the outcome.
            listener.execution_started(self.descriptor());
        }

        let result = collector.to_result();
        self.notify("node_finished", || self.node.node_finished(context, &result));
        listener.execution_finished(self.descriptor(), &result);
    }

    /// Runs a notification hook of the node. Its failures are logged, they
    /// no longer change the outcome of the node.
    fn notify(&self, hook: &str, f: impl FnOnce() -> anyhow::Result<()>) {
        let failure = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => return,
            Ok(Err(error)) => match error.downcast::<Unrecoverable>() {
                Ok(unrecoverable) => resume_unwind(Box::new(unrecoverable)),
                Err(error) => error.to_string(),
            },
            Err(payload) => {
                if payload.is::<Unrecoverable>() {
                    resume_unwind(payload);
                }
                panic_message(payload.as_ref())
            }
        };

        tracing::warn!(id = %self.node.unique_id(), hook, %failure, "notification hook failed");
    }
}

impl<C: ExecutionContext> ScheduledTask for NodeTask<C> {
    fn unique_id(&self) -> &UniqueId {
        self.node.unique_id()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.forced.unwrap_or_else(|| self.node.execution_mode())
    }

    fn resource_lock(&self) -> ResourceLock {
        self.task_context.advisory.resource_lock(self.node.unique_id())
    }

    fn execute(self: Box<Self>) {
        let span = tracing::debug_span!("node", id = %self.node.unique_id());
        let _enter = span.enter();
        self.run();
    }

    fn abandon(mut self: Box<Self>, error: anyhow::Error) {
        let collector = ThrowableCollector::new(self.task_context.abort_predicate.clone());
        collector.add(Throwable::new(error));
        self.report_completion(&collector, None, &SkipResult::Proceed, false);

        Interrupt::current().clear();
        if let Some(finalizer) = self.finalizer.take() {
            finalizer();
        }
    }
}
