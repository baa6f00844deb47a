//! Configurable nodes and a recording listener for the unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collector::{ExecutionResult, Status};
use crate::engine::DynamicExecutor;
use crate::listener::ExecutionListener;
use crate::lock::ResourceLock;
use crate::node::{Descriptor, ExecutionMode, Node, SkipResult, UniqueId};
use crate::resource::ExclusiveResource;
use crate::service::ScheduledTask;

/// Context used by test trees: the trail of hooks that produced it.
pub(crate) type Ctx = String;

type Derive = Box<dyn Fn(&Ctx) -> anyhow::Result<Ctx> + Send + Sync>;
type Hook = Box<dyn Fn(&Ctx) -> anyhow::Result<()> + Send + Sync>;
type Skip = Box<dyn Fn(&Ctx) -> anyhow::Result<SkipResult> + Send + Sync>;
type Execute = Box<dyn Fn(&Ctx, &DynamicExecutor<Ctx>) -> anyhow::Result<()> + Send + Sync>;
type Around = Box<dyn Fn(&Ctx, &mut dyn FnMut(&Ctx)) -> anyhow::Result<()> + Send + Sync>;

pub(crate) fn engine_id() -> UniqueId {
    UniqueId::root("engine", "test")
}

pub(crate) struct TestNode {
    id: UniqueId,
    resources: BTreeSet<ExclusiveResource>,
    mode: ExecutionMode,
    children: Vec<Arc<dyn Node<Ctx>>>,
    prepare: Option<Derive>,
    skip: Option<Skip>,
    before: Option<Derive>,
    execute: Option<Execute>,
    after: Option<Hook>,
    around: Option<Around>,
    cleanup: Option<Hook>,
}

impl TestNode {
    pub(crate) fn new(id: UniqueId) -> Self {
        Self {
            id,
            resources: BTreeSet::new(),
            mode: ExecutionMode::Concurrent,
            children: Vec::new(),
            prepare: None,
            skip: None,
            before: None,
            execute: None,
            after: None,
            around: None,
            cleanup: None,
        }
    }

    pub(crate) fn resource(mut self, resource: ExclusiveResource) -> Self {
        self.resources.insert(resource);
        self
    }

    pub(crate) fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn child(mut self, child: Arc<TestNode>) -> Self {
        self.children.push(child);
        self
    }

    pub(crate) fn on_prepare(
        mut self,
        f: impl Fn(&Ctx) -> anyhow::Result<Ctx> + Send + Sync + 'static,
    ) -> Self {
        self.prepare = Some(Box::new(f));
        self
    }

    pub(crate) fn on_skip(
        mut self,
        f: impl Fn(&Ctx) -> anyhow::Result<SkipResult> + Send + Sync + 'static,
    ) -> Self {
        self.skip = Some(Box::new(f));
        self
    }

    pub(crate) fn on_before(
        mut self,
        f: impl Fn(&Ctx) -> anyhow::Result<Ctx> + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(Box::new(f));
        self
    }

    pub(crate) fn on_execute(
        mut self,
        f: impl Fn(&Ctx, &DynamicExecutor<Ctx>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.execute = Some(Box::new(f));
        self
    }

    pub(crate) fn on_after(
        mut self,
        f: impl Fn(&Ctx) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(Box::new(f));
        self
    }

    pub(crate) fn on_around(
        mut self,
        f: impl Fn(&Ctx, &mut dyn FnMut(&Ctx)) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.around = Some(Box::new(f));
        self
    }

    pub(crate) fn on_cleanup(
        mut self,
        f: impl Fn(&Ctx) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }

    pub(crate) fn build(self) -> Arc<TestNode> {
        Arc::new(self)
    }
}

impl Descriptor for TestNode {
    fn unique_id(&self) -> &UniqueId {
        &self.id
    }

    fn exclusive_resources(&self) -> BTreeSet<ExclusiveResource> {
        self.resources.clone()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl Node<Ctx> for TestNode {
    fn children(&self) -> Vec<Arc<dyn Node<Ctx>>> {
        self.children.clone()
    }

    fn prepare(&self, context: &Ctx) -> anyhow::Result<Ctx> {
        match &self.prepare {
            Some(f) => f(context),
            None => Ok(context.clone()),
        }
    }

    fn should_be_skipped(&self, context: &Ctx) -> anyhow::Result<SkipResult> {
        match &self.skip {
            Some(f) => f(context),
            None => Ok(SkipResult::Proceed),
        }
    }

    fn before(&self, context: &Ctx) -> anyhow::Result<Ctx> {
        match &self.before {
            Some(f) => f(context),
            None => Ok(context.clone()),
        }
    }

    fn execute(&self, context: &Ctx, dynamic: &DynamicExecutor<Ctx>) -> anyhow::Result<Ctx> {
        if let Some(f) = &self.execute {
            f(context, dynamic)?;
        }
        Ok(context.clone())
    }

    fn after(&self, context: &Ctx) -> anyhow::Result<()> {
        match &self.after {
            Some(f) => f(context),
            None => Ok(()),
        }
    }

    fn around(&self, context: &Ctx, invocation: &mut dyn FnMut(&Ctx)) -> anyhow::Result<()> {
        match &self.around {
            Some(f) => f(context, invocation),
            None => {
                invocation(context);
                Ok(())
            }
        }
    }

    fn cleanup(&self, context: &Ctx) -> anyhow::Result<()> {
        match &self.cleanup {
            Some(f) => f(context),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Registered(UniqueId),
    Skipped(UniqueId, Option<String>),
    Started(UniqueId),
    Finished(UniqueId, ExecutionResult),
}

impl Event {
    pub(crate) fn id(&self) -> &UniqueId {
        match self {
            Event::Registered(id)
            | Event::Skipped(id, _)
            | Event::Started(id)
            | Event::Finished(id, _) => id,
        }
    }
}

/// Remembers every event in the order it was received.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// The events of one node, in order.
    pub(crate) fn events_of(&self, id: &UniqueId) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.id() == id)
            .cloned()
            .collect()
    }

    pub(crate) fn result_of(&self, id: &UniqueId) -> Option<ExecutionResult> {
        self.events.lock().iter().find_map(|event| match event {
            Event::Finished(finished, result) if finished == id => Some(result.clone()),
            _ => None,
        })
    }

    pub(crate) fn status_of(&self, id: &UniqueId) -> Option<Status> {
        self.result_of(id).map(|result| result.status())
    }

    pub(crate) fn skip_reason_of(&self, id: &UniqueId) -> Option<Option<String>> {
        self.events.lock().iter().find_map(|event| match event {
            Event::Skipped(skipped, reason) if skipped == id => Some(reason.clone()),
            _ => None,
        })
    }
}

impl ExecutionListener for RecordingListener {
    fn dynamic_node_registered(&self, node: &dyn Descriptor) {
        self.events
            .lock()
            .push(Event::Registered(node.unique_id().clone()));
    }

    fn execution_skipped(&self, node: &dyn Descriptor, reason: Option<&str>) {
        self.events.lock().push(Event::Skipped(
            node.unique_id().clone(),
            reason.map(str::to_string),
        ));
    }

    fn execution_started(&self, node: &dyn Descriptor) {
        self.events
            .lock()
            .push(Event::Started(node.unique_id().clone()));
    }

    fn execution_finished(&self, node: &dyn Descriptor, result: &ExecutionResult) {
        self.events
            .lock()
            .push(Event::Finished(node.unique_id().clone(), result.clone()));
    }
}

type Body = Box<dyn FnOnce() + Send>;
type OnAbandon = Box<dyn FnOnce(anyhow::Error) + Send>;

/// A scheduled task running a closure, for testing executor services
/// without nodes.
pub(crate) struct FnTask {
    id: UniqueId,
    mode: ExecutionMode,
    lock: ResourceLock,
    body: Body,
    abandon: Option<OnAbandon>,
}

impl FnTask {
    pub(crate) fn new(name: &str, body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: engine_id().append("task", name),
            mode: ExecutionMode::Concurrent,
            lock: ResourceLock::Nop,
            body: Box::new(body),
            abandon: None,
        }
    }

    pub(crate) fn with_id(mut self, id: UniqueId) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn lock(mut self, lock: ResourceLock) -> Self {
        self.lock = lock;
        self
    }

    pub(crate) fn on_abandon(mut self, f: impl FnOnce(anyhow::Error) + Send + 'static) -> Self {
        self.abandon = Some(Box::new(f));
        self
    }

    pub(crate) fn boxed(self) -> Box<dyn ScheduledTask> {
        Box::new(self)
    }
}

impl ScheduledTask for FnTask {
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
        (self.body)()
    }

    fn abandon(self: Box<Self>, error: anyhow::Error) {
        if let Some(f) = self.abandon {
            f(error);
        }
    }
}
