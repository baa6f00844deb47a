use std::collections::{BTreeSet, HashMap};

use crate::error::EngineError;
use crate::lock::{LockManager, ResourceLock};
use crate::node::{ExecutionContext, ExecutionMode, Node, UniqueId};
use crate::resource::{ExclusiveResource, is_read_only};

/// The outcome of the tree walk: which lock each node acquires, and which
/// nodes are forced to run on the thread of their parent.
///
/// Built once before execution starts and only read afterwards.
#[derive(Debug, Default)]
pub struct ExecutionAdvisory {
    locks: HashMap<UniqueId, ResourceLock>,
    forced: HashMap<UniqueId, ExecutionMode>,
    forced_descendants: HashMap<UniqueId, ExecutionMode>,
}

impl ExecutionAdvisory {
    /// The lock of a node, [`ResourceLock::Nop`] unless the walk assigned
    /// one.
    pub fn resource_lock(&self, id: &UniqueId) -> ResourceLock {
        self.locks.get(id).cloned().unwrap_or(ResourceLock::Nop)
    }

    /// The mode a node is forced into by one of its ancestors.
    pub fn forced_execution_mode(&self, id: &UniqueId) -> Option<ExecutionMode> {
        self.forced.get(id).copied()
    }

    /// The mode every descendant of a node is forced into, including the
    /// descendants it only registers while running.
    pub fn forced_descendant_mode(&self, id: &UniqueId) -> Option<ExecutionMode> {
        self.forced_descendants.get(id).copied()
    }

    fn use_lock(&mut self, id: &UniqueId, lock: ResourceLock) {
        self.locks.insert(id.clone(), lock);
    }

    fn remove_lock(&mut self, id: &UniqueId) {
        self.locks.remove(id);
    }

    fn force_descendants<C: ExecutionContext>(&mut self, node: &dyn Node<C>) {
        self.forced_descendants
            .insert(node.unique_id().clone(), ExecutionMode::SameThread);
    }

    fn force(&mut self, id: &UniqueId) {
        self.forced.insert(id.clone(), ExecutionMode::SameThread);
    }
}

/// Turns the resources declared by individual nodes into a lock assignment
/// for the whole tree.
///
/// Each top-level child of the root is an anchor. Anchors hold the global
/// lock, in read mode unless something inside their subtree needs it in
/// read-write mode. A node declaring resources takes one lock covering the
/// resources of its whole subtree. Its descendants then take no locks of
/// their own, and are forced to run sequentially whenever that lock is
/// exclusive. No thread ever acquires two locks on the same key.
pub struct NodeTreeWalker<'a> {
    manager: &'a LockManager,
    global_read_write: ResourceLock,
}

impl<'a> NodeTreeWalker<'a> {
    pub fn new(manager: &'a LockManager) -> Self {
        Self {
            manager,
            global_read_write: manager.global_read_write_lock(),
        }
    }

    pub fn walk<C, N>(&self, root: &N) -> Result<ExecutionAdvisory, EngineError>
    where
        C: ExecutionContext,
        N: Node<C> + ?Sized,
    {
        if !root.exclusive_resources().is_empty() {
            return Err(EngineError::RootDeclaresResources(root.unique_id().clone()));
        }

        let mut advisory = ExecutionAdvisory::default();
        for anchor in root.children() {
            self.walk_node(&*anchor, &*anchor, &mut advisory);
        }

        tracing::debug!(
            locks = advisory.locks.len(),
            forced = advisory.forced.len(),
            "walked node tree"
        );
        Ok(advisory)
    }

    fn walk_node<C: ExecutionContext>(
        &self,
        anchor: &dyn Node<C>,
        node: &dyn Node<C>,
        advisory: &mut ExecutionAdvisory,
    ) {
        if advisory.resource_lock(anchor.unique_id()) == self.global_read_write {
            // Nothing in this subtree can need more than the anchor holds.
            return;
        }

        let is_anchor = anchor.unique_id() == node.unique_id();
        let own = node.exclusive_resources();

        if own.is_empty() {
            if is_anchor {
                advisory.use_lock(node.unique_id(), self.manager.global_read_lock());
            }
            for child in node.children() {
                self.walk_node(anchor, &*child, advisory);
            }
            return;
        }

        let mut resources: BTreeSet<ExclusiveResource> = own;
        if is_read_only(&resources) {
            for_each_descendant(node, &mut |descendant| {
                resources.extend(descendant.exclusive_resources());
            });
            if !is_read_only(&resources) {
                force_subtree(node, advisory);
            }
        } else {
            advisory.force_descendants(node);
            for_each_descendant(node, &mut |descendant| {
                resources.extend(descendant.exclusive_resources());
                advisory.force(descendant.unique_id());
                advisory.force_descendants(descendant);
            });
        }

        if resources.contains(&ExclusiveResource::global_read_write()) {
            force_subtree(anchor, advisory);
            for_each_descendant(anchor, &mut |descendant| {
                advisory.remove_lock(descendant.unique_id());
            });
            advisory.use_lock(anchor.unique_id(), self.global_read_write.clone());
        } else {
            if is_anchor {
                resources.insert(ExclusiveResource::global_read());
            } else {
                resources.remove(&ExclusiveResource::global_read());
            }
            advisory.use_lock(
                node.unique_id(),
                self.manager.lock_for_resources(&resources),
            );
        }
    }
}

/// Forces every descendant of `node`, current and dynamic, to run on the
/// thread of its parent.
fn force_subtree<C: ExecutionContext>(node: &dyn Node<C>, advisory: &mut ExecutionAdvisory) {
    advisory.force_descendants(node);
    for_each_descendant(node, &mut |descendant| {
        advisory.force(descendant.unique_id());
        advisory.force_descendants(descendant);
    });
}

fn for_each_descendant<C: ExecutionContext>(
    node: &dyn Node<C>,
    visit: &mut dyn FnMut(&dyn Node<C>),
) {
    for child in node.children() {
        visit(&*child);
        for_each_descendant(&*child, visit);
    }
}
