use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use crate::collector::ExecutionResult;
use crate::engine::DynamicExecutor;
use crate::resource::ExclusiveResource;

/// One `[kind:value]` element of a [`UniqueId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    kind: String,
    value: String,
}

impl Segment {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.kind, self.value)
    }
}

/// Stable identifier of a node, a path of segments from the root.
///
/// ```
/// use kasane::UniqueId;
///
/// let id = UniqueId::root("engine", "demo").append("class", "Printer");
/// assert_eq!(id.to_string(), "[engine:demo]/[class:Printer]");
/// assert_eq!(id.last_segment().map(|s| s.kind()), Some("class"));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId {
    segments: Arc<[Segment]>,
}

impl UniqueId {
    pub fn root(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            segments: Arc::from([Segment::new(kind, value)]),
        }
    }

    /// The id of a child of the node identified by `self`.
    pub fn append(&self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        let mut segments = self.segments.to_vec();
        segments.push(Segment::new(kind, value));
        Self {
            segments: segments.into(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &UniqueId) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments.starts_with(&self.segments)
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            Display::fmt(segment, f)?;
        }
        Ok(())
    }
}

impl Debug for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UniqueId({self})")
    }
}

/// Whether a node may run alongside its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    #[default]
    Concurrent,
    SameThread,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SkipResult {
    #[default]
    Proceed,
    Skip(Option<String>),
}

impl SkipResult {
    pub fn skip(reason: impl Into<String>) -> Self {
        SkipResult::Skip(Some(reason.into()))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, SkipResult::Skip(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SkipResult::Skip(reason) => reason.as_deref(),
            SkipResult::Proceed => None,
        }
    }
}

/// Value threaded from a parent node to its children through the lifecycle
/// hooks. Each node derives its own context from the one it was given.
pub trait ExecutionContext: Clone + Send + Sync + 'static {}

impl<T> ExecutionContext for T where T: Clone + Send + Sync + 'static {}

/// What the engine and listeners know about a node without knowing its
/// context type.
pub trait Descriptor: Send + Sync {
    fn unique_id(&self) -> &UniqueId;

    fn display_name(&self) -> &str {
        self.unique_id()
            .last_segment()
            .map(Segment::value)
            .unwrap_or_default()
    }

    fn exclusive_resources(&self) -> BTreeSet<ExclusiveResource> {
        BTreeSet::new()
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }
}

/// A schedulable unit of work.
///
/// Every hook has a default which does nothing, or passes the context through
/// unchanged. Errors returned from hooks, as well as panics, are collected and
/// reported as the outcome of this node.
///
/// The lifecycle of a node is:
///
/// 1. [`prepare`](Node::prepare) derives the context of this node from the
///    context of its parent.
/// 2. [`should_be_skipped`](Node::should_be_skipped) decides whether to run.
/// 3. [`around`](Node::around) wraps the sequence of
///    [`before`](Node::before), [`execute`](Node::execute), the children and
///    [`after`](Node::after).
/// 4. [`cleanup`](Node::cleanup) runs whenever `prepare` succeeded.
pub trait Node<C: ExecutionContext>: Descriptor {
    /// Children known up front. Called once per execution, after `before`.
    fn children(&self) -> Vec<Arc<dyn Node<C>>> {
        Vec::new()
    }

    fn prepare(&self, context: &C) -> anyhow::Result<C> {
        Ok(context.clone())
    }

    fn should_be_skipped(&self, _context: &C) -> anyhow::Result<SkipResult> {
        Ok(SkipResult::Proceed)
    }

    fn before(&self, context: &C) -> anyhow::Result<C> {
        Ok(context.clone())
    }

    /// Runs the body of this node. Nodes discovered while running can be
    /// handed to `dynamic` and are awaited before this node finishes.
    fn execute(&self, context: &C, _dynamic: &DynamicExecutor<C>) -> anyhow::Result<C> {
        Ok(context.clone())
    }

    fn after(&self, _context: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// Wraps `before`, `execute`, the children and `after`. Implementations
    /// must call `invocation` exactly once, optionally with a different
    /// context.
    fn around(&self, context: &C, invocation: &mut dyn FnMut(&C)) -> anyhow::Result<()> {
        invocation(context);
        Ok(())
    }

    fn cleanup(&self, _context: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before listeners are told that this node was skipped.
    fn node_skipped(&self, _context: &C, _result: &SkipResult) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before listeners are told that this node finished. The context
    /// is absent when `prepare` failed.
    fn node_finished(&self, _context: Option<&C>, _result: &ExecutionResult) -> anyhow::Result<()> {
        Ok(())
    }
}
