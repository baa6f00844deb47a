use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// The key of the distinguished global resource. Every top-level subtree
/// holds it at least in read mode, which makes it the catch-all
/// mutual-exclusion point for cross-cutting concerns.
pub const GLOBAL_KEY: &str = "kasane.resource.global";

/// How a resource is accessed. `ReadWrite` orders before `Read`, so that the
/// stronger mode wins when requests for the same key are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    ReadWrite,
    Read,
}

/// An immutable `(key, mode)` pair declared by a node that must not run
/// concurrently with conflicting users of the same key.
///
/// Two resources with the same key are compatible iff both are `Read`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExclusiveResource {
    key: Arc<str>,
    mode: LockMode,
}

impl ExclusiveResource {
    pub fn new(key: impl Into<Arc<str>>, mode: LockMode) -> Self {
        Self {
            key: key.into(),
            mode,
        }
    }

    pub fn read(key: impl Into<Arc<str>>) -> Self {
        Self::new(key, LockMode::Read)
    }

    pub fn read_write(key: impl Into<Arc<str>>) -> Self {
        Self::new(key, LockMode::ReadWrite)
    }

    pub fn global_read() -> Self {
        Self::read(GLOBAL_KEY)
    }

    pub fn global_read_write() -> Self {
        Self::read_write(GLOBAL_KEY)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_global(&self) -> bool {
        &*self.key == GLOBAL_KEY
    }

    /// Whether two resources may be held at the same time by different nodes.
    pub fn is_compatible_with(&self, other: &ExclusiveResource) -> bool {
        self.key != other.key || (self.mode == LockMode::Read && other.mode == LockMode::Read)
    }
}

impl Ord for ExclusiveResource {
    /// Global key first, then lexical key order, then `ReadWrite` before
    /// `Read`. Lock acquisition follows this order everywhere, which is what
    /// rules out lock-order deadlocks.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .is_global()
            .cmp(&self.is_global())
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.mode.cmp(&other.mode))
    }
}

impl PartialOrd for ExclusiveResource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ExclusiveResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            LockMode::Read => "read",
            LockMode::ReadWrite => "read-write",
        };
        write!(f, "'{}' ({mode})", self.key)
    }
}

/// True if none of the resources needs exclusive access.
pub(crate) fn is_read_only<'a>(resources: impl IntoIterator<Item = &'a ExclusiveResource>) -> bool {
    resources
        .into_iter()
        .all(|resource| resource.mode() == LockMode::Read)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_global_key_orders_first() {
        let sorted: Vec<_> = [
            ExclusiveResource::read("a"),
            ExclusiveResource::global_read(),
            ExclusiveResource::read_write("0"),
        ]
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

        assert_eq!(sorted[0], ExclusiveResource::global_read());
        assert_eq!(sorted[1].key(), "0");
        assert_eq!(sorted[2].key(), "a");
    }

    #[test]
    fn test_read_write_orders_before_read() {
        let read = ExclusiveResource::read("x");
        let write = ExclusiveResource::read_write("x");
        assert!(write < read);
        assert!(ExclusiveResource::global_read_write() < ExclusiveResource::global_read());
    }

    #[test]
    fn test_equality_by_key_and_mode() {
        assert_eq!(ExclusiveResource::read("x"), ExclusiveResource::read("x"));
        assert_ne!(ExclusiveResource::read("x"), ExclusiveResource::read_write("x"));
        assert_ne!(ExclusiveResource::read("x"), ExclusiveResource::read("y"));
    }

    #[test]
    fn test_compatibility() {
        let read = ExclusiveResource::read("x");
        let write = ExclusiveResource::read_write("x");
        assert!(read.is_compatible_with(&read.clone()));
        assert!(!read.is_compatible_with(&write));
        assert!(!write.is_compatible_with(&write.clone()));
        assert!(write.is_compatible_with(&ExclusiveResource::read_write("y")));
    }

    #[test]
    fn test_read_only() {
        let resources = [ExclusiveResource::read("a"), ExclusiveResource::read("b")];
        assert!(is_read_only(&resources));
        assert!(!is_read_only(&[ExclusiveResource::read_write("a")]));
    }
}
