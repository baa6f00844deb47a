use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::lock::{LockEntry, ResourceLock};
use crate::resource::ExclusiveResource;

/// Hands out resource locks for a single run.
///
/// Every key maps to exactly one read/write lock for the lifetime of the
/// manager, so all nodes referencing the same key contend on the same lock.
pub struct LockManager {
    locks: Mutex<HashMap<Arc<str>, Arc<RwLock<()>>>>,
    global_read: ResourceLock,
    global_read_write: ResourceLock,
}

impl LockManager {
    pub fn new() -> Self {
        let global = Arc::new(RwLock::new(()));
        let global_read = ResourceLock::Single(LockEntry::new(
            ExclusiveResource::global_read(),
            global.clone(),
        ));
        let global_read_write = ResourceLock::Single(LockEntry::new(
            ExclusiveResource::global_read_write(),
            global.clone(),
        ));

        let mut locks = HashMap::new();
        locks.insert(Arc::from(crate::resource::GLOBAL_KEY), global);

        Self {
            locks: Mutex::new(locks),
            global_read,
            global_read_write,
        }
    }

    /// The lock for a set of resources.
    ///
    /// Requests for the same key are merged, keeping `ReadWrite` over
    /// `Read`. The remaining resources are acquired global key first, then in
    /// lexical key order.
    pub fn lock_for_resources<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a ExclusiveResource>,
    ) -> ResourceLock {
        let sorted: BTreeSet<&ExclusiveResource> = resources.into_iter().collect();

        let mut distinct: Vec<&ExclusiveResource> = Vec::with_capacity(sorted.len());
        for resource in sorted {
            // Sorted by key, then `ReadWrite` first, so the first one seen wins.
            if distinct.last().is_some_and(|last| last.key() == resource.key()) {
                continue;
            }
            distinct.push(resource);
        }

        match distinct.as_slice() {
            [] => ResourceLock::Nop,
            [single] => self.lock_for_resource(single),
            many => ResourceLock::Composite(many.iter().map(|r| self.entry(r)).collect()),
        }
    }

    pub fn lock_for_resource(&self, resource: &ExclusiveResource) -> ResourceLock {
        ResourceLock::Single(self.entry(resource))
    }

    pub fn global_read_lock(&self) -> ResourceLock {
        self.global_read.clone()
    }

    pub fn global_read_write_lock(&self) -> ResourceLock {
        self.global_read_write.clone()
    }

    fn entry(&self, resource: &ExclusiveResource) -> LockEntry {
        let lock = self
            .locks
            .lock()
            .entry(Arc::from(resource.key()))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();

        LockEntry::new(resource.clone(), lock)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_is_nop() {
        let manager = LockManager::new();
        assert!(manager.lock_for_resources([]).is_nop());
    }

    #[test]
    fn test_single_resource() {
        let manager = LockManager::new();
        let resource = ExclusiveResource::read_write("printer");
        let lock = manager.lock_for_resources([&resource]);

        assert!(matches!(lock, ResourceLock::Single(_)));
        assert_eq!(lock.resources(), vec![resource]);
    }

    #[test]
    fn test_same_key_shares_underlying_lock() {
        let manager = LockManager::new();
        let first = manager.lock_for_resource(&ExclusiveResource::read_write("printer"));
        let second = manager.lock_for_resource(&ExclusiveResource::read_write("printer"));

        assert!(first.shares_locks_with(&second));

        let _held = first.acquire().unwrap();
        assert!(second.try_acquire().is_none());
    }

    #[test]
    fn test_read_write_wins_over_read() {
        let manager = LockManager::new();
        let resources = [
            ExclusiveResource::read("x"),
            ExclusiveResource::read_write("x"),
        ];
        let lock = manager.lock_for_resources(&resources);

        assert_eq!(lock.resources(), vec![ExclusiveResource::read_write("x")]);
        assert!(matches!(lock, ResourceLock::Single(_)));
    }

    #[test]
    fn test_canonical_order_regardless_of_request_order() {
        let manager = LockManager::new();
        let forward = [
            ExclusiveResource::read("a"),
            ExclusiveResource::read_write("b"),
            ExclusiveResource::global_read(),
        ];
        let backward = [
            ExclusiveResource::global_read(),
            ExclusiveResource::read_write("b"),
            ExclusiveResource::read("a"),
        ];

        let first = manager.lock_for_resources(&forward);
        let second = manager.lock_for_resources(&backward);

        assert_eq!(first, second);
        assert!(first.shares_locks_with(&second));
        assert_eq!(
            first.resources(),
            vec![
                ExclusiveResource::global_read(),
                ExclusiveResource::read("a"),
                ExclusiveResource::read_write("b"),
            ]
        );
    }

    #[test]
    fn test_global_locks_share_one_lock() {
        let manager = LockManager::new();
        let read = manager.global_read_lock();
        let write = manager.global_read_write_lock();
        let requested = manager.lock_for_resource(&ExclusiveResource::global_read());

        assert_eq!(read, requested);
        assert!(read.shares_locks_with(&requested));

        let _reading = read.acquire().unwrap();
        assert!(write.try_acquire().is_none());
        assert!(requested.try_acquire().is_some());
    }
}
