mod manager;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::blocking;
use crate::error::LockError;
use crate::interrupt::Interrupt;
use crate::resource::{ExclusiveResource, LockMode};

pub use crate::lock::manager::LockManager;

/// How long a blocked acquisition sleeps before looking at the interruption
/// flag of its thread again.
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// The long-lived read/write lock of a resource key, paired with the mode a
/// node wants it in.
#[derive(Clone)]
pub struct LockEntry {
    resource: ExclusiveResource,
    lock: Arc<RwLock<()>>,
}

impl LockEntry {
    pub(crate) fn new(resource: ExclusiveResource, lock: Arc<RwLock<()>>) -> Self {
        Self { resource, lock }
    }

    fn try_acquire(&self) -> Option<Held> {
        match self.resource.mode() {
            LockMode::Read => self.lock.try_read_arc().map(Held::Read),
            LockMode::ReadWrite => self.lock.try_write_arc().map(Held::Write),
        }
    }

    fn acquire(&self, interrupt: &Interrupt) -> Result<Held, LockError> {
        if interrupt.is_interrupted() {
            return Err(LockError::Interrupted(self.resource.clone()));
        }

        if let Some(held) = self.try_acquire() {
            return Ok(held);
        }

        let waited = blocking::managed_block(|| {
            loop {
                let held = match self.resource.mode() {
                    LockMode::Read => self.lock.try_read_arc_for(INTERRUPT_POLL).map(Held::Read),
                    LockMode::ReadWrite => {
                        self.lock.try_write_arc_for(INTERRUPT_POLL).map(Held::Write)
                    }
                };

                if let Some(held) = held {
                    return Ok(held);
                }

                if interrupt.is_interrupted() {
                    return Err(LockError::Interrupted(self.resource.clone()));
                }
            }
        });

        match waited {
            Ok(result) => result,
            Err(source) => Err(LockError::Rejected {
                resource: self.resource.clone(),
                source,
            }),
        }
    }
}

// The guards are held only for their drop.
#[allow(dead_code)]
enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A scoped handle over zero, one or many read/write locks.
///
/// Composite locks acquire their locks in canonical resource order and
/// release them in reverse. Two locks are equal when they cover the same
/// resources in the same order.
#[derive(Clone)]
pub enum ResourceLock {
    /// No synchronization at all.
    Nop,
    /// Exactly one underlying lock.
    Single(LockEntry),
    /// Two or more underlying locks, in acquisition order.
    Composite(Arc<[LockEntry]>),
}

impl ResourceLock {
    fn entries(&self) -> &[LockEntry] {
        match self {
            ResourceLock::Nop => &[],
            ResourceLock::Single(entry) => std::slice::from_ref(entry),
            ResourceLock::Composite(entries) => &entries[..],
        }
    }

    /// The resources covered by this lock, in acquisition order.
    pub fn resources(&self) -> Vec<ExclusiveResource> {
        self.entries()
            .iter()
            .map(|entry| entry.resource.clone())
            .collect()
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, ResourceLock::Nop)
    }

    /// Whether holding this lock keeps every other user of one of its keys
    /// out.
    pub fn is_exclusive(&self) -> bool {
        self.entries()
            .iter()
            .any(|entry| entry.resource.mode() == LockMode::ReadWrite)
    }

    /// Whether the locks are backed by the very same underlying locks.
    pub fn shares_locks_with(&self, other: &ResourceLock) -> bool {
        let ours = self.entries();
        let theirs = other.entries();
        ours.len() == theirs.len()
            && ours
                .iter()
                .zip(theirs)
                .all(|(a, b)| Arc::ptr_eq(&a.lock, &b.lock))
    }

    /// Blocks until every underlying lock is held.
    ///
    /// Acquisition gives up when the calling thread is interrupted, and on
    /// a compensating pool when the pool refuses to let the thread block. In
    /// both cases the locks acquired so far are released in reverse order
    /// before the error is returned.
    pub fn acquire(&self) -> Result<ResourceLockGuard, LockError> {
        let interrupt = Interrupt::current();
        let entries = self.entries();
        let mut guard = ResourceLockGuard {
            held: Vec::with_capacity(entries.len()),
        };

        for entry in entries {
            let held = entry.acquire(&interrupt)?;
            tracing::trace!(resource = %entry.resource, "acquired");
            guard.held.push((entry.resource.clone(), held));
        }

        Ok(guard)
    }

    /// Acquires every underlying lock without blocking, or none of them.
    pub fn try_acquire(&self) -> Option<ResourceLockGuard> {
        let entries = self.entries();
        let mut guard = ResourceLockGuard {
            held: Vec::with_capacity(entries.len()),
        };

        for entry in entries {
            let held = entry.try_acquire()?;
            guard.held.push((entry.resource.clone(), held));
        }

        Some(guard)
    }
}

impl PartialEq for ResourceLock {
    fn eq(&self, other: &Self) -> bool {
        let ours = self.entries();
        let theirs = other.entries();
        ours.len() == theirs.len()
            && ours
                .iter()
                .zip(theirs)
                .all(|(a, b)| a.resource == b.resource)
    }
}

impl Eq for ResourceLock {}

impl Debug for ResourceLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ResourceLock::Nop => "Nop",
            ResourceLock::Single(_) => "Single",
            ResourceLock::Composite(_) => "Composite",
        };
        f.debug_tuple(kind).field(&self.resources()).finish()
    }
}

/// Proof that a [`ResourceLock`] is held. Dropping it releases the
/// underlying locks in reverse acquisition order.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct ResourceLockGuard {
    held: Vec<(ExclusiveResource, Held)>,
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        while let Some((resource, held)) = self.held.pop() {
            drop(held);
            tracing::trace!(resource = %resource, "released");
        }
    }
}
