use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static CURRENT: RefCell<Interrupt> = RefCell::new(Interrupt::default());
}

/// A per-thread interruption flag.
///
/// Blocking operations of the engine (lock acquisition, waiting for an
/// isolated thread) poll the flag of the thread they run on and give up once
/// it is raised. Another thread interrupts a thread by keeping a clone of its
/// flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// The flag of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lowers the flag, returning whether it was raised.
    pub fn clear(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    /// Makes this flag the one of the calling thread.
    pub(crate) fn install(self) {
        CURRENT.with(|current| *current.borrow_mut() = self);
    }
}
