use std::cell::RefCell;
use std::sync::Arc;

use crate::error::PoolError;

thread_local! {
    static COMPENSATOR: RefCell<Option<Arc<dyn Compensator>>> = const { RefCell::new(None) };
}

/// Installed by a worker pool on its threads. It is told when a worker is
/// about to block so that the pool can admit another worker and keep its
/// effective parallelism.
pub trait Compensator: Send + Sync {
    /// Called before the current thread blocks. An error means the pool
    /// refuses to let the thread block.
    fn begin_blocking(&self) -> Result<(), PoolError>;

    /// Called once the thread is runnable again.
    fn end_blocking(&self);
}

/// Sets the compensator of the calling thread, returning the previous one.
pub(crate) fn install(compensator: Option<Arc<dyn Compensator>>) -> Option<Arc<dyn Compensator>> {
    COMPENSATOR.with(|current| current.replace(compensator))
}

struct EndBlocking(Arc<dyn Compensator>);

impl Drop for EndBlocking {
    fn drop(&mut self) {
        self.0.end_blocking();
    }
}

/// Runs a blocking operation. On a pool thread the pool is notified around
/// it, anywhere else this is a plain call.
pub fn managed_block<T>(block: impl FnOnce() -> T) -> Result<T, PoolError> {
    match COMPENSATOR.with(|current| current.borrow().clone()) {
        Some(compensator) => {
            compensator.begin_blocking()?;
            let _end = EndBlocking(compensator);
            Ok(block())
        }
        None => Ok(block()),
    }
}
