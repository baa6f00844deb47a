use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Requests that a run stops starting new nodes.
///
/// Nodes that are already running are not interrupted, every node that has
/// not passed its skip check yet is reported as skipped instead.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_observe_cancellation() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancellation_requested());
        token.cancel();
        assert!(clone.is_cancellation_requested());
    }
}
