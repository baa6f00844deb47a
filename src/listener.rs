use crate::collector::{ExecutionResult, Status};
use crate::node::Descriptor;

/// Receives the events of a run.
///
/// For every executed node `execution_started` comes before
/// `execution_finished`, skipped nodes only ever see `execution_skipped`.
/// Events of different nodes may arrive from different threads.
pub trait ExecutionListener: Send + Sync {
    fn dynamic_node_registered(&self, _node: &dyn Descriptor) {}

    fn execution_skipped(&self, _node: &dyn Descriptor, _reason: Option<&str>) {}

    fn execution_started(&self, _node: &dyn Descriptor) {}

    fn execution_finished(&self, _node: &dyn Descriptor, _result: &ExecutionResult) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ExecutionListener for NoopListener {}

/// Emits every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl ExecutionListener for LoggingListener {
    fn dynamic_node_registered(&self, node: &dyn Descriptor) {
        tracing::debug!(id = %node.unique_id(), name = node.display_name(), "registered");
    }

    fn execution_skipped(&self, node: &dyn Descriptor, reason: Option<&str>) {
        tracing::info!(
            id = %node.unique_id(),
            reason = reason.unwrap_or("<none>"),
            "skipped"
        );
    }

    fn execution_started(&self, node: &dyn Descriptor) {
        tracing::debug!(id = %node.unique_id(), name = node.display_name(), "started");
    }

    fn execution_finished(&self, node: &dyn Descriptor, result: &ExecutionResult) {
        let id = node.unique_id();
        match (result.status(), result.throwable()) {
            (Status::Successful, _) => tracing::info!(id = %id, "successful"),
            (Status::Aborted, cause) => match cause {
                Some(cause) => tracing::info!(id = %id, cause = %cause, "aborted"),
                None => tracing::info!(id = %id, "aborted"),
            },
            (Status::Failed, cause) => match cause {
                Some(cause) => tracing::error!(id = %id, cause = %cause, "failed"),
                None => tracing::error!(id = %id, "failed"),
            },
        }
    }
}
