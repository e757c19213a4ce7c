//! The handler protocol.

use async_trait::async_trait;

use tunnelgrid_cluster::Node;

use crate::error::HandlerResult;

/// Successful result of one convergence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Done,
    /// Converged, but a dependent workload must be recreated.
    RestartRequired,
}

/// State threaded through one run of the chain.
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    /// Set once any earlier handler returned [`Step::RestartRequired`].
    pub restart_required: bool,
    /// Set by a handler that needs the node reconciled again shortly.
    pub requeue: bool,
}

/// One idempotent convergence step for a node.
///
/// Handlers own whatever state they need to undo their own work; `undo`
/// on a node the handler never touched succeeds.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn converge(&self, node: &Node, ctx: &mut ChainContext) -> HandlerResult<Step>;

    async fn undo(&self, node_name: &str) -> HandlerResult<()>;
}
