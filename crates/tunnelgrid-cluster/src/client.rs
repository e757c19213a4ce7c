//! The collaborator trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tunnelgrid_core::Endpoint;

use crate::error::ClusterResult;
use crate::types::*;

/// Access to cluster state used by every controller.
///
/// Writes carrying a non-zero `meta.revision` fail with
/// [`crate::ClusterError::Conflict`] when the stored revision differs.
/// Deletes of absent artifacts fail with [`crate::ClusterError::NotFound`];
/// callers doing teardown treat that as success.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // ── Nodes ──────────────────────────────────────────────────────

    async fn get_node(&self, name: &str) -> ClusterResult<Node>;

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>>;

    /// Merge `annotations` into the node's annotations and return the node.
    async fn update_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> ClusterResult<Node>;

    fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent>;

    // ── Communities ────────────────────────────────────────────────

    async fn list_communities(&self) -> ClusterResult<Vec<CommunityObject>>;

    fn subscribe_communities(&self) -> broadcast::Receiver<CommunityEvent>;

    // ── Endpoints ──────────────────────────────────────────────────

    /// Endpoints published by other control planes or operators, such as a
    /// mediator. Locally built endpoints never come from here.
    async fn list_endpoints(&self) -> ClusterResult<Vec<Endpoint>>;

    // ── Configuration documents ────────────────────────────────────

    async fn get_config(&self, namespace: &str, name: &str) -> ClusterResult<ConfigDocument>;

    async fn create_config(&self, doc: ConfigDocument) -> ClusterResult<()>;

    async fn update_config(&self, doc: ConfigDocument) -> ClusterResult<()>;

    async fn delete_config(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    // ── Secrets ────────────────────────────────────────────────────

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Secret>;

    async fn create_secret(&self, secret: Secret) -> ClusterResult<()>;

    async fn update_secret(&self, secret: Secret) -> ClusterResult<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    // ── Workloads ──────────────────────────────────────────────────

    async fn get_workload(&self, namespace: &str, name: &str) -> ClusterResult<Workload>;

    async fn create_workload(&self, workload: Workload) -> ClusterResult<()>;

    async fn delete_workload(&self, namespace: &str, name: &str) -> ClusterResult<()>;
}
