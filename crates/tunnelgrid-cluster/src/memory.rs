//! MemoryCluster: in-process cluster state.
//!
//! Behaves like a real backend for everything the controllers rely on:
//! not-found and already-exists errors, revision conflicts, change events,
//! and garbage collection of artifacts owned by a deleted node. Tests can
//! also make the next call of a given [`Operation`] fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tunnelgrid_core::Endpoint;

use crate::client::ClusterClient;
use crate::error::{ClusterError, ClusterResult};
use crate::types::*;

const EVENT_CAPACITY: usize = 1024;

/// Backend calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetNode,
    ListEndpoints,
    UpdateNodeAnnotations,
    GetConfig,
    CreateConfig,
    UpdateConfig,
    DeleteConfig,
    GetSecret,
    CreateSecret,
    UpdateSecret,
    DeleteSecret,
    GetWorkload,
    CreateWorkload,
    DeleteWorkload,
}

/// Artifacts of one kind, keyed by "namespace/name".
struct Table<T> {
    items: BTreeMap<String, T>,
}

impl<T: Artifact> Table<T> {
    fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    fn get(&self, namespace: &str, name: &str) -> ClusterResult<T> {
        let key = object_key(namespace, name);
        self.items
            .get(&key)
            .cloned()
            .ok_or(ClusterError::NotFound { kind: T::KIND, key })
    }

    fn create(&mut self, mut item: T, revision: u64) -> ClusterResult<()> {
        let key = item.meta().key();
        if self.items.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: T::KIND, key });
        }
        let meta = item.meta_mut();
        meta.revision = revision;
        meta.terminating = false;
        self.items.insert(key, item);
        Ok(())
    }

    fn update(&mut self, mut item: T, revision: u64) -> ClusterResult<()> {
        let key = item.meta().key();
        let Some(stored) = self.items.get(&key) else {
            return Err(ClusterError::NotFound { kind: T::KIND, key });
        };
        let expected = item.meta().revision;
        if expected != 0 && expected != stored.meta().revision {
            return Err(ClusterError::Conflict { kind: T::KIND, key });
        }
        item.meta_mut().revision = revision;
        self.items.insert(key, item);
        Ok(())
    }

    fn delete(&mut self, namespace: &str, name: &str) -> ClusterResult<()> {
        let key = object_key(namespace, name);
        match self.items.remove(&key) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound { kind: T::KIND, key }),
        }
    }

    fn remove_owned_by(&mut self, node: &str) -> usize {
        let before = self.items.len();
        self.items
            .retain(|_, item| item.meta().owner.as_ref().is_none_or(|o| o.node != node));
        before - self.items.len()
    }

    fn list(&self) -> Vec<T> {
        self.items.values().cloned().collect()
    }
}

struct State {
    nodes: BTreeMap<NodeName, Node>,
    communities: BTreeMap<String, CommunityObject>,
    endpoints: BTreeMap<String, Endpoint>,
    configs: Table<ConfigDocument>,
    secrets: Table<Secret>,
    workloads: Table<Workload>,
    revision: u64,
    failures: HashMap<Operation, u32>,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn check(&mut self, op: Operation) -> ClusterResult<()> {
        match self.failures.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(ClusterError::Backend(format!("injected failure for {op:?}")))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory [`ClusterClient`]. Clones share the same state.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
    node_tx: broadcast::Sender<NodeEvent>,
    community_tx: broadcast::Sender<CommunityEvent>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (node_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (community_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State {
                nodes: BTreeMap::new(),
                communities: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                configs: Table::new(),
                secrets: Table::new(),
                workloads: Table::new(),
                revision: 0,
                failures: HashMap::new(),
            })),
            node_tx,
            community_tx,
        }
    }

    // ── Cluster-side mutations ─────────────────────────────────────

    /// Create or replace a node and announce it.
    pub fn apply_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.name.clone(), node.clone());
        debug!(node = %node.name, "node applied");
        let _ = self.node_tx.send(NodeEvent::Upsert(node));
    }

    /// Flag a node as being deleted and announce the change.
    pub fn mark_node_deleting(&self, name: &str) -> ClusterResult<()> {
        let node = {
            let mut state = self.state.lock();
            let node = state.nodes.get_mut(name).ok_or_else(|| node_not_found(name))?;
            node.deleting = true;
            node.clone()
        };
        let _ = self.node_tx.send(NodeEvent::Upsert(node));
        Ok(())
    }

    /// Remove a node, collect every artifact it owns, and announce the deletion.
    pub fn delete_node(&self, name: &str) -> ClusterResult<()> {
        let collected = {
            let mut state = self.state.lock();
            state.nodes.remove(name).ok_or_else(|| node_not_found(name))?;
            state.configs.remove_owned_by(name)
                + state.secrets.remove_owned_by(name)
                + state.workloads.remove_owned_by(name)
        };
        debug!(node = %name, collected, "node deleted");
        let _ = self.node_tx.send(NodeEvent::Deleted(name.to_string()));
        Ok(())
    }

    pub fn apply_community(&self, community: CommunityObject) {
        self.state
            .lock()
            .communities
            .insert(community.name.clone(), community.clone());
        let _ = self.community_tx.send(CommunityEvent::Upsert(community));
    }

    pub fn delete_community(&self, name: &str) {
        if self.state.lock().communities.remove(name).is_some() {
            let _ = self.community_tx.send(CommunityEvent::Deleted(name.to_string()));
        }
    }

    /// Publish or replace an external endpoint.
    pub fn apply_endpoint(&self, endpoint: Endpoint) {
        debug!(endpoint = %endpoint.name, "endpoint applied");
        self.state.lock().endpoints.insert(endpoint.name.clone(), endpoint);
    }

    pub fn delete_endpoint(&self, name: &str) -> bool {
        self.state.lock().endpoints.remove(name).is_some()
    }

    /// Put a workload into the terminating state without removing it.
    pub fn mark_workload_terminating(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        let key = object_key(namespace, name);
        let workload = state
            .workloads
            .items
            .get_mut(&key)
            .ok_or(ClusterError::NotFound { kind: Workload::KIND, key })?;
        workload.meta.terminating = true;
        Ok(())
    }

    /// Make the next `times` calls of `op` fail with a backend error.
    pub fn fail_next(&self, op: Operation, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn configs(&self) -> Vec<ConfigDocument> {
        self.state.lock().configs.list()
    }

    pub fn secrets(&self) -> Vec<Secret> {
        self.state.lock().secrets.list()
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.state.lock().workloads.list()
    }
}

fn node_not_found(name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: "node",
        key: name.to_string(),
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get_node(&self, name: &str) -> ClusterResult<Node> {
        let mut state = self.state.lock();
        state.check(Operation::GetNode)?;
        state.nodes.get(name).cloned().ok_or_else(|| node_not_found(name))
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        Ok(self.state.lock().nodes.values().cloned().collect())
    }

    async fn update_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> ClusterResult<Node> {
        let mut state = self.state.lock();
        state.check(Operation::UpdateNodeAnnotations)?;
        let node = state.nodes.get_mut(name).ok_or_else(|| node_not_found(name))?;
        node.annotations.extend(annotations);
        Ok(node.clone())
    }

    fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_tx.subscribe()
    }

    async fn list_communities(&self) -> ClusterResult<Vec<CommunityObject>> {
        Ok(self.state.lock().communities.values().cloned().collect())
    }

    fn subscribe_communities(&self) -> broadcast::Receiver<CommunityEvent> {
        self.community_tx.subscribe()
    }

    async fn list_endpoints(&self) -> ClusterResult<Vec<Endpoint>> {
        let mut state = self.state.lock();
        state.check(Operation::ListEndpoints)?;
        Ok(state.endpoints.values().cloned().collect())
    }

    async fn get_config(&self, namespace: &str, name: &str) -> ClusterResult<ConfigDocument> {
        let mut state = self.state.lock();
        state.check(Operation::GetConfig)?;
        state.configs.get(namespace, name)
    }

    async fn create_config(&self, doc: ConfigDocument) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::CreateConfig)?;
        let revision = state.next_revision();
        state.configs.create(doc, revision)
    }

    async fn update_config(&self, doc: ConfigDocument) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::UpdateConfig)?;
        let revision = state.next_revision();
        state.configs.update(doc, revision)
    }

    async fn delete_config(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::DeleteConfig)?;
        state.configs.delete(namespace, name)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Secret> {
        let mut state = self.state.lock();
        state.check(Operation::GetSecret)?;
        state.secrets.get(namespace, name)
    }

    async fn create_secret(&self, secret: Secret) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::CreateSecret)?;
        let revision = state.next_revision();
        state.secrets.create(secret, revision)
    }

    async fn update_secret(&self, secret: Secret) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::UpdateSecret)?;
        let revision = state.next_revision();
        state.secrets.update(secret, revision)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::DeleteSecret)?;
        state.secrets.delete(namespace, name)
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> ClusterResult<Workload> {
        let mut state = self.state.lock();
        state.check(Operation::GetWorkload)?;
        state.workloads.get(namespace, name)
    }

    async fn create_workload(&self, workload: Workload) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::CreateWorkload)?;
        let revision = state.next_revision();
        state.workloads.create(workload, revision)
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.check(Operation::DeleteWorkload)?;
        state.workloads.delete(namespace, name)
    }
}
