//! Objects exchanged with the cluster-state collaborator.
//!
//! Nodes and community objects are read-only inputs. Configuration
//! documents, secrets, and workloads are generated artifacts, each optionally
//! owned by a node so they disappear together with it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of a node in the cluster.
pub type NodeName = String;

// ── Nodes ─────────────────────────────────────────────────────────

/// A cluster node as observed by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub name: NodeName,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Host addresses reachable inside the cluster.
    pub internal_ips: Vec<String>,
    /// Pod CIDRs the node reports for itself.
    pub pod_cidrs: Vec<String>,
    /// Set once deletion has started.
    pub deleting: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_internal_ip(mut self, ip: impl Into<String>) -> Self {
        self.internal_ips.push(ip.into());
        self
    }

    pub fn with_pod_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.pod_cidrs.push(cidr.into());
        self
    }

    /// Whether the node carries every `(key, value)` of `selector`.
    /// An empty selector value matches any value of that key.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.iter().all(|(k, v)| match self.labels.get(k) {
            Some(actual) => v.is_empty() || actual == v,
            None => false,
        })
    }
}

/// Change notification for nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node was created or updated; carries the new state.
    Upsert(Node),
    /// The node no longer exists.
    Deleted(NodeName),
}

impl NodeEvent {
    pub fn node_name(&self) -> &str {
        match self {
            NodeEvent::Upsert(node) => &node.name,
            NodeEvent::Deleted(name) => name,
        }
    }
}

// ── Communities ───────────────────────────────────────────────────

/// A community object as stored in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityObject {
    pub name: String,
    /// Endpoint names.
    pub members: Vec<String>,
    pub deleting: bool,
}

/// Change notification for community objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommunityEvent {
    Upsert(CommunityObject),
    Deleted(String),
}

// ── Artifacts ─────────────────────────────────────────────────────

/// The node an artifact belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub node: NodeName,
}

/// Metadata shared by every generated artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    /// Set once deletion has started but not finished.
    pub terminating: bool,
    /// Bumped by the backend on every write.
    pub revision: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn owned_by(mut self, node: impl Into<String>) -> Self {
        self.owner = Some(OwnerReference { node: node.into() });
        self
    }

    /// Storage key: "namespace/name".
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Anything the backend stores with an [`ObjectMeta`].
pub trait Artifact: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// A configuration document: named text files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub meta: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

/// A credential secret. Values are PEM text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub meta: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

/// An ephemeral workload pinned to one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub meta: ObjectMeta,
    pub spec: WorkloadSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub node_name: NodeName,
    pub host_network: bool,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub privileged: bool,
    /// (volume name, mount path)
    pub mounts: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VolumeSource {
    Config(String),
    Secret(String),
    HostPath(String),
    EmptyDir,
}

macro_rules! impl_artifact {
    ($ty:ty, $kind:literal) => {
        impl Artifact for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

impl_artifact!(ConfigDocument, "config");
impl_artifact!(Secret, "secret");
impl_artifact!(Workload, "workload");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_matching() {
        let node = Node::new("edge1")
            .with_label("node-role.kubernetes.io/edge", "")
            .with_label("zone", "east");

        let any_edge = BTreeMap::from([("node-role.kubernetes.io/edge".to_string(), String::new())]);
        assert!(node.matches_labels(&any_edge));

        let east = BTreeMap::from([("zone".to_string(), "east".to_string())]);
        assert!(node.matches_labels(&east));

        let west = BTreeMap::from([("zone".to_string(), "west".to_string())]);
        assert!(!node.matches_labels(&west));

        assert!(!Node::new("cloud1").matches_labels(&any_edge));
    }

    #[test]
    fn meta_key_and_owner() {
        let meta = ObjectMeta::new("tunnelgrid", "agent-config-edge1").owned_by("edge1");
        assert_eq!(meta.key(), "tunnelgrid/agent-config-edge1");
        assert_eq!(meta.owner, Some(OwnerReference { node: "edge1".to_string() }));
    }
}
