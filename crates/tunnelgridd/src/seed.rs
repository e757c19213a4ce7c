//! Cluster seed files for standalone mode.
//!
//! ```yaml
//! nodes:
//!   - name: edge1
//!     labels: { node-role.kubernetes.io/edge: "" }
//!     internal_ips: [10.20.40.181]
//! communities:
//!   - name: team-a
//!     members: [beijing.edge1, beijing.edge2]
//! endpoints:
//!   - name: mediator
//!     type: Mediator
//!     publicAddresses: [mediator.example.com]
//!     subnets: [10.10.0.0/24]
//!     nodeSubnets: [10.10.0.1]
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use tunnelgrid_cluster::{CommunityObject, MemoryCluster, Node};
use tunnelgrid_core::Endpoint;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSeed {
    pub nodes: Vec<Node>,
    pub communities: Vec<CommunityObject>,
    /// Endpoints published outside this control plane.
    pub endpoints: Vec<Endpoint>,
}

impl ClusterSeed {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read seed file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parse seed file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load everything into `cluster`, announcing each object.
    pub fn apply(self, cluster: &MemoryCluster) {
        for node in self.nodes {
            cluster.apply_node(node);
        }
        for community in self.communities {
            cluster.apply_community(community);
        }
        for endpoint in self.endpoints {
            cluster.apply_endpoint(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"
nodes:
  - name: edge1
    labels: { node-role.kubernetes.io/edge: "" }
    internal_ips: [10.20.40.181]
  - name: master1
    internal_ips: [192.168.1.2]
    pod_cidrs: [10.233.1.0/24]
communities:
  - name: team-a
    members: [beijing.edge1, beijing.edge2]
endpoints:
  - name: mediator
    type: Mediator
    publicAddresses: [mediator.example.com]
    subnets: [10.10.0.0/24]
    nodeSubnets: [10.10.0.1]
"#;

    #[tokio::test]
    async fn seed_populates_cluster() {
        let seed = ClusterSeed::from_yaml(SEED).unwrap();
        assert_eq!(seed.nodes.len(), 2);
        assert!(!seed.nodes[0].deleting);

        let cluster = MemoryCluster::new();
        seed.apply(&cluster);

        use tunnelgrid_cluster::ClusterClient;
        let nodes = cluster.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        let communities = cluster.list_communities().await.unwrap();
        assert_eq!(communities[0].members, vec!["beijing.edge1", "beijing.edge2"]);
        let endpoints = cluster.list_endpoints().await.unwrap();
        assert_eq!(endpoints[0].endpoint_type, tunnelgrid_core::EndpointType::Mediator);
        assert!(endpoints[0].is_valid());
    }

    #[test]
    fn empty_seed_is_valid() {
        let seed = ClusterSeed::from_yaml("{}").unwrap();
        assert!(seed.nodes.is_empty() && seed.communities.is_empty() && seed.endpoints.is_empty());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = ClusterSeed::from_file(Path::new("/nonexistent/seed.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/seed.yaml"));
    }
}
