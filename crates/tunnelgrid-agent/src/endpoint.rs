//! Endpoint construction from node state.

use tunnelgrid_cluster::Node;
use tunnelgrid_core::constants::{KEY_NODE_PUBLIC_ADDRESSES, KEY_POD_SUBNETS};
use tunnelgrid_core::{Endpoint, EndpointType, OperatorConfig};

/// Where an edge endpoint's subnets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetSource {
    /// The allocation annotation written by the subnet handler.
    Annotation,
    /// The pod CIDRs the node reports itself.
    PodCidrs,
}

/// Builds edge endpoints and endpoint names for nodes.
#[derive(Debug, Clone)]
pub struct EndpointFactory {
    cluster_name: String,
    id_format: String,
    subnet_source: SubnetSource,
}

impl EndpointFactory {
    pub fn new(
        cluster_name: impl Into<String>,
        id_format: impl Into<String>,
        subnet_source: SubnetSource,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            id_format: id_format.into(),
            subnet_source,
        }
    }

    pub fn from_config(config: &OperatorConfig) -> Self {
        let source = if config.edge.allocate_pod_cidrs {
            SubnetSource::Annotation
        } else {
            SubnetSource::PodCidrs
        };
        Self::new(&config.cluster_name, &config.edge.endpoint_id_format, source)
    }

    /// "<cluster_name>.<node_name>"
    pub fn endpoint_name(&self, node_name: &str) -> String {
        format!("{}.{}", self.cluster_name, node_name)
    }

    pub fn endpoint_id(&self, endpoint_name: &str) -> String {
        self.id_format.replace("{node}", endpoint_name)
    }

    pub fn new_endpoint(&self, node: &Node) -> Endpoint {
        let name = self.endpoint_name(&node.name);

        let public_addresses = match node.annotations.get(KEY_NODE_PUBLIC_ADDRESSES) {
            Some(value) if !split_list(value).is_empty() => split_list(value),
            _ => node.internal_ips.clone(),
        };

        let subnets = match self.subnet_source {
            SubnetSource::Annotation => node
                .annotations
                .get(KEY_POD_SUBNETS)
                .map(|v| split_list(v))
                .unwrap_or_default(),
            SubnetSource::PodCidrs => node.pod_cidrs.clone(),
        };

        Endpoint {
            id: self.endpoint_id(&name),
            name,
            public_addresses,
            subnets,
            node_subnets: node.internal_ips.clone(),
            endpoint_type: EndpointType::EdgeNode,
        }
    }
}

/// Split a comma-separated annotation value, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
