//! Tunnel configuration document.
//!
//! The document is what an agent or the connector reads to build its
//! tunnels: its own endpoint, the peers it should connect to, and an
//! optional mediator. It is serialized as YAML and written into a
//! configuration artifact under [`crate::constants::TUNNELS_FILE_NAME`].
//!
//! Peer order is part of the format: the gateway (connector) peer comes
//! first, every other peer follows sorted by name. Keeping the order
//! stable makes the serialized text a reliable change detector.

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::DocumentError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConf {
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mediator: Option<Endpoint>,
}

impl NetworkConf {
    /// Assemble a document with canonical peer ordering.
    ///
    /// `gateway`, when given, is always the first peer. `peers` are sorted
    /// by name; duplicates and entries named like the document's own
    /// endpoint or the gateway are dropped.
    pub fn build(
        endpoint: Endpoint,
        gateway: Option<Endpoint>,
        mut peers: Vec<Endpoint>,
        mediator: Option<Endpoint>,
    ) -> Self {
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers.dedup_by(|a, b| a.name == b.name);
        peers.retain(|p| {
            p.name != endpoint.name && gateway.as_ref().is_none_or(|g| g.name != p.name)
        });

        let mut ordered = Vec::with_capacity(peers.len() + 1);
        ordered.extend(gateway);
        ordered.extend(peers);

        Self {
            endpoint,
            peers: ordered,
            mediator,
        }
    }

    /// Serialize to the YAML text stored in configuration artifacts.
    pub fn to_yaml(&self) -> Result<String, DocumentError> {
        serde_yaml::to_string(self).map_err(|e| DocumentError::Encode(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Self, DocumentError> {
        serde_yaml::from_str(text).map_err(|e| DocumentError::Decode(e.to_string()))
    }

    /// Names of the peers in document order.
    pub fn peer_names(&self) -> Vec<&str> {
        self.peers.iter().map(|p| p.name.as_str()).collect()
    }
}
