//! Endpoint and community model.
//!
//! An [`Endpoint`] describes one participant of the tunnel mesh. A
//! [`Community`] names a group of endpoints that should be able to reach
//! each other. Both are plain values; ownership of the live copies sits
//! with the topology store.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::InvalidEndpoint;

/// Returns the current snapshot of an endpoint owned by another component.
pub type EndpointGetter = Arc<dyn Fn() -> Endpoint + Send + Sync>;

/// Role of an endpoint inside the mesh.
///
/// The role only changes how peers interpret an endpoint; allocation and
/// storage treat all roles alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    #[default]
    EdgeNode,
    Connector,
    Mediator,
}

/// A mesh participant with the addresses needed to dial it and the
/// subnets routed through it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Certificate-subject-like identifier, e.g. `C=CN, O=tunnelgrid, CN=edge1`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Unique key of the endpoint.
    pub name: String,
    /// Addresses (IPs or DNS names) peers dial to open a tunnel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_addresses: Vec<String>,
    /// Workload CIDR blocks routed through this endpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
    /// Host-level addresses of the node(s) behind this endpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_subnets: Vec<String>,
    #[serde(rename = "type", default)]
    pub endpoint_type: EndpointType,
}

impl Endpoint {
    /// Check every invariant of a usable endpoint, reporting the first violation.
    pub fn validate(&self) -> Result<(), InvalidEndpoint> {
        if self.name.is_empty() {
            return Err(InvalidEndpoint::EmptyName);
        }
        if self.public_addresses.is_empty() {
            return Err(InvalidEndpoint::NoPublicAddresses);
        }
        if self.subnets.is_empty() {
            return Err(InvalidEndpoint::NoSubnets);
        }
        if self.node_subnets.is_empty() {
            return Err(InvalidEndpoint::NoNodeSubnets);
        }

        if let Some(bad) = self
            .public_addresses
            .iter()
            .find(|a| a.parse::<IpAddr>().is_err() && !is_dns_name(a))
        {
            return Err(InvalidEndpoint::PublicAddress(bad.clone()));
        }

        if let Some(bad) = self.subnets.iter().find(|s| s.parse::<IpNet>().is_err()) {
            return Err(InvalidEndpoint::Subnet(bad.clone()));
        }

        // Node subnets are usually bare host IPs, but CIDRs are accepted too.
        if let Some(bad) = self
            .node_subnets
            .iter()
            .find(|s| s.parse::<IpAddr>().is_err() && s.parse::<IpNet>().is_err())
        {
            return Err(InvalidEndpoint::NodeSubnet(bad.clone()));
        }

        Ok(())
    }

    /// Whether this endpoint satisfies [`Endpoint::validate`].
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// A named set of endpoint names.
///
/// Equality of membership is by set contents, so two communities listing
/// the same members in a different order are identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub name: String,
    pub members: BTreeSet<String>,
}

impl Community {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.members.contains(endpoint)
    }
}

/// Loose RFC 1123 hostname check used for public addresses.
pub fn is_dns_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }

    s.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
