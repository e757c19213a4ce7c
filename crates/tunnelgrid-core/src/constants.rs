//! Well-known names, label keys, and annotation keys.

/// Annotation holding the comma-separated pod subnets allocated to a node.
pub const KEY_POD_SUBNETS: &str = "tunnelgrid.io/subnets";

/// Annotation holding a node's comma-separated public addresses.
pub const KEY_NODE_PUBLIC_ADDRESSES: &str = "tunnelgrid.io/node-public-addresses";

pub const KEY_APP: &str = "tunnelgrid.io/app";
pub const KEY_CREATED_BY: &str = "tunnelgrid.io/created-by";
pub const KEY_NODE: &str = "tunnelgrid.io/node";
pub const KEY_SPEC_HASH: &str = "tunnelgrid.io/spec-hash";

pub const APP_AGENT: &str = "tunnelgrid-agent";
pub const APP_OPERATOR: &str = "tunnelgrid-operator";

/// Key of the tunnel document inside a configuration artifact.
pub const TUNNELS_FILE_NAME: &str = "tunnels.yaml";

/// Name under which a mediator endpoint is registered in the topology store.
pub const DEFAULT_MEDIATOR_NAME: &str = "mediator";

/// Label that marks a node as an edge node unless configured otherwise.
pub const DEFAULT_EDGE_LABEL: &str = "node-role.kubernetes.io/edge";
