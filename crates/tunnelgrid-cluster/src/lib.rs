//! tunnelgrid-cluster: the cluster-state collaborator.
//!
//! The control plane never talks to a cluster API directly; it goes through
//! [`ClusterClient`], which exposes nodes, community objects, externally
//! published endpoints, node annotations, and CRUD over the three kinds of
//! generated artifacts (configuration documents, credential secrets,
//! workloads).
//!
//! [`MemoryCluster`] is a complete in-process implementation. It backs the
//! daemon's standalone mode and every test in the workspace.
//!
//! # Architecture
//!
//! ```text
//! ClusterClient (async trait)
//!   └── MemoryCluster
//!       ├── nodes / communities        (emit NodeEvent / CommunityEvent)
//!       ├── endpoints                  (listed on demand)
//!       ├── configs / secrets / workloads keyed by "namespace/name"
//!       └── owner GC                   (node delete drops owned artifacts)
//! ```

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use client::ClusterClient;
pub use error::{ClusterError, ClusterResult};
pub use memory::{MemoryCluster, Operation};
pub use types::*;
