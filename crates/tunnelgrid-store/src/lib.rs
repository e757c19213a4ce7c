//! tunnelgrid-store: in-memory topology of the tunnel mesh.
//!
//! Holds endpoint records and community membership, plus a reverse index
//! from endpoint name to the communities it belongs to. The index is
//! repaired incrementally on every community change so that peer lookups
//! stay a pair of map reads.
//!
//! # Architecture
//!
//! ```text
//! TopologyStore (cheaply cloneable handle)
//!   └── RwLock<Inner>
//!       ├── endpoints:               name → Endpoint
//!       ├── local_names:             endpoints owned by this instance
//!       ├── communities:             name → Community
//!       └── endpoint_to_communities: endpoint name → community names
//! ```

pub mod store;

pub use store::TopologyStore;
