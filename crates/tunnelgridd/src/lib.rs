//! tunnelgridd: the TunnelGrid control plane daemon.
//!
//! The binary is a thin CLI over [`control_plane::ControlPlane`], which
//! integration tests drive directly.

pub mod control_plane;
pub mod seed;

pub use control_plane::{ControlPlane, build_allocators, load_ca};
pub use seed::ClusterSeed;
