//! tunnelgrid-community: keeps the topology store's communities and
//! externally published endpoints in step with the cluster.

pub mod controller;
pub mod endpoints;

pub use controller::{CommunityController, MembershipListener};
pub use endpoints::EndpointLoader;
