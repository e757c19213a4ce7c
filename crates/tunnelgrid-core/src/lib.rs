//! tunnelgrid-core: shared model for the TunnelGrid control plane.
//!
//! Holds the types every other crate agrees on:
//!
//! - [`Endpoint`]: a mesh participant (edge node, connector, mediator)
//! - [`Community`]: a named set of endpoints that may reach each other
//! - [`NetworkConf`]: the tunnel configuration document handed to agents
//!   and to the connector
//! - [`OperatorConfig`]: the daemon's TOML configuration

pub mod config;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod netconf;

pub use config::OperatorConfig;
pub use endpoint::{Community, Endpoint, EndpointGetter, EndpointType};
pub use error::{ConfigError, ConfigResult, DocumentError, InvalidEndpoint};
pub use netconf::NetworkConf;
