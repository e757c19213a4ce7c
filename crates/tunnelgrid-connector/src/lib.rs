//! tunnelgrid-connector: the cloud side of the tunnel mesh.
//!
//! [`ConnectorLoop`] owns the gateway endpoint that stands for every
//! non-edge node. It keeps that endpoint current as nodes come and go,
//! and on a fixed interval republishes it, rewrites the connector tunnel
//! document, and renews the connector credential. The interval pass
//! repairs anything a missed event or an outside edit left behind.

pub mod connector;
pub mod error;

pub use connector::{ConnectorLoop, ConnectorSettings, TickReport};
pub use error::{ConnectorError, ConnectorResult};
