//! The handlers that make up an edge node's chain, in chain order:
//! subnet, config, cert, workload.

mod cert;
mod config;
mod subnet;
mod workload;

pub use cert::CertHandler;
pub use config::ConfigHandler;
pub use subnet::{RawSubnetHandler, SubnetHandler};
pub use workload::{AgentTemplate, WorkloadHandler, spec_hash};
