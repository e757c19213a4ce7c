//! tunnelgrid-agent: per-node reconciliation for edge nodes.
//!
//! Every edge node is driven through an ordered chain of [`Handler`]s by
//! the [`AgentEngine`]. Each handler converges one concern of the node
//! (subnets, tunnel document, credential, agent workload) and knows how
//! to undo it again when the node leaves.
//!
//! # Architecture
//!
//! ```text
//! NodeEvent ──► AgentEngine::dispatch ──► reconcile(node)
//!                                           ├── converge: subnet → config → cert → workload
//!                                           └── teardown: workload → cert → config → subnet
//! ```
//!
//! A handler returning [`Step::RestartRequired`] does not stop the chain;
//! the flag is carried in [`ChainContext`] so the workload handler can
//! recreate the agent.

pub mod endpoint;
pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod names;

pub use endpoint::{EndpointFactory, SubnetSource};
pub use engine::{AgentEngine, ChainOutcome, ConvergeReport, Reconciled};
pub use error::{HandlerError, HandlerResult};
pub use handler::{ChainContext, Handler, Step};
pub use handlers::{
    AgentTemplate, CertHandler, ConfigHandler, RawSubnetHandler, SubnetHandler, WorkloadHandler,
};
