//! Handler error types.

use thiserror::Error;

/// Errors a handler can stop the chain with.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Cluster state is not settled yet; try the same node again shortly.
    #[error("request must be requeued")]
    Requeue,

    #[error("endpoint {0} is not in the topology store")]
    MissingEndpoint(String),

    #[error("subnet allocation failed: {0}")]
    Ipam(#[from] tunnelgrid_ipam::IpamError),

    #[error("cluster error: {0}")]
    Cluster(#[from] tunnelgrid_cluster::ClusterError),

    #[error("credential error: {0}")]
    Cert(#[from] tunnelgrid_certs::CertError),

    #[error("tunnel document error: {0}")]
    Document(#[from] tunnelgrid_core::DocumentError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn is_requeue(&self) -> bool {
        matches!(self, HandlerError::Requeue)
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
