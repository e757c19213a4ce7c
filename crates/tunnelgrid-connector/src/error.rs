//! Connector error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("cluster error: {0}")]
    Cluster(#[from] tunnelgrid_cluster::ClusterError),

    #[error("credential error: {0}")]
    Cert(#[from] tunnelgrid_certs::CertError),

    #[error("tunnel document error: {0}")]
    Document(#[from] tunnelgrid_core::DocumentError),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
