//! Allocator error types.

use ipnet::IpNet;
use thiserror::Error;

/// Errors returned by the subnet allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpamError {
    #[error("invalid pool CIDR {0:?}")]
    InvalidPool(String),

    #[error("invalid subnet mask size /{requested} for pool {pool}")]
    InvalidMaskSize { pool: IpNet, requested: u8 },

    #[error("{block} is out of range of {pool}")]
    OutOfRange { block: IpNet, pool: IpNet },

    #[error("no subnet available in {pool}")]
    NoAvailableSubnet { pool: IpNet },
}

impl IpamError {
    /// Whether the pool is exhausted, as opposed to a caller mistake.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, IpamError::NoAvailableSubnet { .. })
    }
}

pub type IpamResult<T> = Result<T, IpamError>;
