//! Error types for the core model.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the operator configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while encoding or decoding a tunnel document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to encode tunnel document: {0}")]
    Encode(String),

    #[error("failed to decode tunnel document: {0}")]
    Decode(String),
}

/// Reasons an endpoint fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidEndpoint {
    #[error("endpoint name is empty")]
    EmptyName,

    #[error("endpoint has no public addresses")]
    NoPublicAddresses,

    #[error("endpoint has no subnets")]
    NoSubnets,

    #[error("endpoint has no node subnets")]
    NoNodeSubnets,

    #[error("invalid public address: {0}")]
    PublicAddress(String),

    #[error("invalid subnet: {0}")]
    Subnet(String),

    #[error("invalid node subnet: {0}")]
    NodeSubnet(String),
}
