//! Credential error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("wrong common name {found:?}, {expected:?} is expected")]
    WrongCommonName { expected: String, found: String },

    #[error("certificate is outside its validity window")]
    Expired,

    #[error("certificate lacks server and client auth usages")]
    MissingUsage,

    #[error("certificate is not signed by the CA: {0}")]
    BadSignature(String),
}

pub type CertResult<T> = Result<T, CertError>;
