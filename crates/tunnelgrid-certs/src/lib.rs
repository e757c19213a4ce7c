//! tunnelgrid-certs: endpoint credentials.
//!
//! Every endpoint gets a certificate whose common name is its endpoint name,
//! signed by the control plane's CA and usable for both server and client
//! authentication. [`CertManager`] is the seam the controllers use;
//! [`LocalCa`] implements it with an in-process CA.

pub mod error;
pub mod manager;
pub mod secret;

pub use error::{CertError, CertResult};
pub use manager::{CertKeyPair, CertManager, CertRequest, LocalCa};
pub use secret::{KEY_CA_CERT, KEY_TLS_CERT, KEY_TLS_KEY, build_tls_secret, cert_pem};
