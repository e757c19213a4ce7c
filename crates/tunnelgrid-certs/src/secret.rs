//! TLS secret layout.

use std::collections::BTreeMap;

use tunnelgrid_cluster::{ObjectMeta, Secret};

use crate::manager::CertKeyPair;

pub const KEY_CA_CERT: &str = "ca.crt";
pub const KEY_TLS_CERT: &str = "tls.crt";
pub const KEY_TLS_KEY: &str = "tls.key";

/// A secret holding an endpoint certificate, its key, and the CA certificate.
pub fn build_tls_secret(meta: ObjectMeta, pair: &CertKeyPair, ca_cert_pem: &str) -> Secret {
    Secret {
        meta,
        data: BTreeMap::from([
            (KEY_CA_CERT.to_string(), ca_cert_pem.to_string()),
            (KEY_TLS_CERT.to_string(), pair.cert_pem.clone()),
            (KEY_TLS_KEY.to_string(), pair.key_pem.clone()),
        ]),
    }
}

/// The endpoint certificate stored in `secret`, if any.
pub fn cert_pem(secret: &Secret) -> Option<&str> {
    secret.data.get(KEY_TLS_CERT).map(String::as_str)
}
