//! CA-backed certificate signing and verification.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::error::{CertError, CertResult};

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// What to put into an endpoint certificate.
#[derive(Debug, Clone)]
pub struct CertRequest {
    pub common_name: String,
    pub organization: String,
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
    pub validity_days: u32,
}

/// Signs and verifies endpoint certificates.
pub trait CertManager: Send + Sync {
    /// Issue a server+client certificate for `request`.
    fn sign(&self, request: &CertRequest) -> CertResult<CertKeyPair>;

    /// The CA certificate, PEM-encoded.
    fn ca_cert_pem(&self) -> &str;

    /// Check that `cert_pem` parses, names `expected_cn`, is currently
    /// valid, carries server and client auth usages, and was signed by the CA.
    fn verify(&self, cert_pem: &str, expected_cn: &str) -> CertResult<()>;
}

/// An in-process certificate authority.
pub struct LocalCa {
    key: KeyPair,
    cert: Certificate,
    cert_pem: String,
    cert_der: Vec<u8>,
}

impl LocalCa {
    /// Generate a self-signed CA valid for ten years.
    pub fn generate(organization: &str) -> CertResult<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, organization);
        dn.push(DnType::CommonName, format!("{organization} CA"));
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + Duration::days(3650);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        info!(%organization, "generated CA certificate");
        Ok(Self::from_parts(key, cert))
    }

    /// Load an existing CA from its PEM certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> CertResult<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        // Re-signing with the same key and subject yields an equivalent issuer.
        let cert = params.self_signed(&key)?;

        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).map_err(parse_err)?;
        debug!("loaded CA certificate");
        Ok(Self {
            key,
            cert,
            cert_pem: cert_pem.to_string(),
            cert_der: pem.contents,
        })
    }

    /// The CA key, PEM-encoded.
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    fn from_parts(key: KeyPair, cert: Certificate) -> Self {
        Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key,
            cert,
        }
    }

    fn sign_between(
        &self,
        request: &CertRequest,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> CertResult<CertKeyPair> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, request.organization.as_str());
        dn.push(DnType::CommonName, request.common_name.as_str());
        params.distinguished_name = dn;

        for name in &request.dns_names {
            params
                .subject_alt_names
                .push(SanType::DnsName(name.clone().try_into()?));
        }
        for ip in &request.ips {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = not_before;
        params.not_after = not_after;
        let sans = params.subject_alt_names.len();

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        info!(common_name = %request.common_name, sans, "signed endpoint certificate");

        Ok(CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

impl CertManager for LocalCa {
    fn sign(&self, request: &CertRequest) -> CertResult<CertKeyPair> {
        let now = OffsetDateTime::now_utc();
        self.sign_between(
            request,
            now - Duration::minutes(5),
            now + Duration::days(i64::from(request.validity_days)),
        )
    }

    fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn verify(&self, cert_pem: &str, expected_cn: &str) -> CertResult<()> {
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).map_err(parse_err)?;
        let cert = pem.parse_x509().map_err(parse_err)?;

        let found = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default();
        if found != expected_cn {
            return Err(CertError::WrongCommonName {
                expected: expected_cn.to_string(),
                found: found.to_string(),
            });
        }

        if !cert.validity().is_valid() {
            return Err(CertError::Expired);
        }

        let usages = cert.extended_key_usage().map_err(parse_err)?;
        match usages {
            Some(eku) if eku.value.server_auth && eku.value.client_auth => {}
            _ => return Err(CertError::MissingUsage),
        }

        let (_, ca) = X509Certificate::from_der(&self.cert_der).map_err(parse_err)?;
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|e| CertError::BadSignature(e.to_string()))
    }
}

fn parse_err(e: impl std::fmt::Display) -> CertError {
    CertError::Parse(e.to_string())
}
