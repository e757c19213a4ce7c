//! Agent credential handler.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use tunnelgrid_certs::{build_tls_secret, cert_pem, CertError, CertManager, CertRequest};
use tunnelgrid_cluster::{ClusterClient, Node, ObjectMeta, Secret};
use tunnelgrid_core::constants::{APP_OPERATOR, KEY_CREATED_BY, KEY_NODE};

use crate::endpoint::EndpointFactory;
use crate::error::HandlerResult;
use crate::handler::{ChainContext, Handler, Step};
use crate::names::agent_tls_name;

/// Keeps a valid certificate for every edge endpoint.
///
/// Creating or replacing the secret returns [`Step::RestartRequired`]:
/// a running agent only reads its credential at start.
pub struct CertHandler {
    namespace: String,
    cluster: Arc<dyn ClusterClient>,
    certs: Arc<dyn CertManager>,
    organization: String,
    validity_days: u32,
    factory: EndpointFactory,
}

impl CertHandler {
    pub fn new(
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterClient>,
        certs: Arc<dyn CertManager>,
        organization: impl Into<String>,
        validity_days: u32,
        factory: EndpointFactory,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster,
            certs,
            organization: organization.into(),
            validity_days,
            factory,
        }
    }

    fn verify(&self, secret: &Secret, node: &Node) -> Result<(), CertError> {
        let pem = cert_pem(secret).ok_or_else(|| CertError::Parse("secret has no certificate".into()))?;
        self.certs.verify(pem, &self.factory.endpoint_name(&node.name))
    }

    fn build_secret(&self, secret_name: &str, node: &Node) -> HandlerResult<Secret> {
        let name = self.factory.endpoint_name(&node.name);
        let ips: Vec<IpAddr> = node
            .internal_ips
            .iter()
            .filter_map(|ip| ip.parse().ok())
            .collect();

        let pair = self.certs.sign(&CertRequest {
            common_name: name.clone(),
            organization: self.organization.clone(),
            // The name doubles as a DNS alias for mediation.
            dns_names: vec![name],
            ips,
            validity_days: self.validity_days,
        })?;

        let meta = ObjectMeta::new(&self.namespace, secret_name)
            .with_label(KEY_CREATED_BY, APP_OPERATOR)
            .with_label(KEY_NODE, &node.name)
            .owned_by(&node.name);
        Ok(build_tls_secret(meta, &pair, self.certs.ca_cert_pem()))
    }
}

#[async_trait]
impl Handler for CertHandler {
    fn name(&self) -> &'static str {
        "cert"
    }

    async fn converge(&self, node: &Node, _ctx: &mut ChainContext) -> HandlerResult<Step> {
        let secret_name = agent_tls_name(&node.name);

        let existing = match self.cluster.get_secret(&self.namespace, &secret_name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                debug!(node = %node.name, secret = %secret_name, "agent TLS secret not found, generating");
                let secret = self.build_secret(&secret_name, node)?;
                if let Err(e) = self.cluster.create_secret(secret).await {
                    error!(node = %node.name, secret = %secret_name, error = %e, "failed to create agent TLS secret");
                    return Err(e.into());
                }
                return Ok(Step::RestartRequired);
            }
            Err(e) => {
                error!(node = %node.name, secret = %secret_name, error = %e, "failed to get agent TLS secret");
                return Err(e.into());
            }
        };

        match self.verify(&existing, node) {
            Ok(()) => {
                debug!(node = %node.name, "agent certificate verified");
                Ok(Step::Done)
            }
            Err(reason) => {
                warn!(node = %node.name, error = %reason, "agent certificate invalid, regenerating");
                let mut secret = self.build_secret(&secret_name, node)?;
                secret.meta.revision = existing.meta.revision;
                if let Err(e) = self.cluster.update_secret(secret).await {
                    error!(node = %node.name, secret = %secret_name, error = %e, "failed to save agent TLS secret");
                    return Err(e.into());
                }
                Ok(Step::RestartRequired)
            }
        }
    }

    async fn undo(&self, node_name: &str) -> HandlerResult<()> {
        let secret_name = agent_tls_name(node_name);
        match self.cluster.delete_secret(&self.namespace, &secret_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                error!(secret = %secret_name, error = %e, "failed to delete agent TLS secret");
                Err(e.into())
            }
        }
    }
}
