//! Tunnel document handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use tunnelgrid_cluster::{ClusterClient, ConfigDocument, Node, ObjectMeta, OwnerReference};
use tunnelgrid_core::constants::{
    APP_AGENT, APP_OPERATOR, DEFAULT_MEDIATOR_NAME, KEY_APP, KEY_CREATED_BY, TUNNELS_FILE_NAME,
};
use tunnelgrid_core::{EndpointGetter, NetworkConf};
use tunnelgrid_store::TopologyStore;

use crate::endpoint::EndpointFactory;
use crate::error::{HandlerError, HandlerResult};
use crate::handler::{ChainContext, Handler, Step};
use crate::names::agent_config_name;

/// Writes each edge node's tunnel document.
///
/// The connector is always the first peer, followed by every endpoint
/// sharing a community with the node. The mediator is attached when one
/// is registered in the store.
pub struct ConfigHandler {
    namespace: String,
    cluster: Arc<dyn ClusterClient>,
    store: TopologyStore,
    factory: EndpointFactory,
    connector_endpoint: EndpointGetter,
}

impl ConfigHandler {
    pub fn new(
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterClient>,
        store: TopologyStore,
        factory: EndpointFactory,
        connector_endpoint: EndpointGetter,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster,
            store,
            factory,
            connector_endpoint,
        }
    }

    /// The document the node's agent should currently see.
    pub fn build_network_conf(&self, node_name: &str) -> HandlerResult<NetworkConf> {
        let name = self.factory.endpoint_name(node_name);
        let endpoint = self
            .store
            .get_endpoint(&name)
            .ok_or_else(|| HandlerError::MissingEndpoint(name.clone()))?;

        let peer_names = self.store.get_community_peer_names(&name);
        let peers = self.store.get_endpoints(&peer_names.into_iter().collect::<Vec<_>>());

        Ok(NetworkConf::build(
            endpoint,
            Some((self.connector_endpoint)()),
            peers,
            self.store.get_endpoint(DEFAULT_MEDIATOR_NAME),
        ))
    }
}

#[async_trait]
impl Handler for ConfigHandler {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn converge(&self, node: &Node, _ctx: &mut ChainContext) -> HandlerResult<Step> {
        let config_name = agent_config_name(&node.name);
        let text = self.build_network_conf(&node.name)?.to_yaml()?;

        let existing = match self.cluster.get_config(&self.namespace, &config_name).await {
            Ok(doc) => Some(doc),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                error!(node = %node.name, config = %config_name, error = %e, "failed to get agent config");
                return Err(e.into());
            }
        };

        match existing {
            None => {
                debug!(node = %node.name, config = %config_name, "agent config not found, creating");
                let doc = ConfigDocument {
                    meta: ObjectMeta::new(&self.namespace, &config_name)
                        .with_label(KEY_APP, APP_AGENT)
                        .with_label(KEY_CREATED_BY, APP_OPERATOR)
                        .owned_by(&node.name),
                    data: BTreeMap::from([(TUNNELS_FILE_NAME.to_string(), text)]),
                };
                self.cluster.create_config(doc).await?;
            }
            Some(doc) if doc.data.get(TUNNELS_FILE_NAME) == Some(&text) => {
                debug!(node = %node.name, config = %config_name, "agent config unchanged");
            }
            Some(mut doc) => {
                doc.data.insert(TUNNELS_FILE_NAME.to_string(), text);
                doc.meta.owner = Some(OwnerReference {
                    node: node.name.clone(),
                });
                if let Err(e) = self.cluster.update_config(doc).await {
                    error!(node = %node.name, config = %config_name, error = %e, "failed to update agent config");
                    return Err(e.into());
                }
                debug!(node = %node.name, config = %config_name, "agent config updated");
            }
        }

        Ok(Step::Done)
    }

    async fn undo(&self, node_name: &str) -> HandlerResult<()> {
        let config_name = agent_config_name(node_name);
        match self.cluster.delete_config(&self.namespace, &config_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                error!(config = %config_name, error = %e, "failed to delete agent config");
                Err(e.into())
            }
        }
    }
}
