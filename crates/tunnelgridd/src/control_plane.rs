//! Control plane assembly.
//!
//! Wires every subsystem against one cluster client:
//! 1. Topology store shared by all controllers
//! 2. Connector loop owning the gateway endpoint
//! 3. Agent engine with the subnet, config, cert, and workload handlers
//! 4. Community controller, which re-queues the nodes whose peers changed
//! 5. Endpoint loader for endpoints published outside this control plane
//!
//! [`ControlPlane::run`] starts them as background tasks and returns once
//! the shutdown signal has stopped all of them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ipnet::IpNet;
use tokio::sync::watch;
use tracing::{debug, info};

use tunnelgrid_agent::{
    AgentEngine, AgentTemplate, CertHandler, ConfigHandler, EndpointFactory, Handler,
    RawSubnetHandler, SubnetHandler, WorkloadHandler,
};
use tunnelgrid_certs::{CertManager, LocalCa};
use tunnelgrid_cluster::ClusterClient;
use tunnelgrid_community::{CommunityController, EndpointLoader};
use tunnelgrid_connector::{ConnectorLoop, ConnectorSettings};
use tunnelgrid_core::config::CertsConfig;
use tunnelgrid_core::OperatorConfig;
use tunnelgrid_ipam::SubnetAllocator;
use tunnelgrid_store::TopologyStore;

/// Load the CA named in the configuration, or generate a fresh one.
pub fn load_ca(certs: &CertsConfig) -> anyhow::Result<LocalCa> {
    match (&certs.ca_cert_file, &certs.ca_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read_to_string(cert_path)
                .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
            let key = std::fs::read_to_string(key_path)
                .with_context(|| format!("read CA key {}", key_path.display()))?;
            let ca = LocalCa::from_pem(&cert, &key)?;
            info!(path = %cert_path.display(), "CA loaded");
            Ok(ca)
        }
        _ => Ok(LocalCa::generate(&certs.organization)?),
    }
}

/// One allocator per configured edge pool.
pub fn build_allocators(config: &OperatorConfig) -> anyhow::Result<Vec<Arc<SubnetAllocator>>> {
    config
        .edge
        .pod_cidrs
        .iter()
        .map(|cidr| {
            let pool: IpNet = cidr
                .parse()
                .with_context(|| format!("invalid edge pod CIDR {cidr}"))?;
            let prefix = config.block_prefix_for(&pool);
            let allocator = SubnetAllocator::new(cidr, prefix)?;
            info!(pool = %allocator.pool(), block_prefix = prefix, blocks = %allocator.num_blocks(), "subnet pool ready");
            Ok(Arc::new(allocator))
        })
        .collect()
}

pub struct ControlPlane {
    config: OperatorConfig,
    cluster: Arc<dyn ClusterClient>,
    store: TopologyStore,
    engine: Arc<AgentEngine>,
    connector: Arc<ConnectorLoop>,
    communities: Arc<CommunityController>,
    endpoints: Arc<EndpointLoader>,
    subnets: Option<Arc<SubnetHandler>>,
}

impl ControlPlane {
    pub fn new(
        config: OperatorConfig,
        cluster: Arc<dyn ClusterClient>,
        certs: Arc<dyn CertManager>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = TopologyStore::new();
        let factory = EndpointFactory::from_config(&config);

        let connector = Arc::new(ConnectorLoop::new(
            ConnectorSettings::from_config(&config),
            Arc::clone(&cluster),
            store.clone(),
            Arc::clone(&certs),
        ));

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::with_capacity(4);
        let mut subnets = None;
        if config.edge.allocate_pod_cidrs {
            let handler = Arc::new(SubnetHandler::new(
                Arc::clone(&cluster),
                store.clone(),
                build_allocators(&config)?,
                factory.clone(),
            ));
            subnets = Some(Arc::clone(&handler));
            handlers.push(handler);
        } else {
            handlers.push(Arc::new(RawSubnetHandler::new(store.clone(), factory.clone())));
        }
        handlers.push(Arc::new(ConfigHandler::new(
            &config.namespace,
            Arc::clone(&cluster),
            store.clone(),
            factory.clone(),
            connector.endpoint_getter(),
        )));
        handlers.push(Arc::new(CertHandler::new(
            &config.namespace,
            Arc::clone(&cluster),
            certs,
            &config.certs.organization,
            config.certs.validity_days,
            factory,
        )));
        handlers.push(Arc::new(WorkloadHandler::new(
            &config.namespace,
            Arc::clone(&cluster),
            AgentTemplate {
                image: config.agent.image.clone(),
                strongswan_image: config.agent.strongswan_image.clone(),
                args: config.agent.args.clone(),
            },
        )));

        let engine = Arc::new(AgentEngine::new(
            Arc::clone(&cluster),
            handlers,
            config.edge.labels.clone(),
        ));
        info!(handlers = ?engine.handler_names(), "agent engine ready");

        let prefix = format!("{}.", config.cluster_name);
        let requeue = Arc::clone(&engine);
        let communities = Arc::new(
            CommunityController::new(Arc::clone(&cluster), store.clone()).with_listener(Arc::new(
                move |members: &BTreeSet<String>| {
                    for node in members.iter().filter_map(|m| m.strip_prefix(&prefix)) {
                        requeue.dispatch(node.to_string());
                    }
                },
            )),
        );

        // A mediator or foreign peer may appear in any agent document.
        let refresh = Arc::clone(&engine);
        let endpoints = Arc::new(
            EndpointLoader::new(Arc::clone(&cluster), store.clone()).with_listener(Arc::new(
                move |_: &BTreeSet<String>| {
                    for node in refresh.converged_nodes() {
                        refresh.dispatch(node);
                    }
                },
            )),
        );

        Ok(Self {
            config,
            cluster,
            store,
            engine,
            connector,
            communities,
            endpoints,
            subnets,
        })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn store(&self) -> &TopologyStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<AgentEngine> {
        &self.engine
    }

    pub fn connector(&self) -> &Arc<ConnectorLoop> {
        &self.connector
    }

    pub fn communities(&self) -> &Arc<CommunityController> {
        &self.communities
    }

    pub fn endpoints(&self) -> &Arc<EndpointLoader> {
        &self.endpoints
    }

    /// Record the subnets edge nodes already hold so new allocations never
    /// collide with them, and load their endpoints into the store.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(subnets) = &self.subnets else {
            return Ok(0);
        };
        let nodes = self
            .cluster
            .list_nodes()
            .await
            .context("list nodes for subnet restore")?;
        let edge: Vec<_> = nodes
            .into_iter()
            .filter(|n| !n.deleting && self.engine.is_edge_node(n))
            .collect();
        Ok(subnets.restore(&edge))
    }

    /// Run every controller until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let restored = self.restore().await?;
        info!(restored, "control plane starting");

        // Subscribe before any initial listing so no event falls in between.
        let engine_events = self.cluster.subscribe_nodes();
        let connector_events = self.cluster.subscribe_nodes();
        let community_events = self.cluster.subscribe_communities();

        let communities = tokio::spawn(
            Arc::clone(&self.communities).run(community_events, shutdown.clone()),
        );
        let connector = tokio::spawn(
            Arc::clone(&self.connector).run(connector_events, shutdown.clone()),
        );
        let engine = tokio::spawn(Arc::clone(&self.engine).run(engine_events, shutdown.clone()));
        let endpoints = tokio::spawn(
            Arc::clone(&self.endpoints).run(self.config.connector_sync_interval(), shutdown.clone()),
        );
        let gateway = tokio::spawn(propagate_gateway_changes(
            Arc::clone(&self.connector),
            Arc::clone(&self.engine),
            self.config.connector_sync_interval(),
            shutdown,
        ));

        let (communities, connector, engine, endpoints, gateway) =
            tokio::join!(communities, connector, engine, endpoints, gateway);
        communities.context("community controller task")?;
        connector.context("connector task")?;
        engine.context("agent engine task")?;
        endpoints.context("endpoint loader task")?;
        gateway.context("gateway watch task")?;

        info!("control plane stopped");
        Ok(())
    }
}

/// Every agent document embeds the gateway endpoint; re-queue all converged
/// nodes whenever it changes.
async fn propagate_gateway_changes(
    connector: Arc<ConnectorLoop>,
    engine: Arc<AgentEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last = connector.endpoint();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = connector.endpoint();
                if current == last {
                    continue;
                }
                let nodes = engine.converged_nodes();
                info!(nodes = nodes.len(), subnets = ?current.subnets, "gateway endpoint changed, refreshing agents");
                for node in nodes {
                    engine.dispatch(node);
                }
                last = current;
            }
            _ = shutdown.changed() => {
                debug!("gateway watch shutting down");
                break;
            }
        }
    }
}

/// Labels from the configuration, for log output.
pub fn describe_edge_selector(config: &OperatorConfig) -> String {
    config
        .edge
        .labels
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(",")
}
