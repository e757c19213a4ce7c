//! ConnectorLoop: keeps the gateway endpoint and its artifacts current.
//!
//! The connector fronts every non-edge node. Its endpoint routes the pod
//! CIDRs of those nodes plus any statically provided subnets, and is
//! rebuilt whenever a tracked node changes. A periodic tick republishes
//! the endpoint, rewrites the connector's tunnel document when its
//! content changed, and renews the connector credential.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tunnelgrid_certs::{build_tls_secret, cert_pem, CertError, CertManager, CertRequest};
use tunnelgrid_cluster::{ClusterClient, ConfigDocument, Node, NodeEvent, ObjectMeta, Secret};
use tunnelgrid_core::constants::{
    APP_OPERATOR, DEFAULT_MEDIATOR_NAME, KEY_CREATED_BY, TUNNELS_FILE_NAME,
};
use tunnelgrid_core::endpoint::is_dns_name;
use tunnelgrid_core::{Endpoint, EndpointGetter, EndpointType, NetworkConf, OperatorConfig};
use tunnelgrid_store::TopologyStore;

use crate::error::{ConnectorError, ConnectorResult};

/// Everything the connector loop needs from the operator configuration.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub namespace: String,
    pub name: String,
    pub endpoint_id: String,
    pub public_addresses: Vec<String>,
    pub provided_subnets: Vec<String>,
    pub config_name: String,
    pub tls_name: String,
    pub workload_name: Option<String>,
    pub organization: String,
    pub validity_days: u32,
    pub interval: Duration,
    /// Nodes matching these labels are edge nodes and never tracked.
    pub edge_labels: BTreeMap<String, String>,
}

impl ConnectorSettings {
    pub fn from_config(config: &OperatorConfig) -> Self {
        let name = config.connector.name.clone();
        Self {
            namespace: config.namespace.clone(),
            endpoint_id: config.edge.endpoint_id_format.replace("{node}", &name),
            public_addresses: config.connector.public_addresses.clone(),
            provided_subnets: config.connector.provided_subnets.clone(),
            config_name: config.connector.config_name.clone(),
            tls_name: format!("{name}-tls"),
            workload_name: config.connector.workload_name.clone(),
            organization: config.certs.organization.clone(),
            validity_days: config.certs.validity_days,
            interval: config.connector_sync_interval(),
            edge_labels: config.edge.labels.clone(),
            name,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub config_written: bool,
    pub cert_regenerated: bool,
    pub failures: usize,
}

#[derive(Debug, Clone)]
struct TrackedNode {
    internal_ips: Vec<String>,
    pod_cidrs: Vec<String>,
}

struct Tracked {
    nodes: BTreeMap<String, TrackedNode>,
    endpoint: Endpoint,
}

pub struct ConnectorLoop {
    settings: ConnectorSettings,
    cluster: Arc<dyn ClusterClient>,
    store: TopologyStore,
    certs: Arc<dyn CertManager>,
    tracked: Mutex<Tracked>,
    /// Set when the credential changed and the workload has not yet been
    /// deleted for it.
    restart_pending: AtomicBool,
}

impl ConnectorLoop {
    pub fn new(
        settings: ConnectorSettings,
        cluster: Arc<dyn ClusterClient>,
        store: TopologyStore,
        certs: Arc<dyn CertManager>,
    ) -> Self {
        let endpoint = build_endpoint(&settings, &BTreeMap::new());
        store.save_endpoint_as_local(endpoint.clone());
        Self {
            settings,
            cluster,
            store,
            certs,
            tracked: Mutex::new(Tracked {
                nodes: BTreeMap::new(),
                endpoint,
            }),
            restart_pending: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Current gateway endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.tracked.lock().endpoint.clone()
    }

    /// A getter other components use to read the gateway endpoint.
    pub fn endpoint_getter(self: &Arc<Self>) -> EndpointGetter {
        let this = Arc::clone(self);
        Arc::new(move || this.endpoint())
    }

    /// Names of the nodes currently behind the connector.
    pub fn tracked_nodes(&self) -> Vec<String> {
        self.tracked.lock().nodes.keys().cloned().collect()
    }

    /// Track or refresh `node`. Edge nodes, nodes being deleted, and nodes
    /// without an internal IP are dropped instead. Returns whether the node
    /// is tracked afterwards.
    pub fn add_node(&self, node: &Node) -> bool {
        if node.deleting || node.internal_ips.is_empty() || self.is_edge_node(node) {
            self.remove_node(&node.name);
            return false;
        }

        let entry = TrackedNode {
            internal_ips: node.internal_ips.clone(),
            pod_cidrs: node.pod_cidrs.clone(),
        };

        let mut tracked = self.tracked.lock();
        if tracked.nodes.get(&node.name).is_some_and(|n| {
            n.internal_ips == entry.internal_ips && n.pod_cidrs == entry.pod_cidrs
        }) {
            return true;
        }
        tracked.nodes.insert(node.name.clone(), entry);
        debug!(node = %node.name, "connector node tracked");
        self.rebuild(&mut tracked);
        true
    }

    pub fn remove_node(&self, name: &str) {
        let mut tracked = self.tracked.lock();
        if tracked.nodes.remove(name).is_some() {
            debug!(node = %name, "connector node untracked");
            self.rebuild(&mut tracked);
        }
    }

    pub fn is_edge_node(&self, node: &Node) -> bool {
        node.matches_labels(&self.settings.edge_labels)
    }

    fn rebuild(&self, tracked: &mut Tracked) {
        tracked.endpoint = build_endpoint(&self.settings, &tracked.nodes);
        self.store.save_endpoint_as_local(tracked.endpoint.clone());
    }

    /// The connector's tunnel document.
    ///
    /// Peers are the endpoints sharing a community with the connector plus
    /// every other endpoint owned by this control plane.
    pub fn build_network_conf(&self) -> NetworkConf {
        let endpoint = self.endpoint();

        let mut names: BTreeSet<String> = self.store.get_community_peer_names(&endpoint.name);
        names.extend(self.store.get_local_endpoint_names());
        names.remove(&endpoint.name);
        names.remove(DEFAULT_MEDIATOR_NAME);
        let peers = self.store.get_endpoints(&names.into_iter().collect::<Vec<_>>());

        NetworkConf::build(
            endpoint,
            None,
            peers,
            self.store.get_endpoint(DEFAULT_MEDIATOR_NAME),
        )
    }

    /// Write the tunnel document if its content changed. Returns whether
    /// anything was written.
    pub async fn sync_config(&self) -> ConnectorResult<bool> {
        let ns = &self.settings.namespace;
        let name = &self.settings.config_name;
        let text = self.build_network_conf().to_yaml()?;

        match self.cluster.get_config(ns, name).await {
            Ok(mut doc) => {
                if doc.data.get(TUNNELS_FILE_NAME) == Some(&text) {
                    debug!(config = %name, "connector tunnels unchanged");
                    return Ok(false);
                }
                doc.data.insert(TUNNELS_FILE_NAME.to_string(), text);
                self.cluster.update_config(doc).await?;
                info!(config = %name, "connector tunnels updated");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                let doc = ConfigDocument {
                    meta: ObjectMeta::new(ns, name).with_label(KEY_CREATED_BY, APP_OPERATOR),
                    data: BTreeMap::from([(TUNNELS_FILE_NAME.to_string(), text)]),
                };
                self.cluster.create_config(doc).await?;
                info!(config = %name, "connector tunnels created");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the connector credential exists and verifies. Returns
    /// whether it was (re)generated during this call.
    ///
    /// A regenerated credential owes the workload a restart; a failed
    /// restart is retried on later calls until it succeeds.
    pub async fn sync_cert(&self) -> ConnectorResult<bool> {
        let ns = &self.settings.namespace;
        let name = &self.settings.tls_name;

        let regenerated = match self.cluster.get_secret(ns, name).await {
            Ok(existing) => {
                let verified = cert_pem(&existing)
                    .ok_or_else(|| CertError::Parse("secret has no certificate".into()))
                    .and_then(|pem| self.certs.verify(pem, &self.settings.name));
                match verified {
                    Ok(()) => false,
                    Err(reason) => {
                        warn!(secret = %name, error = %reason, "connector certificate invalid, regenerating");
                        let mut secret = self.build_secret()?;
                        secret.meta.revision = existing.meta.revision;
                        self.cluster.update_secret(secret).await?;
                        true
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                info!(secret = %name, "connector TLS secret not found, generating");
                self.cluster.create_secret(self.build_secret()?).await?;
                true
            }
            Err(e) => return Err(e.into()),
        };

        if regenerated {
            self.restart_pending.store(true, Ordering::Release);
        }
        if self.restart_pending.load(Ordering::Acquire) {
            self.restart_workload().await?;
            self.restart_pending.store(false, Ordering::Release);
        }
        Ok(regenerated)
    }

    /// Whether a credential change is still waiting for its workload restart.
    pub fn is_restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::Acquire)
    }

    fn build_secret(&self) -> ConnectorResult<Secret> {
        let mut dns_names = vec![self.settings.name.clone()];
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in &self.settings.public_addresses {
            match addr.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(_) if is_dns_name(addr) => dns_names.push(addr.clone()),
                Err(_) => {}
            }
        }

        let pair = self.certs.sign(&CertRequest {
            common_name: self.settings.name.clone(),
            organization: self.settings.organization.clone(),
            dns_names,
            ips,
            validity_days: self.settings.validity_days,
        })?;

        let meta = ObjectMeta::new(&self.settings.namespace, &self.settings.tls_name)
            .with_label(KEY_CREATED_BY, APP_OPERATOR);
        Ok(build_tls_secret(meta, &pair, self.certs.ca_cert_pem()))
    }

    /// Delete the connector workload so its owner recreates it with the
    /// new credential.
    async fn restart_workload(&self) -> ConnectorResult<()> {
        let Some(workload) = &self.settings.workload_name else {
            return Ok(());
        };
        match self
            .cluster
            .delete_workload(&self.settings.namespace, workload)
            .await
        {
            Ok(()) => {
                info!(workload = %workload, "connector workload deleted for restart");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(ConnectorError::from(e)),
        }
    }

    /// One synchronization pass. Steps are independent; a failing step is
    /// logged and the others still run.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        {
            let mut tracked = self.tracked.lock();
            self.rebuild(&mut tracked);
        }

        match self.sync_config().await {
            Ok(written) => report.config_written = written,
            Err(e) => {
                error!(error = %e, "failed to sync connector tunnels");
                report.failures += 1;
            }
        }

        match self.sync_cert().await {
            Ok(regenerated) => report.cert_regenerated = regenerated,
            Err(e) => {
                error!(error = %e, "failed to sync connector certificate");
                report.failures += 1;
            }
        }

        report
    }

    /// Track every eligible node currently in the cluster.
    pub async fn resync(&self) -> ConnectorResult<usize> {
        let nodes = self.cluster.list_nodes().await?;
        let present: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();

        for stale in self
            .tracked_nodes()
            .into_iter()
            .filter(|n| !present.contains(n.as_str()))
        {
            self.remove_node(&stale);
        }

        Ok(nodes.iter().filter(|n| self.add_node(n)).count())
    }

    pub fn handle_event(&self, event: &NodeEvent) {
        match event {
            NodeEvent::Upsert(node) => {
                self.add_node(node);
            }
            NodeEvent::Deleted(name) => self.remove_node(name),
        }
    }

    /// Tick on the configured interval and follow node events until
    /// `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<NodeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.resync().await {
            error!(error = %e, "initial connector node listing failed");
        }

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            connector = %self.settings.name,
            interval_secs = self.settings.interval.as_secs_f64(),
            "connector loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "connector tick");
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connector lagged behind node events, relisting");
                        if let Err(e) = self.resync().await {
                            error!(error = %e, "connector relisting failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("node event stream closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("connector loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Gateway endpoint for the given set of tracked nodes.
///
/// Subnets list the provided subnets first, then node pod CIDRs in node
/// name order, without duplicates.
fn build_endpoint(settings: &ConnectorSettings, nodes: &BTreeMap<String, TrackedNode>) -> Endpoint {
    let mut subnets: Vec<String> = Vec::new();
    let mut node_subnets: Vec<String> = Vec::new();

    let node_cidrs = nodes.values().flat_map(|n| n.pod_cidrs.iter());
    for cidr in settings.provided_subnets.iter().chain(node_cidrs) {
        if !subnets.contains(cidr) {
            subnets.push(cidr.clone());
        }
    }
    for ip in nodes.values().flat_map(|n| n.internal_ips.iter()) {
        if !node_subnets.contains(ip) {
            node_subnets.push(ip.clone());
        }
    }

    Endpoint {
        id: settings.endpoint_id.clone(),
        name: settings.name.clone(),
        public_addresses: settings.public_addresses.clone(),
        subnets,
        node_subnets,
        endpoint_type: EndpointType::Connector,
    }
}
