//! Endpoint loader.
//!
//! Endpoints this control plane does not build itself (a mediator, peers
//! published by another operator) are listed from the cluster on a timer
//! and mirrored into the topology store. Names loaded on an earlier pass
//! that the cluster no longer lists are removed again.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tunnelgrid_cluster::{ClusterClient, ClusterResult};
use tunnelgrid_store::TopologyStore;

use crate::controller::MembershipListener;

pub struct EndpointLoader {
    cluster: Arc<dyn ClusterClient>,
    store: TopologyStore,
    loaded: Mutex<BTreeSet<String>>,
    listener: Option<MembershipListener>,
}

impl EndpointLoader {
    pub fn new(cluster: Arc<dyn ClusterClient>, store: TopologyStore) -> Self {
        Self {
            cluster,
            store,
            loaded: Mutex::new(BTreeSet::new()),
            listener: None,
        }
    }

    /// Called with the names of endpoints that were added, changed, or removed.
    pub fn with_listener(mut self, listener: MembershipListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Names currently held in the store on behalf of the cluster.
    pub fn loaded(&self) -> BTreeSet<String> {
        self.loaded.lock().clone()
    }

    /// One listing pass. Returns the names whose stored copy changed.
    ///
    /// Local endpoints always win over a listed endpoint of the same name,
    /// and endpoints failing validation are skipped.
    pub async fn load(&self) -> ClusterResult<BTreeSet<String>> {
        let listed = self.cluster.list_endpoints().await?;
        let local = self.store.get_local_endpoint_names();

        let mut current = BTreeSet::new();
        let mut changed = BTreeSet::new();
        for endpoint in listed {
            if local.contains(&endpoint.name) {
                debug!(endpoint = %endpoint.name, "listed endpoint shadows a local one, ignored");
                continue;
            }
            if let Err(reason) = endpoint.validate() {
                warn!(endpoint = %endpoint.name, error = %reason, "listed endpoint is invalid, skipped");
                continue;
            }

            current.insert(endpoint.name.clone());
            if self.store.get_endpoint(&endpoint.name).as_ref() != Some(&endpoint) {
                changed.insert(endpoint.name.clone());
                self.store.save_endpoint(endpoint);
            }
        }

        let mut loaded = self.loaded.lock();
        for gone in loaded.difference(&current) {
            if local.contains(gone) {
                continue;
            }
            self.store.delete_endpoint(gone);
            changed.insert(gone.clone());
        }
        *loaded = current;
        drop(loaded);

        if !changed.is_empty() {
            info!(changed = changed.len(), "external endpoints reloaded");
            if let Some(listener) = &self.listener {
                listener(&changed);
            }
        }
        Ok(changed)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_secs = interval.as_secs_f64(), "endpoint loader started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.load().await {
                        error!(error = %e, "failed to list endpoints");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("endpoint loader shutting down");
                    break;
                }
            }
        }
    }
}
