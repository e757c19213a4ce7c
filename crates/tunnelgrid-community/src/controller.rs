//! Community controller.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use tunnelgrid_cluster::{ClusterClient, ClusterResult, CommunityEvent, CommunityObject};
use tunnelgrid_core::Community;
use tunnelgrid_store::TopologyStore;

/// Told which endpoints gained or lost community peers.
pub type MembershipListener = Arc<dyn Fn(&BTreeSet<String>) + Send + Sync>;

pub struct CommunityController {
    cluster: Arc<dyn ClusterClient>,
    store: TopologyStore,
    listener: Option<MembershipListener>,
}

impl CommunityController {
    pub fn new(cluster: Arc<dyn ClusterClient>, store: TopologyStore) -> Self {
        Self {
            cluster,
            store,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: MembershipListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Save `object` into the store, or delete it when it is going away.
    /// Returns the endpoints whose peer set may have changed.
    pub fn apply(&self, object: &CommunityObject) -> BTreeSet<String> {
        if object.deleting {
            return self.remove(&object.name);
        }

        let community = Community::new(&object.name, &object.members);
        let before = self.store.get_community(&object.name);
        if before.as_ref().is_some_and(|c| c.members == community.members) {
            return BTreeSet::new();
        }

        let mut affected = before.map(|c| c.members).unwrap_or_default();
        affected.extend(community.members.iter().cloned());
        debug!(community = %object.name, members = community.members.len(), "community saved");
        self.store.save_community(community);
        affected
    }

    /// Drop a community. Returns its former members.
    pub fn remove(&self, name: &str) -> BTreeSet<String> {
        let Some(community) = self.store.get_community(name) else {
            return BTreeSet::new();
        };
        self.store.delete_community(name);
        debug!(community = %name, "community deleted");
        community.members
    }

    pub fn handle_event(&self, event: &CommunityEvent) {
        let affected = match event {
            CommunityEvent::Upsert(object) => self.apply(object),
            CommunityEvent::Deleted(name) => self.remove(name),
        };
        self.notify(&affected);
    }

    /// Mirror the cluster's full community list, dropping communities the
    /// cluster no longer has.
    pub async fn resync(&self) -> ClusterResult<usize> {
        let objects = self.cluster.list_communities().await?;
        let listed: BTreeSet<&str> = objects.iter().map(|c| c.name.as_str()).collect();

        let mut affected = BTreeSet::new();
        for name in self.store.get_community_names() {
            if !listed.contains(name.as_str()) {
                affected.extend(self.remove(&name));
            }
        }
        for object in &objects {
            affected.extend(self.apply(object));
        }
        self.notify(&affected);

        Ok(self.store.get_community_names().len())
    }

    fn notify(&self, affected: &BTreeSet<String>) {
        if affected.is_empty() {
            return;
        }
        if let Some(listener) = &self.listener {
            listener(affected);
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<CommunityEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        match self.resync().await {
            Ok(count) => info!(communities = count, "community controller started"),
            Err(e) => error!(error = %e, "initial community listing failed"),
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "community controller lagged, relisting");
                        if let Err(e) = self.resync().await {
                            error!(error = %e, "community relisting failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    debug!("community controller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tunnelgrid_cluster::MemoryCluster;

    fn object(name: &str, members: &[&str]) -> CommunityObject {
        CommunityObject {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            deleting: false,
        }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (MemoryCluster, TopologyStore, CommunityController) {
        let cluster = MemoryCluster::new();
        let store = TopologyStore::new();
        let ctl = CommunityController::new(Arc::new(cluster.clone()), store.clone());
        (cluster, store, ctl)
    }

    #[test]
    fn upsert_saves_and_reports_membership_changes() {
        let (_cluster, store, ctl) = setup();

        let affected = ctl.apply(&object("team-a", &["edge1", "edge2"]));
        assert_eq!(affected, names(&["edge1", "edge2"]));
        assert_eq!(store.get_community("team-a").unwrap().members, names(&["edge1", "edge2"]));

        // Same members: nothing changes.
        assert!(ctl.apply(&object("team-a", &["edge2", "edge1"])).is_empty());

        let affected = ctl.apply(&object("team-a", &["edge1", "edge3"]));
        assert_eq!(affected, names(&["edge1", "edge2", "edge3"]));
        assert!(store.get_communities_by_endpoint("edge2").is_empty());
        assert_eq!(store.get_communities_by_endpoint("edge3").len(), 1);
    }

    #[test]
    fn deleting_object_removes_community() {
        let (_cluster, store, ctl) = setup();
        ctl.apply(&object("team-a", &["edge1", "edge2"]));

        let mut going = object("team-a", &["edge1", "edge2"]);
        going.deleting = true;
        assert_eq!(ctl.apply(&going), names(&["edge1", "edge2"]));
        assert!(store.get_community("team-a").is_none());
        assert!(store.get_communities_by_endpoint("edge1").is_empty());

        assert!(ctl.remove("team-a").is_empty());
    }

    #[tokio::test]
    async fn resync_mirrors_cluster_list() {
        let (cluster, store, ctl) = setup();
        store.save_community(Community::new("stale", ["edge9"]));
        cluster.apply_community(object("team-a", &["edge1", "edge2"]));
        cluster.apply_community(object("team-b", &["edge2", "edge3"]));

        assert_eq!(ctl.resync().await.unwrap(), 2);
        assert_eq!(store.get_community_names(), names(&["team-a", "team-b"]));
        assert_eq!(store.get_communities_by_endpoint("edge2").len(), 2);
        assert!(store.get_communities_by_endpoint("edge9").is_empty());
    }

    #[tokio::test]
    async fn run_applies_events_and_notifies() {
        let (cluster, store, ctl) = setup();
        let seen: Arc<Mutex<BTreeSet<String>>> = Arc::default();
        let sink = seen.clone();
        let ctl = Arc::new(ctl.with_listener(Arc::new(move |names: &BTreeSet<String>| {
            sink.lock().extend(names.iter().cloned());
        })));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(ctl.clone().run(cluster.subscribe_communities(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cluster.apply_community(object("team-a", &["edge1", "edge2"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get_community("team-a").is_some());
        assert_eq!(*seen.lock(), names(&["edge1", "edge2"]));

        cluster.delete_community("team-a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get_community("team-a").is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
