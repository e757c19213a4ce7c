//! TopologyStore: endpoint records and community membership.
//!
//! Every operation takes a single reader/writer lock over the whole store,
//! which keeps the reverse index exactly in step with community membership.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use tunnelgrid_core::{Community, Endpoint};

#[derive(Default)]
struct Inner {
    endpoints: HashMap<String, Endpoint>,
    local_names: HashSet<String>,
    communities: HashMap<String, Community>,
    endpoint_to_communities: HashMap<String, HashSet<String>>,
}

/// Thread-safe topology store. Clones share the same state.
#[derive(Clone, Default)]
pub struct TopologyStore {
    inner: Arc<RwLock<Inner>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Endpoints ──────────────────────────────────────────────────

    /// Insert or replace an endpoint by name.
    pub fn save_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.write();
        debug!(endpoint = %endpoint.name, "endpoint saved");
        inner.endpoints.insert(endpoint.name.clone(), endpoint);
    }

    /// Insert or replace an endpoint and mark it as owned by this instance.
    pub fn save_endpoint_as_local(&self, endpoint: Endpoint) {
        let mut inner = self.inner.write();
        debug!(endpoint = %endpoint.name, "local endpoint saved");
        inner.local_names.insert(endpoint.name.clone());
        inner.endpoints.insert(endpoint.name.clone(), endpoint);
    }

    pub fn get_endpoint(&self, name: &str) -> Option<Endpoint> {
        self.inner.read().endpoints.get(name).cloned()
    }

    /// Endpoints for the given names, in argument order. Unknown names are skipped.
    pub fn get_endpoints<S: AsRef<str>>(&self, names: &[S]) -> Vec<Endpoint> {
        let inner = self.inner.read();
        names
            .iter()
            .filter_map(|n| inner.endpoints.get(n.as_ref()).cloned())
            .collect()
    }

    pub fn get_all_endpoint_names(&self) -> BTreeSet<String> {
        self.inner.read().endpoints.keys().cloned().collect()
    }

    pub fn get_local_endpoint_names(&self) -> BTreeSet<String> {
        self.inner.read().local_names.iter().cloned().collect()
    }

    /// Remove an endpoint and its local mark. Unknown names are a no-op.
    pub fn delete_endpoint(&self, name: &str) {
        let mut inner = self.inner.write();
        inner.local_names.remove(name);
        if inner.endpoints.remove(name).is_some() {
            debug!(endpoint = %name, "endpoint deleted");
        }
    }

    // ── Communities ────────────────────────────────────────────────

    /// Insert or replace a community, repairing the reverse index.
    ///
    /// Saving a community whose member set equals the stored one does
    /// nothing at all.
    pub fn save_community(&self, community: Community) {
        let mut inner = self.inner.write();

        let old_members = match inner.communities.get(&community.name) {
            Some(old) if old.members == community.members => return,
            Some(old) => old.members.clone(),
            None => BTreeSet::new(),
        };

        for added in community.members.difference(&old_members) {
            inner
                .endpoint_to_communities
                .entry(added.clone())
                .or_default()
                .insert(community.name.clone());
        }
        for removed in old_members.difference(&community.members) {
            unindex(&mut inner.endpoint_to_communities, removed, &community.name);
        }

        debug!(
            community = %community.name,
            members = community.members.len(),
            "community saved"
        );
        inner.communities.insert(community.name.clone(), community);
    }

    pub fn get_community(&self, name: &str) -> Option<Community> {
        self.inner.read().communities.get(name).cloned()
    }

    pub fn get_community_names(&self) -> BTreeSet<String> {
        self.inner.read().communities.keys().cloned().collect()
    }

    /// Communities `endpoint` belongs to, sorted by name.
    pub fn get_communities_by_endpoint(&self, endpoint: &str) -> Vec<Community> {
        let inner = self.inner.read();
        let Some(names) = inner.endpoint_to_communities.get(endpoint) else {
            return Vec::new();
        };

        let mut communities: Vec<Community> = names
            .iter()
            .filter_map(|n| inner.communities.get(n).cloned())
            .collect();
        communities.sort_by(|a, b| a.name.cmp(&b.name));
        communities
    }

    /// Names of every endpoint sharing at least one community with `endpoint`,
    /// excluding `endpoint` itself.
    pub fn get_community_peer_names(&self, endpoint: &str) -> BTreeSet<String> {
        self.get_communities_by_endpoint(endpoint)
            .into_iter()
            .flat_map(|c| c.members)
            .filter(|m| m != endpoint)
            .collect()
    }

    /// Remove a community and every index entry pointing at it.
    pub fn delete_community(&self, name: &str) {
        let mut inner = self.inner.write();
        let Some(community) = inner.communities.remove(name) else {
            return;
        };
        for member in &community.members {
            unindex(&mut inner.endpoint_to_communities, member, name);
        }
        debug!(community = %name, "community deleted");
    }
}

fn unindex(index: &mut HashMap<String, HashSet<String>>, endpoint: &str, community: &str) {
    if let Some(set) = index.get_mut(endpoint) {
        set.remove(community);
        if set.is_empty() {
            index.remove(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelgrid_core::EndpointType;

    fn edge(name: &str) -> Endpoint {
        Endpoint {
            id: format!("C=CN, O=tunnelgrid, CN={name}"),
            name: name.to_string(),
            public_addresses: vec!["10.20.40.181".to_string()],
            subnets: vec!["2.2.0.0/26".to_string()],
            node_subnets: vec!["10.20.40.181".to_string()],
            endpoint_type: EndpointType::EdgeNode,
        }
    }

    fn names(communities: Vec<Community>) -> Vec<String> {
        communities.into_iter().map(|c| c.name).collect()
    }

    /// Check the index against a brute-force scan of every community.
    fn assert_index_consistent(store: &TopologyStore, endpoints: &[&str]) {
        let all: Vec<Community> = store
            .get_community_names()
            .iter()
            .filter_map(|n| store.get_community(n))
            .collect();
        for ep in endpoints {
            let mut expected: Vec<String> = all
                .iter()
                .filter(|c| c.contains(ep))
                .map(|c| c.name.clone())
                .collect();
            expected.sort();
            assert_eq!(names(store.get_communities_by_endpoint(ep)), expected, "endpoint {ep}");
        }
    }

    #[test]
    fn endpoint_crud() {
        let store = TopologyStore::new();
        store.save_endpoint(edge("edge1"));
        assert_eq!(store.get_endpoint("edge1"), Some(edge("edge1")));

        store.delete_endpoint("edge1");
        assert_eq!(store.get_endpoint("edge1"), None);

        // Deleting again is harmless.
        store.delete_endpoint("edge1");
    }

    #[test]
    fn local_marking() {
        let store = TopologyStore::new();
        store.save_endpoint(edge("remote"));
        store.save_endpoint_as_local(edge("edge1"));

        assert_eq!(
            store.get_local_endpoint_names().into_iter().collect::<Vec<_>>(),
            vec!["edge1".to_string()]
        );
        assert_eq!(store.get_all_endpoint_names().len(), 2);

        store.delete_endpoint("edge1");
        assert!(store.get_local_endpoint_names().is_empty());
    }

    #[test]
    fn get_endpoints_skips_unknown_names() {
        let store = TopologyStore::new();
        store.save_endpoint(edge("edge1"));
        store.save_endpoint(edge("edge2"));

        let found = store.get_endpoints(&["edge2", "ghost", "edge1"]);
        let found: Vec<&str> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(found, vec!["edge2", "edge1"]);
    }

    #[test]
    fn resaving_community_updates_reverse_index() {
        let store = TopologyStore::new();
        store.save_community(Community::new("team-a", ["edge1", "edge2"]));
        assert_eq!(names(store.get_communities_by_endpoint("edge2")), vec!["team-a"]);

        store.save_community(Community::new("team-a", ["edge1", "edge3"]));
        assert!(store.get_communities_by_endpoint("edge2").is_empty());
        assert_eq!(names(store.get_communities_by_endpoint("edge3")), vec!["team-a"]);
        assert_eq!(names(store.get_communities_by_endpoint("edge1")), vec!["team-a"]);
    }

    #[test]
    fn identical_resave_is_a_noop() {
        let store = TopologyStore::new();
        store.save_community(Community::new("team-a", ["edge1", "edge2"]));
        store.save_community(Community::new("team-a", ["edge2", "edge1"]));

        assert_eq!(names(store.get_communities_by_endpoint("edge1")), vec!["team-a"]);
        assert_eq!(names(store.get_communities_by_endpoint("edge2")), vec!["team-a"]);
    }

    #[test]
    fn delete_community_clears_index() {
        let store = TopologyStore::new();
        store.save_community(Community::new("team-a", ["edge1", "edge2"]));
        store.save_community(Community::new("team-b", ["edge2"]));

        store.delete_community("team-a");
        assert!(store.get_community("team-a").is_none());
        assert!(store.get_communities_by_endpoint("edge1").is_empty());
        assert_eq!(names(store.get_communities_by_endpoint("edge2")), vec!["team-b"]);

        store.delete_community("missing");
    }

    #[test]
    fn index_stays_consistent_through_mixed_changes() {
        let store = TopologyStore::new();
        let eps = ["e1", "e2", "e3", "e4"];

        store.save_community(Community::new("a", ["e1", "e2"]));
        assert_index_consistent(&store, &eps);
        store.save_community(Community::new("b", ["e2", "e3"]));
        assert_index_consistent(&store, &eps);
        store.save_community(Community::new("a", ["e3", "e4"]));
        assert_index_consistent(&store, &eps);
        store.delete_community("b");
        assert_index_consistent(&store, &eps);
        store.save_community(Community::new("b", Vec::<String>::new()));
        assert_index_consistent(&store, &eps);
        store.save_community(Community::new("c", ["e1", "e2", "e3", "e4"]));
        assert_index_consistent(&store, &eps);
        store.delete_community("a");
        assert_index_consistent(&store, &eps);
    }

    #[test]
    fn community_peers_exclude_self() {
        let store = TopologyStore::new();
        store.save_community(Community::new("a", ["edge1", "edge2"]));
        store.save_community(Community::new("b", ["edge1", "edge3"]));

        let peers: Vec<String> = store.get_community_peer_names("edge1").into_iter().collect();
        assert_eq!(peers, vec!["edge2", "edge3"]);
    }

    #[test]
    fn concurrent_writers_keep_index_consistent() {
        let store = TopologyStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let members = if round % 2 == 0 { ["e1", "e2"] } else { ["e2", "e3"] };
                        store.save_community(Community::new(format!("c{i}"), members));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_index_consistent(&store, &["e1", "e2", "e3"]);
        assert_eq!(store.get_communities_by_endpoint("e3").len(), 8);
    }
}
