//! Full control plane against an in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use tunnelgrid_agent::names::{agent_config_name, agent_tls_name, agent_workload_name};
use tunnelgrid_certs::LocalCa;
use tunnelgrid_cluster::{ClusterClient, CommunityObject, MemoryCluster, Node};
use tunnelgrid_core::constants::{DEFAULT_EDGE_LABEL, KEY_POD_SUBNETS, TUNNELS_FILE_NAME};
use tunnelgrid_core::{Endpoint, EndpointType, NetworkConf, OperatorConfig};
use tunnelgridd::ControlPlane;

const CONFIG: &str = r#"
cluster_name = "beijing"
namespace = "tunnelgrid"

[edge]
pod_cidrs = ["2.2.0.0/16"]

[connector]
public_addresses = ["192.168.1.1"]
provided_subnets = ["10.233.0.0/18"]
sync_interval_secs = 1
"#;

struct Harness {
    cluster: MemoryCluster,
    plane: Arc<ControlPlane>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(seed: impl FnOnce(&MemoryCluster)) -> Self {
        let cluster = MemoryCluster::new();
        seed(&cluster);

        let config = OperatorConfig::from_toml_str(CONFIG).unwrap();
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        let ca = Arc::new(LocalCa::generate("tunnelgrid").unwrap());
        let plane = Arc::new(ControlPlane::new(config, client, ca).unwrap());

        let (shutdown, rx) = watch::channel(false);
        let runner = Arc::clone(&plane);
        let task = tokio::spawn(async move { runner.run(rx).await });

        Self {
            cluster,
            plane,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("control plane did not stop")
            .unwrap()
            .unwrap();
    }

    fn document(&self, name: &str) -> Option<NetworkConf> {
        self.cluster
            .configs()
            .into_iter()
            .find(|c| c.meta.name == name)
            .and_then(|c| c.data.get(TUNNELS_FILE_NAME).cloned())
            .map(|text| NetworkConf::from_yaml(&text).unwrap())
    }

    fn has_secret(&self, name: &str) -> bool {
        self.cluster.secrets().iter().any(|s| s.meta.name == name)
    }

    fn has_workload(&self, name: &str) -> bool {
        self.cluster.workloads().iter().any(|w| w.meta.name == name)
    }
}

fn edge_node(name: &str, ip: &str) -> Node {
    Node::new(name)
        .with_label(DEFAULT_EDGE_LABEL, "")
        .with_internal_ip(ip)
}

/// Poll `check` until it holds or the deadline passes.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn edge_node_gets_subnet_document_credential_and_workload() {
    let h = Harness::start(|c| c.apply_node(edge_node("edge1", "10.20.40.181"))).await;

    eventually("agent workload", || h.has_workload(&agent_workload_name("edge1"))).await;
    assert!(h.has_secret(&agent_tls_name("edge1")));

    let node = h.cluster.get_node("edge1").await.unwrap();
    let subnet = node.annotations.get(KEY_POD_SUBNETS).unwrap().clone();
    assert!(subnet.starts_with("2.2."), "unexpected subnet {subnet}");
    assert!(subnet.ends_with("/24"));

    let doc = h.document(&agent_config_name("edge1")).unwrap();
    assert_eq!(doc.endpoint.name, "beijing.edge1");
    assert_eq!(doc.endpoint.subnets, vec![subnet]);
    assert_eq!(doc.peer_names().first(), Some(&"cloud-connector"));

    assert!(h.plane.engine().is_converged("edge1"));
    h.stop().await;
}

#[tokio::test]
async fn deleted_node_is_torn_down() {
    let h = Harness::start(|c| c.apply_node(edge_node("edge1", "10.20.40.181"))).await;
    eventually("agent workload", || h.has_workload(&agent_workload_name("edge1"))).await;

    h.cluster.mark_node_deleting("edge1").unwrap();

    eventually("teardown", || !h.plane.engine().is_converged("edge1")).await;
    assert!(!h.has_workload(&agent_workload_name("edge1")));
    assert!(!h.has_secret(&agent_tls_name("edge1")));
    assert!(h.document(&agent_config_name("edge1")).is_none());
    assert!(h.plane.store().get_endpoint("beijing.edge1").is_none());

    h.stop().await;
}

#[tokio::test]
async fn community_members_become_peers() {
    let h = Harness::start(|c| {
        c.apply_node(edge_node("edge1", "10.20.40.181"));
        c.apply_node(edge_node("edge2", "10.20.40.182"));
        c.apply_node(edge_node("edge3", "10.20.40.183"));
    })
    .await;

    for name in ["edge1", "edge2", "edge3"] {
        eventually("agent workload", || h.has_workload(&agent_workload_name(name))).await;
    }

    h.cluster.apply_community(CommunityObject {
        name: "team-a".to_string(),
        members: vec!["beijing.edge1".to_string(), "beijing.edge2".to_string()],
        deleting: false,
    });

    eventually("edge1 peers edge2", || {
        h.document(&agent_config_name("edge1"))
            .is_some_and(|d| d.peer_names() == ["cloud-connector", "beijing.edge2"])
    })
    .await;
    eventually("edge2 peers edge1", || {
        h.document(&agent_config_name("edge2"))
            .is_some_and(|d| d.peer_names() == ["cloud-connector", "beijing.edge1"])
    })
    .await;
    let edge3 = h.document(&agent_config_name("edge3")).unwrap();
    assert_eq!(edge3.peer_names(), ["cloud-connector"]);

    h.cluster.delete_community("team-a");
    eventually("edge1 loses edge2", || {
        h.document(&agent_config_name("edge1"))
            .is_some_and(|d| d.peer_names() == ["cloud-connector"])
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn connector_document_lists_edge_endpoints_and_cloud_subnets() {
    let h = Harness::start(|c| {
        c.apply_node(edge_node("edge1", "10.20.40.181"));
        c.apply_node(
            Node::new("cloud1")
                .with_internal_ip("10.20.8.11")
                .with_pod_cidr("10.233.64.0/24"),
        );
    })
    .await;

    eventually("connector document lists edge1", || {
        h.document("cloud-tunnels-config")
            .is_some_and(|d| d.peer_names() == ["beijing.edge1"])
    })
    .await;

    let doc = h.document("cloud-tunnels-config").unwrap();
    assert_eq!(doc.endpoint.name, "cloud-connector");
    assert_eq!(
        doc.endpoint.subnets,
        vec!["10.233.0.0/18".to_string(), "10.233.64.0/24".to_string()]
    );
    assert_eq!(doc.endpoint.node_subnets, vec!["10.20.8.11".to_string()]);
    assert!(h.has_secret("cloud-connector-tls"));

    h.stop().await;
}

#[tokio::test]
async fn agents_follow_gateway_changes() {
    let h = Harness::start(|c| c.apply_node(edge_node("edge1", "10.20.40.181"))).await;
    eventually("agent workload", || h.has_workload(&agent_workload_name("edge1"))).await;

    h.cluster.apply_node(
        Node::new("cloud1")
            .with_internal_ip("10.20.8.11")
            .with_pod_cidr("10.233.64.0/24"),
    );

    eventually("agent document carries new gateway subnet", || {
        h.document(&agent_config_name("edge1")).is_some_and(|d| {
            d.peers
                .first()
                .is_some_and(|gw| gw.subnets.iter().any(|s| s == "10.233.64.0/24"))
        })
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn existing_subnets_are_kept_and_never_reissued() {
    let h = Harness::start(|c| {
        c.apply_node(
            edge_node("edge1", "10.20.40.181").with_annotation(KEY_POD_SUBNETS, "2.2.7.0/24"),
        );
        c.apply_node(edge_node("edge2", "10.20.40.182"));
    })
    .await;

    eventually("both workloads", || {
        h.has_workload(&agent_workload_name("edge1"))
            && h.has_workload(&agent_workload_name("edge2"))
    })
    .await;

    let edge1 = h.cluster.get_node("edge1").await.unwrap();
    assert_eq!(edge1.annotations.get(KEY_POD_SUBNETS).unwrap(), "2.2.7.0/24");
    let edge2 = h.cluster.get_node("edge2").await.unwrap();
    assert_ne!(edge2.annotations.get(KEY_POD_SUBNETS).unwrap(), "2.2.7.0/24");

    h.stop().await;
}

#[tokio::test]
async fn published_mediator_reaches_agent_and_connector_documents() {
    let h = Harness::start(|c| c.apply_node(edge_node("edge1", "10.20.40.181"))).await;
    eventually("agent workload", || h.has_workload(&agent_workload_name("edge1"))).await;

    h.cluster.apply_endpoint(Endpoint {
        id: "CN=mediator".to_string(),
        name: "mediator".to_string(),
        public_addresses: vec!["mediator.example.com".to_string()],
        subnets: vec!["10.10.0.0/24".to_string()],
        node_subnets: vec!["10.10.0.1".to_string()],
        endpoint_type: EndpointType::Mediator,
    });

    eventually("agent document names the mediator", || {
        h.document(&agent_config_name("edge1"))
            .is_some_and(|d| d.mediator.is_some_and(|m| m.name == "mediator"))
    })
    .await;
    eventually("connector document names the mediator", || {
        h.document("cloud-tunnels-config")
            .is_some_and(|d| d.mediator.is_some_and(|m| m.name == "mediator"))
    })
    .await;

    let agent = h.document(&agent_config_name("edge1")).unwrap();
    assert_eq!(agent.peer_names(), ["cloud-connector"]);
    let connector = h.document("cloud-tunnels-config").unwrap();
    assert_eq!(connector.peer_names(), ["beijing.edge1"]);
    assert!(h.plane.endpoints().loaded().contains("mediator"));

    h.cluster.delete_endpoint("mediator");
    eventually("agent document drops the mediator", || {
        h.document(&agent_config_name("edge1"))
            .is_some_and(|d| d.mediator.is_none())
    })
    .await;

    h.stop().await;
}
