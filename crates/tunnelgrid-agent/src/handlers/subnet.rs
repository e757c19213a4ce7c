//! Subnet handlers: give every edge node its pod subnets.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, error, info, warn};

use tunnelgrid_cluster::{ClusterClient, Node};
use tunnelgrid_core::constants::KEY_POD_SUBNETS;
use tunnelgrid_ipam::SubnetAllocator;
use tunnelgrid_store::TopologyStore;

use crate::endpoint::EndpointFactory;
use crate::error::HandlerResult;
use crate::handler::{ChainContext, Handler, Step};

/// Allocates one block per pool and records it on the node.
///
/// A node's subnets are valid when it holds exactly one parseable block
/// inside each pool. Valid subnets are recorded (so the allocator learns
/// about allocations made before a restart) and the endpoint is saved.
/// Otherwise fresh blocks are allocated and written to the node's
/// subnet annotation before the endpoint is saved.
pub struct SubnetHandler {
    cluster: Arc<dyn ClusterClient>,
    store: TopologyStore,
    allocators: Vec<Arc<SubnetAllocator>>,
    factory: EndpointFactory,
}

impl SubnetHandler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        store: TopologyStore,
        allocators: Vec<Arc<SubnetAllocator>>,
        factory: EndpointFactory,
    ) -> Self {
        Self {
            cluster,
            store,
            allocators,
            factory,
        }
    }

    /// Record the allocations already present on `nodes` and load their endpoints.
    ///
    /// Run once before the engine starts so fresh allocations never collide
    /// with blocks owned by nodes that have not been reconciled yet. Blocks
    /// are recorded for every node holding them; only endpoints that pass
    /// validation are stored, the rest wait for their node's reconcile.
    pub fn restore<'a>(&self, nodes: impl IntoIterator<Item = &'a Node>) -> usize {
        let mut restored = 0;
        for node in nodes {
            let endpoint = self.factory.new_endpoint(node);
            let Some(blocks) = self.valid_blocks(&endpoint.subnets) else {
                continue;
            };
            self.record_all(&blocks);
            restored += 1;

            match endpoint.validate() {
                Ok(()) => self.store.save_endpoint_as_local(endpoint),
                Err(reason) => {
                    warn!(node = %node.name, error = %reason, "restored endpoint is invalid, not stored");
                }
            }
        }

        for alloc in &self.allocators {
            let blocks = alloc.allocated_blocks();
            debug!(pool = %alloc.pool(), count = blocks.len(), ?blocks, "pool allocations after restore");
        }
        info!(restored, "restored subnet allocations");
        restored
    }

    /// Parsed blocks when `cidrs` holds exactly one block inside each pool.
    fn valid_blocks(&self, cidrs: &[String]) -> Option<Vec<IpNet>> {
        if cidrs.is_empty() || cidrs.len() != self.allocators.len() {
            return None;
        }

        let blocks: Vec<IpNet> = cidrs
            .iter()
            .map(|c| c.parse::<IpNet>())
            .collect::<Result<_, _>>()
            .ok()?;

        let one_per_pool = self
            .allocators
            .iter()
            .all(|alloc| blocks.iter().filter(|b| alloc.contains(b)).count() == 1);

        one_per_pool.then_some(blocks)
    }

    fn record_all(&self, blocks: &[IpNet]) {
        for block in blocks {
            for alloc in self.allocators.iter().filter(|a| a.contains(block)) {
                if let Err(e) = alloc.record(block) {
                    warn!(subnet = %block, error = %e, "failed to record subnet");
                }
            }
        }
    }

    /// Best-effort release of whatever in-range blocks `cidrs` names.
    fn reclaim_cidrs(&self, cidrs: &[String], keep: &[IpNet]) {
        for cidr in cidrs {
            let Ok(block) = cidr.parse::<IpNet>() else {
                debug!(subnet = %cidr, "unparseable subnet, not reclaiming");
                continue;
            };
            if keep.contains(&block.trunc()) {
                continue;
            }
            for alloc in self.allocators.iter().filter(|a| a.contains(&block)) {
                let _ = alloc.reclaim(&block);
                debug!(subnet = %block, "subnet reclaimed");
            }
        }
    }

    fn reclaim_blocks(&self, blocks: &[IpNet]) {
        for (alloc, block) in self.allocators.iter().zip(blocks) {
            let _ = alloc.reclaim(block);
        }
    }

    /// Take one block from every pool, giving them all back if any pool fails.
    fn allocate_all(&self, seed_key: &str) -> HandlerResult<Vec<IpNet>> {
        let mut blocks = Vec::with_capacity(self.allocators.len());
        for alloc in &self.allocators {
            match alloc.get_free_subnet_block(seed_key) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    error!(key = seed_key, pool = %alloc.pool(), error = %e, "failed to allocate subnet");
                    self.reclaim_blocks(&blocks);
                    return Err(e.into());
                }
            }
        }
        Ok(blocks)
    }
}

#[async_trait]
impl Handler for SubnetHandler {
    fn name(&self) -> &'static str {
        "subnet"
    }

    async fn converge(&self, node: &Node, _ctx: &mut ChainContext) -> HandlerResult<Step> {
        let current = self.factory.new_endpoint(node);

        if let Some(blocks) = self.valid_blocks(&current.subnets) {
            self.record_all(&blocks);
            self.store.save_endpoint_as_local(current);
            return Ok(Step::Done);
        }

        debug!(node = %node.name, "node needs subnet allocation");
        let blocks = self.allocate_all(&current.name)?;
        let value = blocks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let annotations = BTreeMap::from([(KEY_POD_SUBNETS.to_string(), value.clone())]);
        let updated = match self
            .cluster
            .update_node_annotations(&node.name, annotations)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(node = %node.name, subnets = %value, error = %e, "failed to record subnet allocation");
                self.reclaim_blocks(&blocks);
                return Err(e.into());
            }
        };

        info!(node = %node.name, subnets = %value, "subnets allocated");
        self.store.save_endpoint_as_local(self.factory.new_endpoint(&updated));
        self.reclaim_cidrs(&current.subnets, &blocks);

        Ok(Step::Done)
    }

    async fn undo(&self, node_name: &str) -> HandlerResult<()> {
        let name = self.factory.endpoint_name(node_name);
        let Some(endpoint) = self.store.get_endpoint(&name) else {
            return Ok(());
        };

        self.store.delete_endpoint(&name);
        self.reclaim_cidrs(&endpoint.subnets, &[]);
        debug!(node = %node_name, subnets = ?endpoint.subnets, "endpoint removed, subnets reclaimed");
        Ok(())
    }
}

/// Trusts the pod CIDRs the node reports and only tracks the endpoint.
pub struct RawSubnetHandler {
    store: TopologyStore,
    factory: EndpointFactory,
}

impl RawSubnetHandler {
    pub fn new(store: TopologyStore, factory: EndpointFactory) -> Self {
        Self { store, factory }
    }
}

#[async_trait]
impl Handler for RawSubnetHandler {
    fn name(&self) -> &'static str {
        "raw-subnet"
    }

    async fn converge(&self, node: &Node, _ctx: &mut ChainContext) -> HandlerResult<Step> {
        self.store.save_endpoint_as_local(self.factory.new_endpoint(node));
        Ok(Step::Done)
    }

    async fn undo(&self, node_name: &str) -> HandlerResult<()> {
        self.store.delete_endpoint(&self.factory.endpoint_name(node_name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SubnetSource;
    use tunnelgrid_cluster::{MemoryCluster, Operation};

    fn factory(source: SubnetSource) -> EndpointFactory {
        EndpointFactory::new("tunnelgrid", "CN={node}", source)
    }

    fn setup(pools: &[(&str, u8)]) -> (MemoryCluster, TopologyStore, Vec<Arc<SubnetAllocator>>, SubnetHandler) {
        let cluster = MemoryCluster::new();
        let store = TopologyStore::new();
        let allocators: Vec<Arc<SubnetAllocator>> = pools
            .iter()
            .map(|(cidr, prefix)| Arc::new(SubnetAllocator::new(cidr, *prefix).unwrap()))
            .collect();
        let handler = SubnetHandler::new(
            Arc::new(cluster.clone()),
            store.clone(),
            allocators.clone(),
            factory(SubnetSource::Annotation),
        );
        (cluster, store, allocators, handler)
    }

    fn edge(name: &str) -> Node {
        Node::new(name).with_internal_ip("10.20.40.181")
    }

    async fn converge(handler: &SubnetHandler, node: &Node) -> HandlerResult<Step> {
        handler.converge(node, &mut ChainContext::default()).await
    }

    #[tokio::test]
    async fn allocates_and_annotates_node() {
        let (cluster, store, allocators, handler) = setup(&[("2.2.0.0/16", 26)]);
        let node = edge("edge1");
        cluster.apply_node(node.clone());

        assert_eq!(converge(&handler, &node).await.unwrap(), Step::Done);

        let node = cluster.get_node("edge1").await.unwrap();
        let block: IpNet = node.annotations[KEY_POD_SUBNETS].parse().unwrap();
        assert!(allocators[0].is_allocated(&block));

        let ep = store.get_endpoint("tunnelgrid.edge1").unwrap();
        assert_eq!(ep.subnets, vec![block.to_string()]);
        assert!(store.get_local_endpoint_names().contains("tunnelgrid.edge1"));
    }

    #[tokio::test]
    async fn valid_subnets_are_kept_and_recorded() {
        let (cluster, store, allocators, handler) = setup(&[("2.2.0.0/16", 26)]);
        let node = edge("edge1").with_annotation(KEY_POD_SUBNETS, "2.2.5.0/26");
        cluster.apply_node(node.clone());

        converge(&handler, &node).await.unwrap();

        assert!(allocators[0].is_allocated(&"2.2.5.0/26".parse().unwrap()));
        assert_eq!(allocators[0].allocated_count(), 1);
        assert_eq!(store.get_endpoint("tunnelgrid.edge1").unwrap().subnets, vec!["2.2.5.0/26"]);
    }

    #[tokio::test]
    async fn out_of_pool_subnets_are_replaced() {
        let (cluster, store, allocators, handler) = setup(&[("2.2.0.0/16", 26)]);
        let node = edge("edge1").with_annotation(KEY_POD_SUBNETS, "3.3.0.0/26");
        cluster.apply_node(node.clone());

        converge(&handler, &node).await.unwrap();

        let ep = store.get_endpoint("tunnelgrid.edge1").unwrap();
        let block: IpNet = ep.subnets[0].parse().unwrap();
        assert!(allocators[0].contains(&block));
    }

    #[tokio::test]
    async fn dual_stack_gets_one_block_per_pool() {
        let (cluster, store, allocators, handler) =
            setup(&[("2.2.0.0/16", 26), ("fd85:ee78:d8a6:8607::/64", 120)]);
        // Holding only an IPv4 block is not enough.
        let node = edge("edge1").with_annotation(KEY_POD_SUBNETS, "2.2.5.0/26");
        cluster.apply_node(node.clone());

        converge(&handler, &node).await.unwrap();

        let ep = store.get_endpoint("tunnelgrid.edge1").unwrap();
        assert_eq!(ep.subnets.len(), 2);
        for (alloc, subnet) in allocators.iter().zip(&ep.subnets) {
            assert!(alloc.is_allocated(&subnet.parse().unwrap()));
        }
        // The old partial allocation is released.
        assert!(!allocators[0].is_allocated(&"2.2.5.0/26".parse().unwrap()) || ep.subnets[0] == "2.2.5.0/26");
    }

    #[tokio::test]
    async fn failed_annotation_update_reclaims_blocks() {
        let (cluster, store, allocators, handler) =
            setup(&[("2.2.0.0/16", 26), ("fd85:ee78:d8a6:8607::/64", 120)]);
        let node = edge("edge1");
        cluster.apply_node(node.clone());
        cluster.fail_next(Operation::UpdateNodeAnnotations, 1);

        assert!(converge(&handler, &node).await.is_err());
        assert_eq!(allocators[0].allocated_count(), 0);
        assert_eq!(allocators[1].allocated_count(), 0);
        assert!(store.get_endpoint("tunnelgrid.edge1").is_none());
    }

    #[tokio::test]
    async fn exhausted_second_pool_releases_first() {
        let (cluster, _store, allocators, handler) =
            setup(&[("2.2.0.0/16", 26), ("10.9.0.0/24", 25)]);
        allocators[1].record(&"10.9.0.0/25".parse().unwrap()).unwrap();
        allocators[1].record(&"10.9.0.128/25".parse().unwrap()).unwrap();
        let node = edge("edge1");
        cluster.apply_node(node.clone());

        let err = converge(&handler, &node).await.unwrap_err();
        assert!(matches!(err, crate::HandlerError::Ipam(ref e) if e.is_exhausted()));
        assert_eq!(allocators[0].allocated_count(), 0);
    }

    #[tokio::test]
    async fn undo_removes_endpoint_and_reclaims() {
        let (cluster, store, allocators, handler) = setup(&[("2.2.0.0/16", 26)]);
        let node = edge("edge1");
        cluster.apply_node(node.clone());
        converge(&handler, &node).await.unwrap();

        handler.undo("edge1").await.unwrap();
        assert!(store.get_endpoint("tunnelgrid.edge1").is_none());
        assert_eq!(allocators[0].allocated_count(), 0);

        // Idempotent.
        handler.undo("edge1").await.unwrap();
    }

    #[tokio::test]
    async fn restore_records_existing_allocations() {
        let (_cluster, store, allocators, handler) = setup(&[("2.2.0.0/16", 26)]);
        let nodes = vec![
            edge("edge1").with_annotation(KEY_POD_SUBNETS, "2.2.0.64/26"),
            edge("edge2"),
        ];

        assert_eq!(handler.restore(&nodes), 1);
        assert!(allocators[0].is_allocated(&"2.2.0.64/26".parse().unwrap()));
        assert!(store.get_endpoint("tunnelgrid.edge1").is_some());
    }

    #[tokio::test]
    async fn restore_keeps_blocks_of_unusable_endpoints_out_of_the_store() {
        let (_cluster, store, allocators, handler) = setup(&[("2.2.0.0/16", 26)]);
        let nodes = vec![
            edge("edge1").with_annotation(KEY_POD_SUBNETS, "2.2.0.64/26"),
            // No addresses at all: the endpoint cannot be dialed.
            Node::new("edge2").with_annotation(KEY_POD_SUBNETS, "2.2.1.0/26"),
        ];

        assert_eq!(handler.restore(&nodes), 2);
        assert_eq!(
            allocators[0].allocated_blocks(),
            vec!["2.2.0.64/26".parse::<IpNet>().unwrap(), "2.2.1.0/26".parse().unwrap()]
        );
        assert!(store.get_endpoint("tunnelgrid.edge1").is_some());
        assert!(store.get_endpoint("tunnelgrid.edge2").is_none());
        assert_eq!(store.get_local_endpoint_names().len(), 1);
    }

    #[tokio::test]
    async fn raw_handler_tracks_reported_cidrs() {
        let store = TopologyStore::new();
        let handler = RawSubnetHandler::new(store.clone(), factory(SubnetSource::PodCidrs));
        let node = edge("edge1").with_pod_cidr("10.244.3.0/24");

        handler.converge(&node, &mut ChainContext::default()).await.unwrap();
        assert_eq!(
            store.get_endpoint("tunnelgrid.edge1").unwrap().subnets,
            vec!["10.244.3.0/24"]
        );

        handler.undo("edge1").await.unwrap();
        assert!(store.get_endpoint("tunnelgrid.edge1").is_none());
    }
}
