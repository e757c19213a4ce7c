//! AgentEngine: runs the handler chain for edge nodes.
//!
//! A node is converged by running every handler in order, and torn down
//! by undoing every handler in reverse order. The engine decides which of
//! the two applies from the node's current state:
//!
//! - gone, being deleted, or no longer labelled as an edge node → teardown
//! - no usable address yet → skip
//! - otherwise → converge
//!
//! Events for different nodes are processed concurrently. Events for the
//! same node are serialized: a node already being reconciled is marked
//! dirty and reconciled once more when the current pass ends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use tunnelgrid_cluster::{ClusterClient, Node, NodeEvent};

use crate::error::{HandlerError, HandlerResult};
use crate::handler::{ChainContext, Handler, Step};

const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// End-to-end classification of one converge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Success,
    RestartRequired,
    Failed,
}

/// What happened during one converge run.
#[derive(Debug, Default)]
pub struct ConvergeReport {
    /// Some handler asked for a dependent restart.
    pub restart_required: bool,
    /// Some handler asked for another pass.
    pub requeue: bool,
    /// Handlers invoked, in order.
    pub handlers_run: Vec<&'static str>,
    /// The error that stopped the chain, if any.
    pub error: Option<HandlerError>,
}

impl ConvergeReport {
    pub fn outcome(&self) -> ChainOutcome {
        if self.error.is_some() {
            ChainOutcome::Failed
        } else if self.restart_required {
            ChainOutcome::RestartRequired
        } else {
            ChainOutcome::Success
        }
    }
}

/// What [`AgentEngine::reconcile`] did for a node.
#[derive(Debug)]
pub enum Reconciled {
    Converged(ConvergeReport),
    TornDown,
    /// The node has no usable address yet.
    Skipped,
}

/// Drives the handler chain for every edge node.
pub struct AgentEngine {
    cluster: Arc<dyn ClusterClient>,
    handlers: Vec<Arc<dyn Handler>>,
    /// Labels identifying edge nodes.
    edge_labels: BTreeMap<String, String>,
    /// Nodes the chain has started for at least once and not torn down since.
    converged: Mutex<HashSet<String>>,
    /// Nodes with a reconcile in progress → whether another pass is pending.
    in_flight: Mutex<HashMap<String, bool>>,
    requeue_delay: Duration,
}

impl AgentEngine {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        handlers: Vec<Arc<dyn Handler>>,
        edge_labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cluster,
            handlers,
            edge_labels,
            converged: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Handler names in chain order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn is_edge_node(&self, node: &Node) -> bool {
        node.matches_labels(&self.edge_labels)
    }

    pub fn is_converged(&self, node_name: &str) -> bool {
        self.converged.lock().contains(node_name)
    }

    /// Nodes currently holding converged state, sorted.
    pub fn converged_nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.converged.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Bring one node in line with its current cluster state.
    pub async fn reconcile(&self, node_name: &str) -> HandlerResult<Reconciled> {
        let node = match self.cluster.get_node(node_name).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                info!(node = %node_name, "node is gone, tearing down");
                self.teardown(node_name).await?;
                return Ok(Reconciled::TornDown);
            }
            Err(e) => {
                error!(node = %node_name, error = %e, "unable to get node");
                return Err(e.into());
            }
        };

        if node.deleting {
            info!(node = %node_name, "node is terminating, tearing down");
            self.teardown(node_name).await?;
            return Ok(Reconciled::TornDown);
        }

        if !self.is_edge_node(&node) {
            if self.is_converged(node_name) {
                info!(node = %node_name, "node is no longer an edge node, tearing down");
                self.teardown(node_name).await?;
                return Ok(Reconciled::TornDown);
            }
            return Ok(Reconciled::Skipped);
        }

        if !has_usable_address(&node) {
            debug!(node = %node_name, "node has no address yet, skipping");
            return Ok(Reconciled::Skipped);
        }

        Ok(Reconciled::Converged(self.converge(&node).await))
    }

    /// Run every handler in order.
    ///
    /// A restart request is remembered and the chain continues; any error
    /// stops the chain.
    pub async fn converge(&self, node: &Node) -> ConvergeReport {
        self.converged.lock().insert(node.name.clone());

        let mut ctx = ChainContext::default();
        let mut report = ConvergeReport::default();

        for handler in &self.handlers {
            report.handlers_run.push(handler.name());
            match handler.converge(node, &mut ctx).await {
                Ok(Step::Done) => {}
                Ok(Step::RestartRequired) => {
                    debug!(node = %node.name, handler = handler.name(), "restart required");
                    ctx.restart_required = true;
                }
                Err(e) => {
                    if e.is_requeue() {
                        debug!(node = %node.name, handler = handler.name(), "requeue requested");
                    } else {
                        error!(node = %node.name, handler = handler.name(), error = %e, "handler failed");
                    }
                    report.error = Some(e);
                    break;
                }
            }
        }

        report.restart_required = ctx.restart_required;
        report.requeue = ctx.requeue;
        debug!(node = %node.name, outcome = ?report.outcome(), "chain finished");
        report
    }

    /// Undo every handler in reverse order.
    ///
    /// Nodes the engine never converged are left alone. The first failing
    /// undo stops the unwind and keeps the node marked as converged, so
    /// earlier handlers' resources stay in place until a later attempt.
    pub async fn teardown(&self, node_name: &str) -> HandlerResult<()> {
        if !self.is_converged(node_name) {
            debug!(node = %node_name, "node was never converged, nothing to tear down");
            return Ok(());
        }

        for handler in self.handlers.iter().rev() {
            if let Err(e) = handler.undo(node_name).await {
                error!(node = %node_name, handler = handler.name(), error = %e, "undo failed");
                return Err(e);
            }
        }

        self.converged.lock().remove(node_name);
        info!(node = %node_name, "node torn down");
        Ok(())
    }

    /// Process node events until `shutdown` fires or the stream closes.
    ///
    /// Every existing node is reconciled once on start.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<NodeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.resync().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event.node_name().to_string()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "node events lagged, resyncing");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("node event stream closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("agent engine shutting down");
                    break;
                }
            }
        }
    }

    /// Queue every listed node plus every node still marked converged.
    pub async fn resync(self: &Arc<Self>) {
        let mut names: HashSet<String> = self.converged.lock().iter().cloned().collect();
        match self.cluster.list_nodes().await {
            Ok(nodes) => names.extend(nodes.into_iter().map(|n| n.name)),
            Err(e) => error!(error = %e, "unable to list nodes"),
        }
        for name in names {
            self.dispatch(name);
        }
    }

    /// Reconcile `node_name` in the background, at most one pass at a time per node.
    pub fn dispatch(self: &Arc<Self>, node_name: String) {
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(pending) = in_flight.get_mut(&node_name) {
                *pending = true;
                return;
            }
            in_flight.insert(node_name.clone(), false);
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let again = match engine.reconcile(&node_name).await {
                    Ok(Reconciled::Converged(report)) => {
                        report.requeue || report.error.as_ref().is_some_and(HandlerError::is_requeue)
                    }
                    Ok(_) => false,
                    Err(e) => e.is_requeue(),
                };
                if again {
                    tokio::time::sleep(engine.requeue_delay).await;
                    continue;
                }

                let mut in_flight = engine.in_flight.lock();
                match in_flight.get_mut(&node_name) {
                    Some(pending) if *pending => *pending = false,
                    _ => {
                        in_flight.remove(&node_name);
                        break;
                    }
                }
            }
        });
    }

    /// Nodes with a reconcile in progress.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

fn has_usable_address(node: &Node) -> bool {
    node.internal_ips.iter().any(|ip| !ip.is_empty())
}
