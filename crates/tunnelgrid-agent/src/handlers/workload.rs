//! Agent workload handler.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use tunnelgrid_cluster::{
    ClusterClient, Container, Node, ObjectMeta, Volume, VolumeSource, Workload, WorkloadSpec,
};
use tunnelgrid_core::constants::{
    APP_AGENT, APP_OPERATOR, KEY_APP, KEY_CREATED_BY, KEY_NODE, KEY_SPEC_HASH, TUNNELS_FILE_NAME,
};

use crate::error::{HandlerError, HandlerResult};
use crate::handler::{ChainContext, Handler, Step};
use crate::names::{agent_config_name, agent_tls_name, agent_workload_name};

const SPEC_HASH_LEN: usize = 16;
const CONFIG_DIR: &str = "/etc/tunnelgrid";
const IPSEC_DIR: &str = "/etc/ipsec.d";

/// Images and arguments for agent workloads.
#[derive(Debug, Clone)]
pub struct AgentTemplate {
    pub image: String,
    pub strongswan_image: String,
    /// Extra `--key=value` arguments for the agent container.
    pub args: BTreeMap<String, String>,
}

impl AgentTemplate {
    /// The workload spec for `node`.
    pub fn spec_for(&self, node_name: &str) -> WorkloadSpec {
        let mut args = vec![format!("--tunnels-conf={CONFIG_DIR}/{TUNNELS_FILE_NAME}")];
        args.extend(self.args.iter().map(|(k, v)| format!("--{k}={v}")));

        WorkloadSpec {
            node_name: node_name.to_string(),
            host_network: true,
            containers: vec![
                Container {
                    name: "agent".to_string(),
                    image: self.image.clone(),
                    args,
                    privileged: true,
                    mounts: vec![
                        ("netconf".to_string(), CONFIG_DIR.to_string()),
                        ("var-run".to_string(), "/var/run".to_string()),
                        ("lib-modules".to_string(), "/lib/modules".to_string()),
                        ("ipsec-d".to_string(), IPSEC_DIR.to_string()),
                    ],
                },
                Container {
                    name: "strongswan".to_string(),
                    image: self.strongswan_image.clone(),
                    args: Vec::new(),
                    privileged: true,
                    mounts: vec![
                        ("var-run".to_string(), "/var/run".to_string()),
                        ("ipsec-d".to_string(), IPSEC_DIR.to_string()),
                    ],
                },
            ],
            volumes: vec![
                Volume {
                    name: "netconf".to_string(),
                    source: VolumeSource::Config(agent_config_name(node_name)),
                },
                Volume {
                    name: "ipsec-d".to_string(),
                    source: VolumeSource::Secret(agent_tls_name(node_name)),
                },
                Volume {
                    name: "var-run".to_string(),
                    source: VolumeSource::EmptyDir,
                },
                Volume {
                    name: "lib-modules".to_string(),
                    source: VolumeSource::HostPath("/lib/modules".to_string()),
                },
            ],
        }
    }
}

/// Short, stable digest of a workload spec.
pub fn spec_hash(spec: &WorkloadSpec) -> HandlerResult<String> {
    let canonical = serde_json::to_vec(spec)?;
    let mut digest = hex::encode(Sha256::digest(&canonical));
    digest.truncate(SPEC_HASH_LEN);
    Ok(digest)
}

/// Runs one agent workload per edge node.
///
/// The workload is deleted, not replaced, when it must restart; the chain
/// is requeued so the next pass creates the fresh one once the old one is
/// gone.
///
/// A restart request outlives the pass that raised it: it stays pending
/// until the old workload is deleted or a fresh one is created.
pub struct WorkloadHandler {
    namespace: String,
    cluster: Arc<dyn ClusterClient>,
    template: AgentTemplate,
    created: Mutex<HashSet<String>>,
    restart_pending: Mutex<HashSet<String>>,
}

impl WorkloadHandler {
    pub fn new(
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterClient>,
        template: AgentTemplate,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster,
            template,
            created: Mutex::new(HashSet::new()),
            restart_pending: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a restart of `node_name`'s workload is still owed.
    pub fn is_restart_pending(&self, node_name: &str) -> bool {
        self.restart_pending
            .lock()
            .contains(&agent_workload_name(node_name))
    }

    fn build(&self, name: &str, node: &Node) -> HandlerResult<Workload> {
        let spec = self.template.spec_for(&node.name);
        let hash = spec_hash(&spec)?;
        Ok(Workload {
            meta: ObjectMeta::new(&self.namespace, name)
                .with_label(KEY_APP, APP_AGENT)
                .with_label(KEY_CREATED_BY, APP_OPERATOR)
                .with_label(KEY_NODE, &node.name)
                .with_label(KEY_SPEC_HASH, hash)
                .owned_by(&node.name),
            spec,
        })
    }

    fn is_outdated(&self, current: &Workload, wanted: &Workload) -> bool {
        current.meta.labels.get(KEY_SPEC_HASH) != wanted.meta.labels.get(KEY_SPEC_HASH)
    }
}

#[async_trait]
impl Handler for WorkloadHandler {
    fn name(&self) -> &'static str {
        "workload"
    }

    async fn converge(&self, node: &Node, ctx: &mut ChainContext) -> HandlerResult<Step> {
        let name = agent_workload_name(&node.name);
        let wanted = self.build(&name, node)?;

        let restart = {
            let mut pending = self.restart_pending.lock();
            if ctx.restart_required {
                pending.insert(name.clone());
            }
            pending.contains(&name)
        };

        match self.cluster.get_workload(&self.namespace, &name).await {
            Ok(current) => {
                if current.meta.terminating {
                    return Err(HandlerError::Requeue);
                }

                if !restart && !self.is_outdated(&current, &wanted) {
                    return Ok(Step::Done);
                }

                info!(node = %node.name, workload = %name, restart, "agent workload must restart, deleting");
                if let Err(e) = self.cluster.delete_workload(&self.namespace, &name).await {
                    error!(node = %node.name, workload = %name, error = %e, "failed to delete agent workload");
                    return Err(e.into());
                }
                self.created.lock().remove(&name);
                self.restart_pending.lock().remove(&name);
                ctx.requeue = true;
                Ok(Step::Done)
            }
            Err(e) if e.is_not_found() => {
                // A missing workload we just created means the read was stale.
                if self.created.lock().remove(&name) {
                    warn!(node = %node.name, workload = %name, "agent workload already created, read may be stale");
                    return Err(HandlerError::Requeue);
                }

                debug!(node = %node.name, workload = %name, "agent workload not found, creating");
                if let Err(e) = self.cluster.create_workload(wanted).await {
                    error!(node = %node.name, workload = %name, error = %e, "failed to create agent workload");
                    return Err(e.into());
                }
                self.restart_pending.lock().remove(&name);
                self.created.lock().insert(name);
                Ok(Step::Done)
            }
            Err(e) => {
                error!(node = %node.name, workload = %name, error = %e, "failed to get agent workload");
                Err(e.into())
            }
        }
    }

    async fn undo(&self, node_name: &str) -> HandlerResult<()> {
        let name = agent_workload_name(node_name);
        self.created.lock().remove(&name);
        self.restart_pending.lock().remove(&name);
        match self.cluster.delete_workload(&self.namespace, &name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                error!(workload = %name, error = %e, "failed to delete agent workload");
                Err(e.into())
            }
        }
    }
}
