//! Names of the artifacts generated for an edge node.

pub fn agent_config_name(node_name: &str) -> String {
    format!("tunnelgrid-agent-config-{node_name}")
}

pub fn agent_tls_name(node_name: &str) -> String {
    format!("tunnelgrid-agent-tls-{node_name}")
}

pub fn agent_workload_name(node_name: &str) -> String {
    format!("tunnelgrid-agent-{node_name}")
}
