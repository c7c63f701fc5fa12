use k8s_openapi::api::core::v1 as core;
use log::{debug, info, warn};
use std::collections::BTreeMap as Map;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::watch;

pub mod watcher;


pub const VPC_LABEL: &str = "vpc.id";
pub const VPC_INTERNAL_IP_ANNOTATION: &str = "vpc.internal.ip";
pub const VPC_EXTERNAL_IP_ANNOTATION: &str = "vpc.external.ip";
pub const MASTER_LABEL: &str = "node-role.kubernetes.io/master";
pub const CLUSTER_LABEL: &str = "squids/cluster";

/// The parts of a cluster node the resolver cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Node {
    pub name: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub labels: Map<String, String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub annotations: Map<String, String>,
    /// reported addresses, in status order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}
impl Node {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// An absent annotation reads as empty.
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map_or("", String::as_str)
    }

    /// An absent VPC label reads as empty, which is a VPC of its own.
    pub fn vpc(&self) -> &str {
        self.label(VPC_LABEL).unwrap_or("")
    }

    pub fn is_master(&self) -> bool {
        self.labels.contains_key(MASTER_LABEL)
    }

    pub fn has_address(&self, ip: &str) -> bool {
        self.addresses.iter().any(|a| a == ip)
    }
}
impl TryFrom<&core::Node> for Node {
    type Error = &'static str;
    fn try_from(node: &core::Node) -> Result<Self, Self::Error> {
        let metadata = &node.metadata;
        Ok(Self {
            name: metadata.name.clone().ok_or("no name")?,
            labels: metadata.labels.clone().unwrap_or_default(),
            annotations: metadata.annotations.clone().unwrap_or_default(),
            addresses: (node.status.iter())
                .filter_map(|status| status.addresses.as_ref())
                .flatten()
                .map(|addr| addr.address.clone())
                .collect(),
        })
    }
}

pub type Nodes = Map<String, Arc<Node>>;
pub type NodesReceiver = watch::Receiver<Option<Arc<Nodes>>>;

/// Read access to the cluster nodes.
///
/// Snapshots are immutable: a store publishes new ones instead of editing them,
/// so a reader holding one always sees a consistent set of nodes.
pub trait NodeStore {
    /// `None` until the store has completed its initial sync.
    fn snapshot(&self) -> Option<Arc<Nodes>>;

    fn get(&self, name: &str) -> Option<Arc<Node>> {
        Map::get(&*self.snapshot()?, name).cloned()
    }

    fn list(&self) -> Vec<Arc<Node>> {
        (self.snapshot().iter())
            .flat_map(|nodes| nodes.values().cloned())
            .collect()
    }
}

impl NodeStore for NodesReceiver {
    fn snapshot(&self) -> Option<Arc<Nodes>> {
        self.borrow().clone()
    }
}

impl NodeStore for Arc<Nodes> {
    fn snapshot(&self) -> Option<Arc<Nodes>> {
        Some(self.clone())
    }
}

/// Queries answered from the point of view of the node this process runs on.
pub struct Context<S = NodesReceiver> {
    pub nodes: S,
    pub node_name: String,
}

impl<S: NodeStore> Context<S> {
    pub fn new(nodes: S, node_name: impl Into<String>) -> Self {
        Self {
            nodes,
            node_name: node_name.into(),
        }
    }

    /// The address to use to reach the `target` node: its internal IP when both nodes are in the
    /// same VPC, its external IP otherwise.
    pub fn next_hop(&self, target: &str) -> Option<Ipv4Addr> {
        if target.is_empty() {
            debug!("no next node given");
            return None;
        }

        let Some(nodes) = self.nodes.snapshot() else {
            warn!("node cache is not initialized, skipping next hop to {target}");
            return None;
        };

        let Some(self_node) = Map::get(&*nodes, &self.node_name) else {
            warn!("self node {} not found", self.node_name);
            return None;
        };
        let Some(next_node) = Map::get(&*nodes, target) else {
            warn!("next node {target} not found");
            return None;
        };

        if next_node.annotations.is_empty() {
            debug!("next node {target} has no annotations");
            return None;
        }

        let (scope, annotation) = if self_node.vpc() == next_node.vpc() {
            ("same", VPC_INTERNAL_IP_ANNOTATION)
        } else {
            ("diff", VPC_EXTERNAL_IP_ANNOTATION)
        };

        let value = next_node.annotation(annotation);
        if value.is_empty() {
            debug!("got {scope} vpc to next node {target}, but it has no {annotation}");
            return None;
        }

        let Some(ip) = parse_ipv4(value) else {
            warn!("next node {target} has an invalid {annotation}: {value:?}");
            return None;
        };

        info!("got {scope} vpc to next node {target}, use {annotation} {ip}");
        Some(ip)
    }

    /// Next hop to the node reporting `source_ip` as one of its addresses.
    pub fn next_hop_for_source(&self, source_ip: &str) -> Option<Ipv4Addr> {
        let nodes = self.nodes.list();
        debug!("looking up {source_ip} in {} nodes", nodes.len());

        let Some(node) = nodes.iter().find(|n| n.has_address(source_ip)) else {
            debug!("no node has address {source_ip}");
            return None;
        };

        self.next_hop(&node.name)
    }

    pub fn is_master(&self, node_name: &str) -> bool {
        let Some(node) = self.nodes.get(node_name) else {
            warn!("node {node_name} not found");
            return false;
        };
        node.is_master()
    }

    /// Whether `cluster` (`<prefix>-<suffix>`) designates the same cluster as this node's
    /// cluster label. Only suffixes are compared.
    pub fn is_same_cluster(&self, cluster: &str) -> bool {
        if cluster.is_empty() {
            return false;
        }

        let Some(self_node) = self.nodes.get(&self.node_name) else {
            warn!("self node {} not found", self.node_name);
            return false;
        };
        let Some(self_cluster) = self_node.label(CLUSTER_LABEL) else {
            debug!("self node {} has no {CLUSTER_LABEL} label", self.node_name);
            return false;
        };

        match (cluster_suffix(self_cluster), cluster_suffix(cluster)) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => {
                warn!("malformed cluster label: {self_cluster:?} vs {cluster:?}");
                false
            }
        }
    }
}

fn cluster_suffix(label: &str) -> Option<&str> {
    label.split('-').nth(1).filter(|s| !s.is_empty())
}

/// IPv4 literals, and IPv4-mapped IPv6 ones.
fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    match s.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}
