//! Static cluster layout shared by every server and client process.
//!
//! The cluster file lists the leader first and the followers after it:
//!
//! ```json
//! {
//!   "leader":    { "ip": "127.0.0.1", "port": 9000 },
//!   "followers": [ { "ip": "127.0.0.1", "port": 9001, "cmd_port": 9101 } ]
//! }
//! ```
//!
//! A node's position in that list is its server index; index 0 is always the
//! leader. There is no election, so the role never changes at runtime.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

/// Whether a node is authoritative for the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Leader,
    Follower,
}

impl NodeRole {
    /// The first node in the cluster file leads; every other node follows.
    pub fn for_index(index: usize) -> Self {
        if index == 0 {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Leader => f.write_str("leader"),
            NodeRole::Follower => f.write_str("follower"),
        }
    }
}

/// One entry of the cluster file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_port: Option<u16>,
}

impl NodeEntry {
    pub fn new(ip: impl Into<String>, port: u16, cmd_port: Option<u16>) -> Self {
        Self {
            ip: ip.into(),
            port,
            cmd_port,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ClusterFile {
    leader: NodeEntry,
    #[serde(default)]
    followers: Vec<NodeEntry>,
}

/// A validated cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub index: usize,
    pub role: NodeRole,
    pub ip: String,
    pub client_port: u16,
    /// Present on followers only.
    pub replication_port: Option<u16>,
}

impl NodeInfo {
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.ip, self.client_port)
    }

    pub fn replication_addr(&self) -> Option<String> {
        let port = self.replication_port?;
        Some(format!("{}:{}", self.ip, port))
    }
}

/// Ordered, read-only list of cluster members.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    nodes: Vec<NodeInfo>,
}

impl ClusterTopology {
    pub fn new(leader: NodeEntry, followers: Vec<NodeEntry>) -> Result<Self> {
        let mut nodes = Vec::with_capacity(followers.len() + 1);
        nodes.push(NodeInfo {
            index: 0,
            role: NodeRole::for_index(0),
            ip: leader.ip,
            client_port: leader.port,
            // The leader never receives replicated writes.
            replication_port: None,
        });

        for (offset, entry) in followers.into_iter().enumerate() {
            let index = offset + 1;
            let cmd_port = entry
                .cmd_port
                .ok_or_else(|| anyhow!("follower #{index} is missing cmd_port"))?;
            ensure!(
                cmd_port != entry.port,
                "follower #{index} uses port {cmd_port} for both clients and replication"
            );
            nodes.push(NodeInfo {
                index,
                role: NodeRole::for_index(index),
                ip: entry.ip,
                client_port: entry.port,
                replication_port: Some(cmd_port),
            });
        }

        Ok(Self { nodes })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: ClusterFile =
            serde_json::from_str(text).context("cluster file is not valid JSON")?;
        Self::new(file.leader, file.followers)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            path.exists(),
            "server configuration file {} not found",
            path.display()
        );
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid cluster file {}", path.display()))
    }

    pub fn leader(&self) -> &NodeInfo {
        &self.nodes[0]
    }

    pub fn followers(&self) -> &[NodeInfo] {
        &self.nodes[1..]
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Result<&NodeInfo> {
        self.nodes.get(index).ok_or_else(|| {
            anyhow!(
                "{index} is out of server id range [0, {})",
                self.nodes.len()
            )
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const THREE_NODES: &str = r#"{
        "leader": {"ip": "127.0.0.1", "port": 9000},
        "followers": [
            {"ip": "127.0.0.1", "port": 9001, "cmd_port": 9101},
            {"ip": "10.0.0.2", "port": 9002, "cmd_port": 9102}
        ]
    }"#;

    #[test]
    fn first_entry_is_the_leader() {
        let topology = ClusterTopology::from_json(THREE_NODES).unwrap();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.leader().role, NodeRole::Leader);
        assert_eq!(topology.leader().client_addr(), "127.0.0.1:9000");
        assert_eq!(topology.leader().replication_addr(), None);

        let followers = topology.followers();
        assert_eq!(followers.len(), 2);
        assert!(followers.iter().all(|node| node.role == NodeRole::Follower));
        assert_eq!(followers[1].index, 2);
        assert_eq!(
            followers[1].replication_addr().as_deref(),
            Some("10.0.0.2:9102")
        );
    }

    #[test]
    fn role_follows_position() {
        assert_eq!(NodeRole::for_index(0), NodeRole::Leader);
        assert_eq!(NodeRole::for_index(1), NodeRole::Follower);
        assert_eq!(NodeRole::for_index(7), NodeRole::Follower);
    }

    #[test]
    fn followers_need_a_distinct_cmd_port() {
        let missing = r#"{"leader": {"ip": "h", "port": 1}, "followers": [{"ip": "h", "port": 2}]}"#;
        assert!(ClusterTopology::from_json(missing).is_err());

        let shared = r#"{"leader": {"ip": "h", "port": 1},
            "followers": [{"ip": "h", "port": 2, "cmd_port": 2}]}"#;
        assert!(ClusterTopology::from_json(shared).is_err());
    }

    #[test]
    fn leader_only_cluster_is_valid() {
        let topology = ClusterTopology::from_json(r#"{"leader": {"ip": "h", "port": 1}}"#).unwrap();
        assert_eq!(topology.len(), 1);
        assert!(topology.followers().is_empty());
    }

    #[test]
    fn node_lookup_is_range_checked() {
        let topology = ClusterTopology::from_json(THREE_NODES).unwrap();
        assert!(topology.node(2).is_ok());
        let err = topology.node(3).unwrap_err();
        assert_eq!(err.to_string(), "3 is out of server id range [0, 3)");
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(THREE_NODES.as_bytes()).unwrap();
        let topology = ClusterTopology::load(file.path()).unwrap();
        assert_eq!(topology.len(), 3);

        assert!(ClusterTopology::load("/definitely/not/here/server.cfg").is_err());
    }
}
