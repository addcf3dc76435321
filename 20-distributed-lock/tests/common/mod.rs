//! Shared harness for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use distributed_lock::command::{Command, Reply, Request};
use distributed_lock::message::{read_message, write_message};
use distributed_lock::node::{FanOutMode, NodeSettings};
use distributed_lock::runtime::{NodeConfig, NodeHandle, NodeListeners, spawn_node_with};
use distributed_lock::topology::{ClusterTopology, NodeEntry};
use distributed_lock::transport::RetryPolicy;

pub fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        attempts: 2,
        timeout: Duration::from_secs(2),
        backoff: Duration::from_millis(10),
        reply_timeout: None,
    }
}

pub fn settings(fan_out: FanOutMode) -> NodeSettings {
    NodeSettings {
        forward: quick_policy(),
        replicate: quick_policy(),
        fan_out,
        local_check: false,
    }
}

/// A cluster of real nodes on localhost, leader at index 0.
pub struct TestCluster {
    pub topology: Arc<ClusterTopology>,
    handles: Vec<NodeHandle>,
}

impl TestCluster {
    /// Spawns `n` nodes on ephemeral ports.
    pub fn spawn(n: usize) -> Result<Self> {
        Self::spawn_with(n, settings(FanOutMode::Sequential))
    }

    pub fn spawn_with(n: usize, settings: NodeSettings) -> Result<Self> {
        let (topology, listeners) = bind_cluster(n)?;
        let mut handles = Vec::with_capacity(n);
        for (index, listeners) in listeners.into_iter().enumerate() {
            let mut config = NodeConfig::new(index, Arc::clone(&topology));
            config.settings = settings.clone();
            handles.push(spawn_node_with(config, listeners)?);
        }
        Ok(Self { topology, handles })
    }

    pub fn node(&self, index: usize) -> &NodeHandle {
        &self.handles[index]
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Sends one request to the client endpoint of node `index`.
    pub fn send(
        &self,
        index: usize,
        command: Command,
        key: &str,
        requester: &str,
    ) -> Result<Reply> {
        let stream = TcpStream::connect(self.node(index).client_addr())?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let mut writer = stream.try_clone()?;
        write_message(&mut writer, &Request::new(command, key, requester))?;
        let mut reader = BufReader::new(stream);
        read_message::<_, Reply>(&mut reader)?
            .ok_or_else(|| anyhow::anyhow!("node {index} closed without replying"))
    }

    /// Sends a raw line and reads the reply.
    pub fn send_raw(&self, index: usize, line: &str) -> Result<Reply> {
        let mut stream = TcpStream::connect(self.node(index).client_addr())?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        let mut reader = BufReader::new(stream);
        read_message::<_, Reply>(&mut reader)?
            .ok_or_else(|| anyhow::anyhow!("node {index} closed without replying"))
    }

    pub fn snapshots(&self) -> Vec<BTreeMap<String, String>> {
        self.handles.iter().map(NodeHandle::snapshot).collect()
    }

    pub fn assert_replicas_match(&self) {
        let snapshots = self.snapshots();
        for (index, snapshot) in snapshots.iter().enumerate().skip(1) {
            assert_eq!(
                snapshot, &snapshots[0],
                "follower {index} diverged from the leader"
            );
        }
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown();
        }
    }
}

/// Binds every endpoint on port 0 and builds the matching topology.
pub fn bind_cluster(n: usize) -> Result<(Arc<ClusterTopology>, Vec<NodeListeners>)> {
    assert!(n > 0, "a cluster needs a leader");
    let mut listeners = Vec::with_capacity(n);
    let mut entries = Vec::with_capacity(n);
    for index in 0..n {
        let client = TcpListener::bind("127.0.0.1:0")?;
        let replication = if index == 0 {
            None
        } else {
            Some(TcpListener::bind("127.0.0.1:0")?)
        };
        let cmd_port = match &replication {
            Some(listener) => Some(listener.local_addr()?.port()),
            None => None,
        };
        entries.push(NodeEntry::new("127.0.0.1", client.local_addr()?.port(), cmd_port));
        listeners.push(NodeListeners {
            client,
            replication,
        });
    }

    let mut entries = entries.into_iter();
    let leader = entries.next().expect("leader entry");
    let topology = ClusterTopology::new(leader, entries.collect())?;
    Ok((Arc::new(topology), listeners))
}
