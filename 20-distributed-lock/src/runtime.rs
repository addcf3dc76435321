//! Listener threads for a running lock server.
//!
//! Each node runs:
//!
//! - **Client listener**: accepts client (and forwarded) requests
//! - **Replication listener**: followers only, accepts the leader's fan-out
//! - **Connection handler threads**: one per accepted connection, answering
//!   requests one at a time until the peer hangs up
//!
//! All threads share one [`LockNode`], whose lock table is the only mutable
//! state. No async runtime is involved; every wait is a blocking socket call.

use std::collections::BTreeMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::message::{read_frame, write_message};
use crate::node::{LockNode, NodeSettings};
use crate::topology::{ClusterTopology, NodeRole};

/// Everything needed to start one node of the cluster.
pub struct NodeConfig {
    /// Position in the cluster file; 0 is the leader.
    pub index: usize,
    pub topology: Arc<ClusterTopology>,
    pub settings: NodeSettings,
    /// Host the listeners bind to. The advertised ip in the topology is only
    /// used by peers to reach this node.
    pub bind_host: String,
}

impl NodeConfig {
    pub fn new(index: usize, topology: Arc<ClusterTopology>) -> Self {
        Self {
            index,
            topology,
            settings: NodeSettings::default(),
            bind_host: "0.0.0.0".to_string(),
        }
    }
}

/// Sockets a node serves on. Tests bind these to port 0 up front so the
/// topology can be built from the real addresses.
pub struct NodeListeners {
    pub client: TcpListener,
    pub replication: Option<TcpListener>,
}

impl NodeListeners {
    pub fn bind(config: &NodeConfig) -> Result<Self> {
        let node = config.topology.node(config.index)?;
        let client_addr = format!("{}:{}", config.bind_host, node.client_port);
        let client = TcpListener::bind(&client_addr)
            .with_context(|| format!("failed to bind client endpoint {client_addr}"))?;
        let replication = match node.replication_port {
            Some(port) => {
                let addr = format!("{}:{}", config.bind_host, port);
                Some(
                    TcpListener::bind(&addr)
                        .with_context(|| format!("failed to bind replication endpoint {addr}"))?,
                )
            }
            None => None,
        };
        Ok(Self {
            client,
            replication,
        })
    }
}

/// Handle to a running node.
pub struct NodeHandle {
    node: Arc<LockNode>,
    client_addr: SocketAddr,
    replication_addr: Option<SocketAddr>,
    stopping: Arc<AtomicBool>,
    listeners: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn index(&self) -> usize {
        self.node.index()
    }

    pub fn role(&self) -> NodeRole {
        self.node.role()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn replication_addr(&self) -> Option<SocketAddr> {
        self.replication_addr
    }

    /// Current contents of this node's lock table.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.node.table().snapshot()
    }

    /// Status dump, as logged at startup and on shutdown.
    pub fn status(&self) -> String {
        self.node.render_status()
    }

    /// Blocks until both listeners exit. Only returns early on shutdown.
    pub fn wait(mut self) {
        for listener in self.listeners.drain(..) {
            let _ = listener.join();
        }
    }

    /// Stops accepting connections and joins the listener threads.
    ///
    /// Connections that are already open finish their current request and
    /// close when the peer hangs up.
    pub fn shutdown(mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the blocking accept calls so they observe the flag.
        for addr in std::iter::once(self.client_addr).chain(self.replication_addr) {
            let _ = TcpStream::connect(wake_addr(addr));
        }
        for listener in self.listeners.drain(..) {
            let _ = listener.join();
        }
        log_status(&self.node);
        info!(node = self.node.index(), "node stopped");
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    }
}

/// Binds the node's endpoints from its configuration and starts serving.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let listeners = NodeListeners::bind(&config)?;
    spawn_node_with(config, listeners)
}

/// Starts serving on listeners the caller already bound.
pub fn spawn_node_with(config: NodeConfig, listeners: NodeListeners) -> Result<NodeHandle> {
    let node = Arc::new(LockNode::new(
        config.index,
        Arc::clone(&config.topology),
        config.settings,
    )?);

    match (node.role(), listeners.replication.is_some()) {
        (NodeRole::Follower, false) => {
            return Err(anyhow!("follower #{} needs a replication listener", node.index()));
        }
        (NodeRole::Leader, true) => {
            warn!("leader was given a replication listener; it will stay unused");
        }
        _ => {}
    }

    log_status(&node);

    let stopping = Arc::new(AtomicBool::new(false));
    let client_addr = listeners.client.local_addr()?;
    let mut threads = vec![spawn_listener(
        Endpoint::Client,
        listeners.client,
        Arc::clone(&node),
        Arc::clone(&stopping),
    )?];

    let mut replication_addr = None;
    if node.role() == NodeRole::Follower {
        if let Some(listener) = listeners.replication {
            replication_addr = Some(listener.local_addr()?);
            threads.push(spawn_listener(
                Endpoint::Replication,
                listener,
                Arc::clone(&node),
                Arc::clone(&stopping),
            )?);
        }
    }

    info!(
        node = node.index(),
        role = %node.role(),
        client = %client_addr,
        replication = ?replication_addr,
        "node listening"
    );

    Ok(NodeHandle {
        node,
        client_addr,
        replication_addr,
        stopping,
        listeners: threads,
    })
}

fn log_status(node: &LockNode) {
    for line in node.render_status().lines() {
        info!(node = node.index(), "{line}");
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Client,
    Replication,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Endpoint::Client => "client",
            Endpoint::Replication => "replication",
        }
    }
}

fn spawn_listener(
    endpoint: Endpoint,
    listener: TcpListener,
    node: Arc<LockNode>,
    stopping: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("lock-{}-{}", endpoint.name(), node.index()))
        .spawn(move || {
            for stream in listener.incoming() {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => spawn_connection(endpoint, stream, Arc::clone(&node)),
                    Err(err) => warn!(endpoint = endpoint.name(), error = ?err, "accept failed"),
                }
            }
        })
        .with_context(|| format!("failed to spawn {} listener", endpoint.name()))
}

fn spawn_connection(endpoint: Endpoint, stream: TcpStream, node: Arc<LockNode>) {
    let peer = stream.peer_addr().ok();
    let spawned = thread::Builder::new()
        .name(format!("lock-conn-{}", node.index()))
        .spawn(move || {
            if let Err(err) = serve_connection(endpoint, stream, &node) {
                debug!(
                    ?peer,
                    endpoint = endpoint.name(),
                    error = ?err,
                    "connection closed with error"
                );
            }
        });
    if let Err(err) = spawned {
        warn!(?peer, error = ?err, "failed to spawn connection handler");
    }
}

/// Answers requests on one connection until the peer closes it.
fn serve_connection(endpoint: Endpoint, stream: TcpStream, node: &LockNode) -> Result<()> {
    let mut writer = stream.try_clone().context("failed to clone connection")?;
    let mut reader = BufReader::new(stream);
    while let Some(line) = read_frame(&mut reader)? {
        let reply = match endpoint {
            Endpoint::Client => node.handle_client_line(&line),
            Endpoint::Replication => node.handle_replication_line(&line),
        };
        write_message(&mut writer, &reply)?;
    }
    Ok(())
}
