//! Request handling for one lock server.
//!
//! [`LockNode`] holds the node's lock table and decides, for every client
//! request, whether to answer it locally (leader) or forward it (follower).
//! On the leader, a successful `lock` or `unlock` is fanned out to every
//! follower's replication endpoint before the client gets its reply.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::unbounded;
use tracing::{debug, error, info, warn};

use crate::command::{Command, Reply, Request};
use crate::store::LockTable;
use crate::topology::{ClusterTopology, NodeInfo, NodeRole};
use crate::transport::{self, Delivery, RetryPolicy};

/// How the leader pushes a confirmed mutation to its followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutMode {
    /// One follower at a time, in cluster order.
    #[default]
    Sequential,
    /// All followers in parallel, joined before replying.
    Concurrent,
}

/// Tunables that are not part of the cluster layout.
#[derive(Debug, Clone, Default)]
pub struct NodeSettings {
    /// Follower → leader forwarding.
    pub forward: RetryPolicy,
    /// Leader → follower replication.
    pub replicate: RetryPolicy,
    pub fan_out: FanOutMode,
    /// Let followers answer `check` from their own mirror instead of asking
    /// the leader. Faster, but may lag behind an in-flight fan-out.
    pub local_check: bool,
}

impl NodeSettings {
    /// Replicates with `policy` and waits long enough on forwards for the
    /// leader to finish a commit across `followers` followers.
    pub fn with_policy(policy: RetryPolicy, followers: usize) -> Self {
        Self {
            forward: policy.awaiting(commit_budget(&policy, followers)),
            replicate: policy,
            ..Self::default()
        }
    }
}

/// Longest the leader can take to answer one `lock` or `unlock`.
///
/// Covers a fan-out to every follower followed by an undo sent to each of
/// them, with every call using up its whole `replicate` budget.
pub fn commit_budget(replicate: &RetryPolicy, followers: usize) -> Duration {
    let calls = u32::try_from(followers).unwrap_or(u32::MAX).saturating_mul(2);
    replicate
        .worst_case()
        .saturating_mul(calls)
        .saturating_add(replicate.timeout)
}

/// Longest a follower can take to answer a forwarded request, including the
/// extra round trips needed to settle a lost reply.
pub fn forward_budget(policy: &RetryPolicy, followers: usize) -> Duration {
    let forward = policy.awaiting(commit_budget(policy, followers));
    forward
        .worst_case()
        .saturating_mul(3)
        .saturating_add(policy.timeout)
}

/// Followers that acknowledged a fan-out, and the ones that did not.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub acked: Vec<usize>,
    pub failed: Vec<(usize, anyhow::Error)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct LockNode {
    index: usize,
    role: NodeRole,
    topology: Arc<ClusterTopology>,
    table: LockTable,
    // Held across check-mutate-fan-out on the leader so followers see
    // mutations in the order the leader applied them.
    sequencer: Mutex<()>,
    settings: NodeSettings,
}

impl LockNode {
    pub fn new(
        index: usize,
        topology: Arc<ClusterTopology>,
        settings: NodeSettings,
    ) -> Result<Self> {
        let role = topology.node(index)?.role;
        Ok(Self {
            index,
            role,
            topology,
            table: LockTable::new(),
            sequencer: Mutex::new(()),
            settings,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn table(&self) -> &LockTable {
        &self.table
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// This node, the cluster around it and the locks it currently records.
    pub fn render_status(&self) -> String {
        let mut out = format!("node #{} ({})\nservers:\n", self.index, self.role);
        for member in self.topology.nodes() {
            let marker = if member.index == self.index { "*" } else { " " };
            out.push_str(&format!(
                "\t#{}{} {}: {} (replication: {})\n",
                member.index,
                marker,
                member.role,
                member.client_addr(),
                member.replication_addr().as_deref().unwrap_or("-")
            ));
        }
        let owners = self.table.snapshot();
        out.push_str(&format!("lock table: {} held\n", owners.len()));
        for (key, owner) in &owners {
            out.push_str(&format!("\t{key}: {owner}\n"));
        }
        out
    }

    /// Answers one line received on the client endpoint.
    pub fn handle_client_line(&self, line: &str) -> Reply {
        match Request::decode(line) {
            Ok(request) => self.handle_client_request(request),
            Err(err) => {
                warn!(node = self.index, error = %err, "rejecting malformed request");
                Reply::malformed()
            }
        }
    }

    pub fn handle_client_request(&self, request: Request) -> Reply {
        match self.role {
            NodeRole::Follower
                if request.command == Command::Check && self.settings.local_check =>
            {
                self.check(&request.key)
            }
            NodeRole::Follower => self.forward(&request),
            NodeRole::Leader => match request.command {
                Command::Lock => self.lock(request),
                Command::Unlock => self.unlock(request),
                Command::Check => self.check(&request.key),
            },
        }
    }

    /// Answers one line received on the replication endpoint.
    pub fn handle_replication_line(&self, line: &str) -> Reply {
        match Request::decode(line) {
            Ok(request) => self.handle_replication(request),
            Err(err) => {
                warn!(node = self.index, error = %err, "rejecting malformed replication request");
                Reply::malformed()
            }
        }
    }

    /// Mirrors a mutation the leader already validated.
    pub fn handle_replication(&self, request: Request) -> Reply {
        if self.role == NodeRole::Leader {
            // A leader is its own source of truth and must never mirror.
            warn!(key = %request.key, "leader ignoring replication request");
            return Reply::failed(request.key);
        }
        let Request {
            command,
            key,
            requester,
        } = request;
        self.table.apply(command, &key, &requester);
        debug!(node = self.index, %command, %key, %requester, "applied replicated command");
        Reply::ok(key)
    }

    fn check(&self, key: &str) -> Reply {
        match self.table.lookup(key) {
            Some(owner) => Reply::owned_by(key, owner),
            None => Reply::failed(key),
        }
    }

    fn lock(&self, request: Request) -> Reply {
        let _serial = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.table.try_lock(&request.key, &request.requester) {
            debug!(key = %request.key, requester = %request.requester, "lock refused, key held");
            return Reply::failed(request.key);
        }
        self.commit(request)
    }

    fn unlock(&self, request: Request) -> Reply {
        let _serial = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.table.try_unlock(&request.key, &request.requester) {
            debug!(
                key = %request.key,
                requester = %request.requester,
                "unlock refused, not the owner"
            );
            return Reply::failed(request.key);
        }
        self.commit(request)
    }

    /// Replicates a mutation already applied locally and picks the reply.
    ///
    /// If any follower cannot be reached the mutation is rolled back here and
    /// on the followers that did acknowledge it, so a caller told
    /// `unreachable` does not end up holding (or losing) the lock.
    fn commit(&self, request: Request) -> Reply {
        let report = self.fan_out(&request);
        if report.is_complete() {
            info!(
                command = %request.command,
                key = %request.key,
                requester = %request.requester,
                followers = report.acked.len(),
                "replicated"
            );
            return Reply::ok(request.key);
        }

        for (follower, err) in &report.failed {
            error!(follower, key = %request.key, error = ?err, "replication failed");
        }
        self.roll_back(&request, &report.acked);
        Reply::unreachable(request.key)
    }

    fn roll_back(&self, request: &Request, acked: &[usize]) {
        let Some(inverse) = request.command.inverse() else {
            return;
        };
        self.table.apply(inverse, &request.key, &request.requester);

        let undo = Request::new(inverse, request.key.clone(), request.requester.clone());
        for &index in acked {
            let result = self
                .topology
                .node(index)
                .and_then(|follower| self.replicate_to(follower, &undo));
            if let Err(err) = result {
                error!(
                    follower = index,
                    key = %request.key,
                    error = ?err,
                    "rollback did not reach follower"
                );
            }
        }
        warn!(command = %request.command, key = %request.key, "rolled back unreplicated command");
    }

    /// Sends a confirmed mutation to every follower and waits for all of them.
    pub fn fan_out(&self, request: &Request) -> FanOutReport {
        let followers = self.topology.followers();
        match self.settings.fan_out {
            FanOutMode::Sequential => {
                let mut report = FanOutReport::default();
                for follower in followers {
                    match self.replicate_to(follower, request) {
                        Ok(()) => report.acked.push(follower.index),
                        Err(err) => report.failed.push((follower.index, err)),
                    }
                }
                report
            }
            FanOutMode::Concurrent => {
                let (done_tx, done_rx) = unbounded();
                thread::scope(|scope| {
                    for follower in followers {
                        let done_tx = done_tx.clone();
                        scope.spawn(move || {
                            let result = self.replicate_to(follower, request);
                            let _ = done_tx.send((follower.index, result));
                        });
                    }
                });
                drop(done_tx);

                let mut report = FanOutReport::default();
                for (index, result) in done_rx.iter() {
                    match result {
                        Ok(()) => report.acked.push(index),
                        Err(err) => report.failed.push((index, err)),
                    }
                }
                report.acked.sort_unstable();
                report
            }
        }
    }

    fn replicate_to(&self, follower: &NodeInfo, request: &Request) -> Result<()> {
        let addr = follower
            .replication_addr()
            .ok_or_else(|| anyhow!("follower #{} has no replication port", follower.index))?;
        let policy = &self.settings.replicate;
        let reply = transport::call(&addr, request, policy, Delivery::Idempotent)?;
        if !reply.is_ok() {
            return Err(anyhow!(
                "follower #{} rejected {} for {}",
                follower.index,
                request.command,
                request.key
            ));
        }
        Ok(())
    }

    /// Relays a request to the leader and returns its reply unchanged.
    ///
    /// A mutation whose reply is lost is settled with the leader first, so
    /// the caller is never told `unreachable` about a lock it was granted.
    fn forward(&self, request: &Request) -> Reply {
        let leader = self.topology.leader().client_addr();
        match transport::call_settled(&leader, request, &self.settings.forward) {
            Ok(reply) => reply,
            Err(err) => {
                error!(
                    node = self.index,
                    %leader,
                    key = %request.key,
                    error = ?err,
                    "forward to leader failed"
                );
                Reply::unreachable(request.key.clone())
            }
        }
    }
}
