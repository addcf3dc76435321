//! Replicated lock service with a fixed leader.
//!
//! A small cluster of servers hands out named, mutually-exclusive locks. Node 0
//! of the cluster file is the leader and the single source of truth; every
//! other node is a follower that mirrors the leader's lock table and forwards
//! client requests to it.
//!
//! # Request flow
//!
//! 1. A client sends `lock`/`unlock`/`check` to any node's client endpoint
//! 2. A follower forwards the request, unchanged, to the leader
//! 3. The leader validates and applies it to its table under one mutex
//! 4. A successful `lock`/`unlock` is pushed to every follower's replication
//!    endpoint, and the leader waits for every acknowledgement
//! 5. Only then does the reply travel back to the client
//!
//! # Failure model
//!
//! There is no election, persistence or quorum. Network calls between nodes
//! are bounded by timeouts and a small retry budget; when they run out the
//! caller gets an `unreachable` reply instead of hanging, and the leader rolls
//! back the mutation it could not replicate. Forwarding waits as long as a
//! full commit can take, and a mutation whose reply is lost anyway is settled
//! with the leader before anyone is told `unreachable`.
//!
//! # Modules
//!
//! - [`command`]: Requests, replies and wire validation
//! - [`store`]: The guarded lock table
//! - [`node`]: Leader/follower request handling and fan-out
//! - [`runtime`]: Listener threads and node handles
//! - [`transport`]: Request/reply calls with timeouts and retries
//! - [`message`]: Newline-delimited JSON framing
//! - [`topology`]: Cluster file loading
//! - [`client`]: Client library and shell
//! - [`protocol`]: Shell command parsing

pub mod client;
pub mod command;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod topology;
pub mod transport;
