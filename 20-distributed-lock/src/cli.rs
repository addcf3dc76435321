use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use distributed_lock::node::{FanOutMode, NodeSettings};
use distributed_lock::transport::RetryPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed Lock System", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one server of the cluster.
    Serve(ServeArgs),
    /// Start one server process per node in the cluster file and wait.
    Launch(LaunchArgs),
    /// Open an interactive lock shell.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Server configuration file (JSON). The first entry is the leader.
    #[arg(long = "server-cfg", default_value = "server.cfg")]
    pub server_cfg: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct TimeoutArgs {
    /// Connect/read/write timeout for calls to other nodes, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,

    /// Attempts per call before reporting the peer unreachable.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Delay before the first retry, doubled after each failure.
    #[arg(long, default_value_t = 100)]
    pub backoff_ms: u64,
}

impl TimeoutArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retries,
            timeout: Duration::from_millis(self.timeout_ms),
            backoff: Duration::from_millis(self.backoff_ms),
            reply_timeout: None,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum FanOutArg {
    #[default]
    Sequential,
    Concurrent,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Server id: position in the cluster file, 0 is the leader.
    #[arg(long)]
    pub sid: usize,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub timeouts: TimeoutArgs,

    /// Host to bind both endpoints on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_host: String,

    /// How the leader replicates to followers.
    #[arg(long, value_enum, default_value_t = FanOutArg::Sequential)]
    pub fan_out: FanOutArg,

    /// Answer `check` on followers from the local mirror.
    #[arg(long)]
    pub local_check: bool,
}

impl ServeArgs {
    /// Node settings for a cluster with `followers` followers.
    pub fn settings(&self, followers: usize) -> NodeSettings {
        NodeSettings {
            fan_out: match self.fan_out {
                FanOutArg::Sequential => FanOutMode::Sequential,
                FanOutArg::Concurrent => FanOutMode::Concurrent,
            },
            local_check: self.local_check,
            ..NodeSettings::with_policy(self.timeouts.policy(), followers)
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Extra arguments passed to every `serve` process.
    #[arg(last = true)]
    pub serve_args: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Client id, used as the requester identity.
    #[arg(long)]
    pub cid: u32,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub timeouts: TimeoutArgs,

    /// Replay shell commands from a file instead of reading stdin.
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Pause after each scripted command, in milliseconds.
    #[arg(long, default_value_t = 10_000, requires = "script")]
    pub delay_ms: u64,
}
