use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command as Process};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};

use distributed_lock::{
    client::{LockClient, run_script, run_shell},
    runtime::{NodeConfig, spawn_node},
    topology::ClusterTopology,
};

mod cli;

use cli::{Cli, ClientArgs, Command, LaunchArgs, ServeArgs};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so they never interleave with the client shell's output.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Launch(args) => launch(args),
        Command::Client(args) => client(args),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let topology = Arc::new(ClusterTopology::load(&args.cluster.server_cfg)?);
    let mut config = NodeConfig::new(args.sid, Arc::clone(&topology));
    config.settings = args.settings(topology.followers().len());
    config.bind_host = args.bind_host.clone();

    let handle = spawn_node(config)?;
    handle.wait();
    Ok(())
}

fn launch(args: LaunchArgs) -> Result<()> {
    let topology = ClusterTopology::load(&args.cluster.server_cfg)?;
    let exe = std::env::current_exe().context("failed to locate own executable")?;

    let mut children = Vec::with_capacity(topology.len());
    for node in topology.nodes() {
        match spawn_server(&exe, node.index, &args.cluster.server_cfg, &args.serve_args) {
            Ok(child) => {
                info!(sid = node.index, pid = child.id(), "started server");
                children.push((node.index, child));
            }
            Err(err) => {
                terminate(&mut children);
                return Err(err);
            }
        }
    }

    supervise(children)
}

fn spawn_server(exe: &Path, sid: usize, server_cfg: &Path, extra: &[String]) -> Result<Child> {
    Process::new(exe)
        .arg("serve")
        .arg("--sid")
        .arg(sid.to_string())
        .arg("--server-cfg")
        .arg(server_cfg)
        .args(extra)
        .spawn()
        .with_context(|| format!("failed to start server {sid}"))
}

/// Waits for every server; the first failure takes the rest down with it.
fn supervise(mut children: Vec<(usize, Child)>) -> Result<()> {
    while !children.is_empty() {
        let mut index = 0;
        while index < children.len() {
            let (sid, child) = &mut children[index];
            let sid = *sid;
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    info!(sid, "server exited");
                    children.remove(index);
                }
                Ok(Some(status)) => {
                    error!(sid, %status, "server failed, stopping the cluster");
                    children.remove(index);
                    terminate(&mut children);
                    bail!("server {sid} exited with {status}");
                }
                Ok(None) => index += 1,
                Err(err) => {
                    terminate(&mut children);
                    return Err(err).with_context(|| format!("failed to poll server {sid}"));
                }
            }
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
    Ok(())
}

fn terminate(children: &mut Vec<(usize, Child)>) {
    for (sid, child) in children.iter_mut() {
        if let Err(err) = child.kill() {
            warn!(sid = *sid, error = ?err, "failed to stop server");
        }
        let _ = child.wait();
    }
    children.clear();
}

fn client(args: ClientArgs) -> Result<()> {
    let topology = Arc::new(ClusterTopology::load(&args.cluster.server_cfg)?);
    let mut client = LockClient::new(args.cid.to_string(), topology, args.timeouts.policy());

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut output = stdout.lock();
    output.write_all(client.render_status().as_bytes())?;
    match &args.script {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open script {}", path.display()))?;
            let pause = Duration::from_millis(args.delay_ms);
            run_script(&mut client, &mut BufReader::new(file), &mut output, pause)
        }
        None => run_shell(&mut client, &mut stdin.lock(), &mut output),
    }
}
