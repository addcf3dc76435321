//! Client library and interactive shell.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::command::{Command, Reply, Request, Status};
use crate::node::forward_budget;
use crate::protocol::{ConsoleCommand, HELP};
use crate::topology::ClusterTopology;
use crate::transport::{self, RetryPolicy};

/// Issues lock requests on behalf of one requester identity.
pub struct LockClient {
    requester: String,
    topology: Arc<ClusterTopology>,
    policy: RetryPolicy,
    // Keys this client was told it acquired and has not released since.
    owned: BTreeSet<String>,
}

impl LockClient {
    /// Unless `policy` sets its own reply timeout, replies are awaited long
    /// enough for a follower to forward the request and the leader to commit it.
    pub fn new(
        requester: impl Into<String>,
        topology: Arc<ClusterTopology>,
        policy: RetryPolicy,
    ) -> Self {
        let policy = match policy.reply_timeout {
            Some(_) => policy,
            None => policy.awaiting(forward_budget(&policy, topology.followers().len())),
        };
        Self {
            requester: requester.into(),
            topology,
            policy,
            owned: BTreeSet::new(),
        }
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn owned(&self) -> &BTreeSet<String> {
        &self.owned
    }

    pub fn lock(&mut self, key: &str, server: usize) -> Result<Reply> {
        self.send(Command::Lock, key, server)
    }

    pub fn unlock(&mut self, key: &str, server: usize) -> Result<Reply> {
        self.send(Command::Unlock, key, server)
    }

    pub fn check(&mut self, key: &str, server: usize) -> Result<Reply> {
        self.send(Command::Check, key, server)
    }

    /// Sends one request to the server at `server` and returns its reply.
    ///
    /// Transport failures come back as an `unreachable` reply, the same
    /// status a server uses when it cannot reach its peers. A lost reply to
    /// `lock` or `unlock` is settled with the server before giving up.
    pub fn send(&mut self, command: Command, key: &str, server: usize) -> Result<Reply> {
        let addr = self.topology.node(server)?.client_addr();
        let request = Request::new(command, key, self.requester.clone());
        let reply = match transport::call_settled(&addr, &request, &self.policy) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%addr, error = ?err, "request failed");
                Reply::unreachable(key)
            }
        };

        if reply.is_ok() {
            match command {
                Command::Lock => {
                    self.owned.insert(key.to_string());
                }
                Command::Unlock => {
                    self.owned.remove(key);
                }
                Command::Check => {}
            }
        }
        Ok(reply)
    }

    /// Describes this client, the cluster and the keys it holds.
    pub fn render_status(&self) -> String {
        let mut out = format!("requester: {}\nservers:\n", self.requester);
        for node in self.topology.nodes() {
            out.push_str(&format!("\t#{} {}: {}\n", node.index, node.role, node.client_addr()));
        }
        if !self.owned.is_empty() {
            out.push_str("lock table:\n");
            for key in &self.owned {
                out.push_str(&format!("\t{key}: owned\n"));
            }
        }
        out
    }
}

/// Formats the outcome of one lock operation for the shell.
pub fn describe(command: Command, key: &str, reply: &Reply, requester: &str) -> String {
    match (command, reply.status) {
        (_, Status::Unreachable) => format!("{command} {key} unreachable for client{requester}."),
        (Command::Lock | Command::Unlock, Status::Ok) => {
            format!("{command} {key} successfully by client{requester}.")
        }
        (Command::Lock | Command::Unlock, Status::Failed) => {
            format!("{command} {key} failed by client{requester}.")
        }
        (Command::Check, Status::Ok) => format!(
            "The owner of {key} is client{}, check by client{requester}.",
            reply.owner.as_deref().unwrap_or("?")
        ),
        (Command::Check, Status::Failed) => {
            format!("check owner for {key} is failed by client{requester}.")
        }
    }
}

/// Runs the `>>>` prompt until `exit` or end of input.
///
/// Parse errors and out-of-range server ids are printed and the shell keeps
/// going; only I/O errors on `input`/`output` end it early.
pub fn run_shell<R, W>(client: &mut LockClient, input: &mut R, output: &mut W) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    run_session(client, input, output, None)
}

/// Replays a command file through the shell.
///
/// Each command is echoed after the prompt, and the client waits `pause`
/// after every non-blank line so several scripted clients interleave.
pub fn run_script<R, W>(
    client: &mut LockClient,
    input: &mut R,
    output: &mut W,
    pause: Duration,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    run_session(client, input, output, Some(pause))
}

fn run_session<R, W>(
    client: &mut LockClient,
    input: &mut R,
    output: &mut W,
    pause: Option<Duration>,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(output, ">>> ")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        if pause.is_some() {
            writeln!(output, "{}", line.trim_end())?;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(ConsoleCommand::Help) => writeln!(output, "{HELP}")?,
            Ok(ConsoleCommand::Status) => write!(output, "{}", client.render_status())?,
            Ok(ConsoleCommand::Send {
                command,
                key,
                server,
            }) => match client.send(command, &key, server) {
                Ok(reply) => writeln!(
                    output,
                    "{}",
                    describe(command, &key, &reply, client.requester())
                )?,
                Err(err) => writeln!(output, "{err}")?,
            },
            // Blank lines just redraw the prompt.
            Err(_) if line.trim().is_empty() => continue,
            Err(err) => writeln!(output, "{err}")?,
        }
        if let Some(pause) = pause {
            thread::sleep(pause);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_outcomes_like_the_shell_prints_them() {
        assert_eq!(
            describe(Command::Lock, "doc1", &Reply::ok("doc1"), "1"),
            "lock doc1 successfully by client1."
        );
        assert_eq!(
            describe(Command::Unlock, "doc1", &Reply::failed("doc1"), "2"),
            "unlock doc1 failed by client2."
        );
        assert_eq!(
            describe(Command::Check, "doc1", &Reply::owned_by("doc1", "1"), "2"),
            "The owner of doc1 is client1, check by client2."
        );
        assert_eq!(
            describe(Command::Check, "doc1", &Reply::failed("doc1"), "2"),
            "check owner for doc1 is failed by client2."
        );
        assert_eq!(
            describe(Command::Lock, "doc1", &Reply::unreachable("doc1"), "3"),
            "lock doc1 unreachable for client3."
        );
    }
}
