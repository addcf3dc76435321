//! Command parsing for the interactive client shell.
//!
//! This is separate from [`crate::command::Command`]: the shell also has
//! meta-commands (STATUS, HELP, EXIT) that never reach a server, and every
//! lock operation names the server it should be sent to.

use anyhow::{Result, anyhow};

use crate::command::Command;

/// Commands that can be entered at the `>>>` prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Send {
        command: Command,
        key: String,
        server: usize,
    },
    Status,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of user input.
    ///
    /// # Syntax
    /// Commands are case-insensitive:
    /// - `lock <key> <server>` - take a lock through the given server
    /// - `unlock <key> <server>` - release a lock through the given server
    /// - `check <key> <server>` - ask the given server who owns a key
    /// - `status` - show this client and what it believes it owns
    /// - `help` - print command reference
    /// - `exit` - leave the shell
    ///
    /// The server index is only checked for range by the caller, which knows
    /// the cluster size.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let name = first.to_lowercase();
        let command = match name.as_str() {
            "status" => return Ok(ConsoleCommand::Status),
            "help" => return Ok(ConsoleCommand::Help),
            "exit" => return Ok(ConsoleCommand::Exit),
            "lock" => Command::Lock,
            "unlock" => Command::Unlock,
            "check" => Command::Check,
            other => return Err(anyhow!("{other}: unknown commands.")),
        };

        let usage = || anyhow!("usage: {command} key server_id");
        let [_, key, server] = parts.as_slice() else {
            return Err(usage());
        };
        let server = server.parse::<usize>().map_err(|_| usage())?;
        Ok(ConsoleCommand::Send {
            command,
            key: key.to_string(),
            server,
        })
    }
}

pub const HELP: &str = "\
Commands (case-insensitive):
  lock <key> <server>    take a lock through a server
  unlock <key> <server>  release a lock through a server
  check <key> <server>   show the owner of a key
  status                 show this client
  help                   show this message
  exit                   leave the shell";
