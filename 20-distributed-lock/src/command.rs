//! Requests and replies exchanged between clients, followers and the leader.
//!
//! Both the client-facing endpoint and the internal replication endpoint carry
//! the same [`Request`] shape. Incoming lines are first decoded into a loose
//! [`RawRequest`] so that a malformed request can still be answered with a
//! `failed` reply instead of dropping the connection.

use std::fmt;

use anyhow::{Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

/// Operations a client can ask a lock server to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Lock,
    Unlock,
    Check,
}

impl Command {
    /// Whether the command changes the lock table and must be replicated.
    pub fn is_mutation(self) -> bool {
        match self {
            Command::Lock | Command::Unlock => true,
            Command::Check => false,
        }
    }

    /// The command that undoes this one for the same key and requester.
    ///
    /// Used by the leader to roll back a mutation whose fan-out failed.
    pub fn inverse(self) -> Option<Command> {
        match self {
            Command::Lock => Some(Command::Unlock),
            Command::Unlock => Some(Command::Lock),
            Command::Check => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::Check => "check",
        }
    }

    fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "lock" => Ok(Command::Lock),
            "unlock" => Ok(Command::Unlock),
            "check" => Ok(Command::Check),
            other => Err(anyhow!("unknown command '{other}'")),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated lock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub command: Command,
    pub key: String,
    pub requester: String,
}

impl Request {
    pub fn new(command: Command, key: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            command,
            key: key.into(),
            requester: requester.into(),
        }
    }

    /// Decodes and validates one wire line.
    pub fn decode(line: &str) -> Result<Self> {
        let raw: RawRequest = serde_json::from_str(line)?;
        raw.validate()
    }
}

/// Request as it appears on the wire before validation.
///
/// Every field is optional so that missing fields surface as a validation
/// error rather than a decode error. The field names used by the first
/// generation of clients (`cmd`, `uuid`) are accepted as aliases.
#[derive(Debug, Default, Deserialize)]
pub struct RawRequest {
    #[serde(default, alias = "cmd")]
    pub command: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, alias = "uuid")]
    pub requester: Option<String>,
}

impl RawRequest {
    pub fn validate(self) -> Result<Request> {
        let command = self.command.ok_or_else(|| anyhow!("missing command"))?;
        let command = Command::parse(&command)?;
        let key = self.key.ok_or_else(|| anyhow!("missing key"))?;
        ensure!(!key.trim().is_empty(), "key must not be empty");
        let requester = self.requester.ok_or_else(|| anyhow!("missing requester"))?;
        ensure!(!requester.trim().is_empty(), "requester must not be empty");
        Ok(Request {
            command,
            key,
            requester,
        })
    }
}

/// Outcome reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Failed,
    /// A forward or fan-out exhausted its retry budget.
    Unreachable,
}

/// The single answer produced for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Reply {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            key: Some(key.into()),
            owner: None,
        }
    }

    pub fn owned_by(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            key: Some(key.into()),
            owner: Some(owner.into()),
        }
    }

    pub fn failed(key: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            key: Some(key.into()),
            owner: None,
        }
    }

    pub fn unreachable(key: impl Into<String>) -> Self {
        Self {
            status: Status::Unreachable,
            key: Some(key.into()),
            owner: None,
        }
    }

    /// Reply for a request that could not be decoded or validated.
    pub fn malformed() -> Self {
        Self {
            status: Status::Failed,
            key: None,
            owner: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}
