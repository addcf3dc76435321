//! Blocking request/reply calls between nodes.
//!
//! Every call opens a fresh TCP connection, writes one request line and waits
//! for one reply line. Connects, reads and writes are bounded by the policy's
//! timeout, and failed attempts are retried with exponential backoff.

use std::fmt;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::command::{Command, Reply, Request, Status};
use crate::message::{read_message, write_message};

/// Timeout and retry budget for one logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Connect and write timeout, and the reply timeout unless overridden.
    pub timeout: Duration,
    /// Delay before the second attempt; doubled after every failure.
    pub backoff: Duration,
    /// How long to wait for the reply once the request is written.
    pub reply_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(2),
            backoff: Duration::from_millis(100),
            reply_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// The same policy, waiting up to `reply_timeout` for each reply.
    pub fn awaiting(self, reply_timeout: Duration) -> Self {
        Self {
            reply_timeout: Some(reply_timeout),
            ..self
        }
    }

    pub fn reply_deadline(&self) -> Duration {
        self.reply_timeout.unwrap_or(self.timeout)
    }

    /// Upper bound on the time one [`call`] can block under this policy.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.attempts.max(1);
        // connect + write + reply
        let per_attempt = self
            .timeout
            .saturating_mul(2)
            .saturating_add(self.reply_deadline());
        let mut total = per_attempt.saturating_mul(attempts);
        let mut backoff = self.backoff;
        for _ in 1..attempts {
            total = total.saturating_add(backoff);
            backoff = backoff.saturating_mul(2);
        }
        total
    }
}

/// Error context for a call whose request reached the peer but whose reply
/// never came back. The peer may or may not have acted on it.
#[derive(Debug)]
pub struct Unanswered {
    pub addr: String,
}

impl fmt::Display for Unanswered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no reply from {} after the request was sent", self.addr)
    }
}

/// True when `err` came from a call that sent its request and lost the reply.
pub fn is_unanswered(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Unanswered>().is_some()
}

/// Whether a request may be sent again after the peer might have seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Retry only failures that happened before the request was written.
    AtMostOnce,
    /// Retry any failure; the receiver tolerates duplicates.
    Idempotent,
}

struct AttemptError {
    sent: bool,
    error: anyhow::Error,
}

impl AttemptError {
    fn unsent(error: anyhow::Error) -> Self {
        Self { sent: false, error }
    }

    fn sent(error: anyhow::Error) -> Self {
        Self { sent: true, error }
    }
}

/// Sends `request` to `addr` and waits for the reply.
pub fn call(
    addr: &str,
    request: &Request,
    policy: &RetryPolicy,
    delivery: Delivery,
) -> Result<Reply> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.backoff;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match exchange(addr, request, policy) {
            Ok(reply) => return Ok(reply),
            Err(AttemptError { sent, error }) => {
                debug!(%addr, attempt, sent, error = ?error, "call attempt failed");
                if sent && delivery == Delivery::AtMostOnce {
                    return Err(error.context(Unanswered {
                        addr: addr.to_string(),
                    }));
                }
                last_error = Some(error);
            }
        }
        if attempt < attempts {
            thread::sleep(backoff);
            backoff = backoff.saturating_mul(2);
        }
    }

    let error = last_error.unwrap_or_else(|| anyhow!("no attempts made"));
    Err(error.context(format!("{addr} unreachable after {attempts} attempt(s)")))
}

/// Sends `request` without blind retries and settles a lost reply with `addr`.
///
/// When a `lock` or `unlock` was written but its reply never arrived, the
/// request is sent again. The leader serializes mutations, so the second copy
/// is answered only after the first one finished. If it is refused, a `check`
/// tells whether the first copy took effect. Non-mutating requests are sent
/// like any [`Delivery::AtMostOnce`] call.
pub fn call_settled(addr: &str, request: &Request, policy: &RetryPolicy) -> Result<Reply> {
    match call(addr, request, policy, Delivery::AtMostOnce) {
        Err(err) if request.command.is_mutation() && is_unanswered(&err) => {
            warn!(
                %addr,
                command = %request.command,
                key = %request.key,
                "reply lost, settling with the server"
            );
            settle(addr, request, policy)
                .with_context(|| format!("failed to settle {} after: {err:#}", request.command))
        }
        other => other,
    }
}

fn settle(addr: &str, request: &Request, policy: &RetryPolicy) -> Result<Reply> {
    let again = call(addr, request, policy, Delivery::AtMostOnce)?;
    if again.status != Status::Failed {
        return Ok(again);
    }

    let check = Request::new(Command::Check, request.key.clone(), request.requester.clone());
    let current = call(addr, &check, policy, Delivery::Idempotent)?;
    let held = current.is_ok() && current.owner.as_deref() == Some(request.requester.as_str());
    let settled = match request.command {
        Command::Lock => held,
        Command::Unlock => !held,
        Command::Check => false,
    };
    debug!(%addr, command = %request.command, key = %request.key, settled, "settled lost reply");
    Ok(if settled {
        Reply::ok(request.key.clone())
    } else {
        Reply::failed(request.key.clone())
    })
}

fn exchange(addr: &str, request: &Request, policy: &RetryPolicy) -> Result<Reply, AttemptError> {
    let timeout = policy.timeout;
    let stream = connect(addr, timeout).map_err(AttemptError::unsent)?;
    stream
        .set_read_timeout(Some(policy.reply_deadline()))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .and_then(|_| stream.set_nodelay(true))
        .context("failed to configure socket")
        .map_err(AttemptError::unsent)?;

    let mut writer = stream
        .try_clone()
        .context("failed to clone socket")
        .map_err(AttemptError::unsent)?;
    write_message(&mut writer, request)
        .with_context(|| format!("failed to send {} to {addr}", request.command))
        .map_err(AttemptError::unsent)?;

    let mut reader = BufReader::new(stream);
    match read_message::<_, Reply>(&mut reader) {
        Ok(Some(reply)) => Ok(reply),
        Ok(None) => Err(AttemptError::sent(anyhow!(
            "{addr} closed the connection before replying"
        ))),
        Err(err) => Err(AttemptError::sent(
            anyhow::Error::new(err).context(format!("failed to read reply from {addr}")),
        )),
    }
}

fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let candidates: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {addr}"))?
        .collect();

    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    match last_error {
        Some(err) => Err(anyhow::Error::new(err).context(format!("failed to connect to {addr}"))),
        None => Err(anyhow!("{addr} resolved to no addresses")),
    }
}
