//! Pending command table keyed by request sequence number.
//!
//! An entry is removed before it is resolved, so every command resolves at
//! most once: a late reply, a timeout and a teardown racing for the same
//! entry cannot all deliver a result.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::command::{CommandKind, Reply, ReplyKind};
use crate::codec::FrameKind;
use crate::error::{BlufiError, Result};

/// Where a command's outcome goes
#[derive(Debug)]
pub enum Responder {
    /// A caller waiting for the parsed reply
    Caller(oneshot::Sender<Result<Reply>>),
    /// One step of key negotiation; the caller waits for the whole exchange
    Negotiation(oneshot::Sender<Result<()>>),
}

impl Responder {
    /// Deliver an error
    pub fn fail(self, err: BlufiError) {
        let delivered = match self {
            Self::Caller(tx) => tx.send(Err(err)).is_ok(),
            Self::Negotiation(tx) => tx.send(Err(err)).is_ok(),
        };
        if !delivered {
            tracing::debug!("caller went away before the command failed");
        }
    }
}

/// A command waiting for its reply
#[derive(Debug)]
pub struct PendingCommand {
    /// Command that was sent
    pub kind: CommandKind,
    /// Reply shape
    pub reply: ReplyKind,
    /// Deadline for the complete reply
    pub deadline: Instant,
    /// Timeout the deadline was computed from
    pub timeout: Duration,
    /// Outcome destination
    pub responder: Responder,
    body: BytesMut,
}

impl PendingCommand {
    /// New entry expiring `timeout` from now
    pub fn new(kind: CommandKind, reply: ReplyKind, timeout: Duration, responder: Responder) -> Self {
        Self {
            kind,
            reply,
            deadline: Instant::now() + timeout,
            timeout,
            responder,
            body: BytesMut::new(),
        }
    }

    /// Frame kind that answers this command
    pub fn expected(&self) -> FrameKind {
        self.reply.frame_kind()
    }

    /// Append a partial reply body
    pub fn accumulate(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Bytes accumulated so far
    pub fn accumulated(&self) -> usize {
        self.body.len()
    }

    /// Parse the accumulated body plus the final chunk
    pub fn finish(&mut self, last: &[u8]) -> Result<Reply> {
        self.body.extend_from_slice(last);
        self.reply.parse(&self.body)
    }

    /// Error for an expired entry
    pub fn timeout_error(&self) -> BlufiError {
        BlufiError::CommandTimeout {
            command: self.kind.name(),
            timeout: self.timeout,
        }
    }
}

/// Table of in-flight commands
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<u8, PendingCommand>,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight commands
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No command in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `seq` is taken
    pub fn contains(&self, seq: u8) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Register a command under `seq`.
    ///
    /// A sequence number already in use fails the new command and leaves the
    /// existing entry untouched.
    pub fn insert(&mut self, seq: u8, command: PendingCommand) -> Result<()> {
        if self.entries.contains_key(&seq) {
            let err = || {
                BlufiError::Protocol(format!("sequence {} already has a pending command", seq))
            };
            command.responder.fail(err());
            return Err(err());
        }
        self.entries.insert(seq, command);
        Ok(())
    }

    /// Look up an entry without removing it
    pub fn get_mut(&mut self, seq: u8) -> Option<&mut PendingCommand> {
        self.entries.get_mut(&seq)
    }

    /// Remove an entry
    pub fn take(&mut self, seq: u8) -> Option<PendingCommand> {
        self.entries.remove(&seq)
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Remove every entry whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<(u8, PendingCommand)> {
        let expired: Vec<u8> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        expired
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq).map(|p| (seq, p)))
            .collect()
    }

    /// Fail every entry
    pub fn fail_all(&mut self, err: impl Fn() -> BlufiError) {
        for (seq, pending) in self.entries.drain() {
            tracing::debug!(seq, command = pending.kind.name(), "failing pending command");
            pending.responder.fail(err());
        }
    }
}
