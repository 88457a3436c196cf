//! Outstanding request table.
//!
//! Every REQUEST sent with [`crate::Session::send_request`] registers a
//! [`PendingCall`] keyed by its sequence. The matching RESPONSE completes the
//! call exactly once; a timeout, a dropped caller or a closed connection
//! removes it. Whatever happens second is a no-op.

use std::time::{Duration, Instant};

use crossline_core::{CrosslineError, Message, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::debug;

/// Receiver half handed to the caller waiting on a response.
pub type PendingReceiver = oneshot::Receiver<Result<Message>>;

/// One outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    tx: oneshot::Sender<Result<Message>>,
    created_at: Instant,
    timeout: Duration,
}

impl PendingCall {
    /// Time since the request was registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the deadline has passed.
    pub fn is_overdue(&self) -> bool {
        self.age() >= self.timeout
    }
}

/// Concurrent table of outstanding requests keyed by sequence.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<u64, PendingCall>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return the receiver its response arrives on.
    pub fn register(&self, sequence: u64, timeout: Duration) -> Result<PendingReceiver> {
        match self.calls.entry(sequence) {
            Entry::Occupied(_) => Err(CrosslineError::validation(format!(
                "request {sequence} is already pending"
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let _ = slot.insert(PendingCall {
                    tx,
                    created_at: Instant::now(),
                    timeout,
                });
                Ok(rx)
            }
        }
    }

    /// Guard that removes `sequence` when dropped.
    pub fn guard(&self, sequence: u64) -> PendingGuard<'_> {
        PendingGuard {
            calls: self,
            sequence,
        }
    }

    /// Deliver a RESPONSE to its waiting caller.
    ///
    /// Returns the message back when nothing is waiting for it (late or
    /// unknown sequence).
    pub fn complete(&self, response: Message) -> std::result::Result<(), Message> {
        let Some((sequence, call)) = self.calls.remove(&response.sequence()) else {
            return Err(response);
        };
        debug!(
            sequence,
            latency_ms = u64::try_from(call.age().as_millis()).unwrap_or(u64::MAX),
            "response matched pending request"
        );
        // The caller may have given up between removal and send.
        match call.tx.send(Ok(response)) {
            Err(Ok(message)) => Err(message),
            Ok(()) | Err(Err(_)) => Ok(()),
        }
    }

    /// Drop a pending entry without completing it.
    pub fn remove(&self, sequence: u64) -> bool {
        self.calls.remove(&sequence).is_some()
    }

    /// Fail every outstanding call with a copy of `error`.
    pub fn fail_all(&self, error: &CrosslineError) -> usize {
        let sequences: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for sequence in sequences {
            if let Some((_, call)) = self.calls.remove(&sequence) {
                let _ = call.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Sequences whose deadline has passed but which are still registered.
    pub fn overdue(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter(|entry| entry.value().is_overdue())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Removes a pending entry when the waiting future is dropped.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    sequence: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.calls.remove(self.sequence);
    }
}
