//! Matching of responses to waiting callers by execution ID.
//!
//! The correlator never imposes an order: a response resolves whichever entry
//! carries its ID. Every entry leaves the map exactly once, through
//! [`resolve`](ExecutionCorrelator::resolve), [`expire`](ExecutionCorrelator::expire),
//! [`reject`](ExecutionCorrelator::reject) or [`fail_all`](ExecutionCorrelator::fail_all).

use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::model::{ExecutionRequest, ExecutionResult};
use crate::protocol::{ExecutePayload, ResultPayload};

/// Where a finished execution is delivered.
pub type Reply = oneshot::Sender<Result<ExecutionResult>>;

/// A caller waiting on one execution.
#[derive(Debug)]
pub struct PendingEntry {
    reply: Reply,
    deadline: Instant,
    timeout: Duration,
}

impl PendingEntry {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn settle(self, outcome: Result<ExecutionResult>) {
        // The caller may have given up already.
        let _ = self.reply.send(outcome);
    }
}

/// Outstanding executions of one session.
#[derive(Debug)]
pub struct ExecutionCorrelator {
    session_key: String,
    pending: FxHashMap<String, PendingEntry>,
}

impl ExecutionCorrelator {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            pending: FxHashMap::default(),
        }
    }

    /// Record a new execution and return the request frame to write.
    pub fn register(&mut self, code: String, timeout: Duration, reply: Reply) -> ExecutePayload {
        let mut request = ExecutionRequest::new(self.session_key.clone(), code);
        while self.pending.contains_key(&request.execution_id) {
            request = ExecutionRequest::new(self.session_key.clone(), request.code);
        }
        self.insert(&request, timeout, reply);
        ExecutePayload {
            execution_id: request.execution_id,
            code: request.code,
        }
    }

    /// Record a request with a caller-chosen ID.
    ///
    /// Returns `false` (and drops `reply`) if the ID is already in flight.
    pub fn insert(&mut self, request: &ExecutionRequest, timeout: Duration, reply: Reply) -> bool {
        if self.pending.contains_key(&request.execution_id) {
            tracing::warn!(
                "Execution ID {} already in flight on session '{}'",
                request.execution_id,
                self.session_key
            );
            return false;
        }
        self.pending.insert(
            request.execution_id.clone(),
            PendingEntry {
                reply,
                deadline: Instant::now() + timeout,
                timeout,
            },
        );
        true
    }

    /// Deliver a response. Unknown, late and duplicate IDs are dropped.
    pub fn resolve(&mut self, payload: ResultPayload) -> bool {
        match self.pending.remove(&payload.execution_id) {
            Some(entry) => {
                let result = ExecutionResult::from_body(payload.execution_id, payload.result);
                entry.settle(Ok(result));
                true
            }
            None => {
                tracing::debug!(
                    "Dropping response for unknown or expired execution {} on session '{}'",
                    payload.execution_id,
                    self.session_key
                );
                false
            }
        }
    }

    /// Fail one entry, if it is still pending.
    pub fn reject(&mut self, execution_id: &str, error: Error) -> bool {
        match self.pending.remove(execution_id) {
            Some(entry) => {
                entry.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Time out every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                tracing::debug!("Execution {} on session '{}' timed out", id, self.session_key);
                let timeout = entry.timeout;
                entry.settle(Err(Error::ExecutionTimeout {
                    execution_id: id.clone(),
                    timeout,
                }));
            }
        }
        expired.len()
    }

    /// Fail everything still pending with `error` and clear the map.
    pub fn fail_all(&mut self, error: &Error) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            entry.settle(Err(error.clone()));
        }
        count
    }

    /// Earliest deadline among pending entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(PendingEntry::deadline).min()
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.pending.contains_key(execution_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
