// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request/response correlation.
//!
//! Every awaited request registers a one-shot completion sink under its
//! message id before the frame is written, so a response racing the
//! registration is still deliverable. Sinks either complete with the
//! response or are cancelled with [`TunnelError::Closed`]; they are never
//! leaked (a waiter that times out removes its own entry).

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::TunnelError;
use crate::message::Message;

type Sink = oneshot::Sender<Result<Message, TunnelError>>;

/// Map of in-flight request ids to their completion sinks.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, Sink>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the given id. Call before writing the request.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Result<Message, TunnelError>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id, tx);
        }
        rx
    }

    /// Complete the waiter for `id` with a response.
    ///
    /// Returns false when no waiter is registered; the caller decides
    /// whether a late or unsolicited response is an error.
    pub fn complete(&self, id: u64, msg: Message) -> bool {
        let sink = match self.inner.lock() {
            Ok(mut map) => map.remove(&id),
            Err(_) => None,
        };
        match sink {
            Some(tx) => {
                // A receiver dropped between timeout and removal is fine.
                let _ = tx.send(Ok(msg));
                true
            }
            None => false,
        }
    }

    /// Remove a waiter without completing it. Used by waiters that timed
    /// out or were cancelled, so a late response finds no sink.
    pub fn cancel(&self, id: u64) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&id);
        }
    }

    /// Fail every outstanding waiter with [`TunnelError::Closed`].
    pub fn cancel_all(&self) {
        let drained: Vec<Sink> = match self.inner.lock() {
            Ok(mut map) => map.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        };
        for tx in drained {
            let _ = tx.send(Err(TunnelError::Closed));
        }
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "pending_tests.rs"]
mod tests;
