// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay-side bridge record.
//!
//! Each open bridge owns a bounded inbound queue the consumer reads from.
//! Enqueue is non-blocking: a full queue drops the frame rather than stalling
//! the session read loop. Dropping the record (removal from the bridge table)
//! closes the queue, so consumers observe end-of-stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use unblink_tunnel::TunnelError;

use crate::state::epoch_ms;

/// A bridge as seen by the relay: inbound sink plus activity bookkeeping.
pub struct Bridge {
    pub bridge_id: String,
    pub service_id: String,
    pub service_url: String,
    pub created_at: Instant,
    tx: mpsc::Sender<Bytes>,
    last_activity_ms: AtomicU64,
    dropped: AtomicU64,
}

impl Bridge {
    /// Create a bridge with a bounded inbound queue of `capacity` frames.
    /// Returns the record and the consumer's receiving end.
    pub fn new(
        bridge_id: String,
        service_id: String,
        service_url: String,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let bridge = Self {
            bridge_id,
            service_id,
            service_url,
            created_at: Instant::now(),
            tx,
            last_activity_ms: AtomicU64::new(epoch_ms()),
            dropped: AtomicU64::new(0),
        };
        (bridge, rx)
    }

    /// Non-blocking enqueue of an inbound data frame. Drop-on-full is the
    /// documented backpressure policy on the relay → consumer edge.
    pub fn push(&self, data: Bytes) -> Result<(), TunnelError> {
        self.touch();
        match self.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    tracing::warn!(
                        bridge_id = %self.bridge_id,
                        dropped,
                        "inbound queue full, dropping frames"
                    );
                }
                Err(TunnelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TunnelError::Closed),
        }
    }

    /// Record data activity (either direction).
    pub fn touch(&self) {
        self.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last data frame in either direction.
    pub fn idle_ms(&self) -> u64 {
        epoch_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Total frames dropped on the inbound edge.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
