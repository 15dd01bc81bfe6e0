// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconnect supervisor.
//!
//! Redials the relay with exponential backoff until the retry budget is
//! exhausted. A session that registers successfully resets the budget.
//! Bridges never survive a reconnect; each session starts empty.

use std::path::Path;
use std::time::Duration;

use crate::config::{NodeConfig, ReconnectPolicy};
use crate::conn;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What to do after a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Sleep this long, then redial.
    Retry(Duration),
    /// Reconnect is disabled; exit cleanly.
    Stop,
    /// The retry budget is spent.
    GiveUp,
}

/// Retry bookkeeping between sessions.
struct RetryState {
    attempts: u32,
    backoff: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self { attempts: 0, backoff: INITIAL_BACKOFF }
    }

    /// Advance the retry state after one session. A registered session
    /// refills the budget; each failed attempt doubles the backoff up to
    /// the cap.
    fn after_session(&mut self, policy: &ReconnectPolicy, registered: bool) -> Verdict {
        if registered {
            self.attempts = 0;
            self.backoff = INITIAL_BACKOFF;
        }

        if !policy.enabled {
            return Verdict::Stop;
        }
        self.attempts += 1;
        if self.attempts > policy.max_attempts {
            return Verdict::GiveUp;
        }

        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        Verdict::Retry(delay)
    }
}

/// Run sessions until reconnect policy says stop.
pub async fn run(mut config: NodeConfig, config_path: &Path) -> anyhow::Result<()> {
    let mut retry = RetryState::new();

    loop {
        let registered = match conn::run_session(&mut config, config_path).await {
            Ok(outcome) => outcome.registered,
            Err(e) => {
                tracing::warn!(err = %e, relay = %config.relay_address, "relay dial failed");
                false
            }
        };

        match retry.after_session(&config.reconnect, registered) {
            Verdict::Stop => {
                tracing::info!("reconnect disabled, exiting");
                return Ok(());
            }
            Verdict::GiveUp => {
                anyhow::bail!(
                    "giving up after {} reconnect attempts",
                    config.reconnect.max_attempts
                );
            }
            Verdict::Retry(delay) => {
                tracing::info!(
                    attempt = retry.attempts,
                    max_attempts = config.reconnect.max_attempts,
                    backoff_secs = delay.as_secs(),
                    "reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
