// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token issuance and verification for node enrollment.
//!
//! Tokens are `base64url(nonce || HMAC-SHA256(secret, nonce || node_id))`.
//! Verification recomputes the tag and compares in constant time; the
//! response to the peer never says which check failed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hmac, rand};

/// Nonce length prepended to each token.
const NONCE_LEN: usize = 16;

/// HMAC-SHA256 tag length.
const TAG_LEN: usize = 32;

/// Issues and verifies node bearer tokens.
pub trait TokenAuthority: Send + Sync {
    /// Mint an opaque, unforgeable bearer token bound to `node_id`.
    fn issue(&self, node_id: &str) -> Result<String, unblink_tunnel::TunnelError>;

    /// Check a presented token against `node_id`.
    fn verify(&self, token: &str, node_id: &str) -> bool;
}

/// HMAC-based authority backed by a server-side secret.
pub struct HmacTokenAuthority {
    key: hmac::Key,
    rng: SystemRandom,
}

impl HmacTokenAuthority {
    pub fn new(secret: &[u8]) -> Self {
        Self { key: hmac::Key::new(hmac::HMAC_SHA256, secret), rng: SystemRandom::new() }
    }

    /// Build an authority from the configured secret, generating a random
    /// one when absent. Generated secrets do not survive restarts, so
    /// previously issued tokens stop verifying.
    pub fn from_config(secret: Option<&str>) -> anyhow::Result<Self> {
        match secret {
            Some(encoded) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(encoded.trim_end_matches('='))
                    .map_err(|e| anyhow::anyhow!("invalid --secret: {e}"))?;
                Ok(Self::new(&bytes))
            }
            None => {
                let mut secret = [0u8; 32];
                let sys = rand::SystemRandom::new();
                sys.fill(&mut secret)
                    .map_err(|_| anyhow::anyhow!("system rng unavailable"))?;
                tracing::warn!("no --secret configured; node tokens will not survive a restart");
                Ok(Self::new(&secret))
            }
        }
    }

    fn tag(&self, nonce: &[u8], node_id: &str) -> hmac::Tag {
        let mut msg = Vec::with_capacity(nonce.len() + node_id.len());
        msg.extend_from_slice(nonce);
        msg.extend_from_slice(node_id.as_bytes());
        hmac::sign(&self.key, &msg)
    }
}

impl TokenAuthority for HmacTokenAuthority {
    fn issue(&self, node_id: &str) -> Result<String, unblink_tunnel::TunnelError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| unblink_tunnel::TunnelError::Auth("token generation failed".into()))?;

        let tag = self.tag(&nonce, node_id);
        let mut raw = Vec::with_capacity(NONCE_LEN + TAG_LEN);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(tag.as_ref());
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn verify(&self, token: &str, node_id: &str) -> bool {
        let raw = match URL_SAFE_NO_PAD.decode(token) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        if raw.len() != NONCE_LEN + TAG_LEN {
            return false;
        }
        let (nonce, presented) = raw.split_at(NONCE_LEN);
        let mut msg = Vec::with_capacity(NONCE_LEN + node_id.len());
        msg.extend_from_slice(nonce);
        msg.extend_from_slice(node_id.as_bytes());
        hmac::verify(&self.key, &msg, presented).is_ok()
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
