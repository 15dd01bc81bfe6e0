// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host identity hints sent during enrollment.
//!
//! Hostname and MAC addresses are weak hints for the operator dashboard,
//! never trusted input on the relay side.

/// Identity presented to the relay during enrollment.
#[derive(Debug, Clone)]
pub struct Identity {
    pub node_id: String,
    pub hostname: String,
    pub mac_addresses: Vec<String>,
}

impl Identity {
    pub fn collect(node_id: String) -> Self {
        Self { node_id, hostname: hostname(), mac_addresses: mac_addresses() }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Collect MAC addresses from /sys/class/net, skipping loopback and
/// unset/zeroed interfaces.
fn mac_addresses() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };

    let mut macs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(entry.path().join("address")) else {
            continue;
        };
        let mac = raw.trim();
        if mac.is_empty() || mac == "00:00:00:00:00:00" {
            continue;
        }
        macs.push(mac.to_owned());
    }
    macs.sort();
    macs.dedup();
    macs
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
