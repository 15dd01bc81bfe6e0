// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Enrollment state machine.
//!
//! A tagged [`State`] plus a pure [`handle`] function: every inbound message
//! maps to a next state and a list of [`Action`]s for the driver to execute.
//! Invalid transitions are unrepresentable or end in [`State::Closed`]; the
//! supervisor decides whether to redial.

use unblink_tunnel::Message;

use crate::identity::Identity;

/// Connection states. The transport is already dialed when the machine
/// starts; `Closed` is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    CheckingToken,
    RequestingToken,
    Registering,
    Registered,
    Closed,
}

/// Effects the driver performs after a step. Messages are built with a
/// placeholder id and stamped with the session counter at the send point.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Message),
    /// Persist a freshly issued token before registering with it.
    PersistToken(String),
    /// Surface the dashboard URL to the operator.
    AnnounceDashboard(String),
    /// Enrollment finished: emit NodeReady and accept bridge traffic.
    Ready,
    /// Route a bridge message to the bridge handler.
    Bridge(Message),
    /// Terminate the session with a reason.
    Fatal(String),
}

/// Result of one machine step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: State,
    pub actions: Vec<Action>,
}

impl Step {
    fn to(next: State) -> Self {
        Self { next, actions: Vec::new() }
    }

    fn with(next: State, action: Action) -> Self {
        Self { next, actions: vec![action] }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        Self { next: State::Closed, actions: vec![Action::Fatal(reason.into())] }
    }
}

/// Inputs the machine needs beyond the inbound message.
pub struct Ctx {
    pub identity: Identity,
    /// Currently held token, if any.
    pub token: Option<String>,
}

fn token_check(ctx: &Ctx, token: &str) -> Message {
    Message::TokenCheckRequest {
        id: 0,
        node_id: ctx.identity.node_id.clone(),
        token: token.to_owned(),
    }
}

fn new_token(ctx: &Ctx) -> Message {
    Message::NewTokenRequest {
        id: 0,
        node_id: ctx.identity.node_id.clone(),
        hostname: ctx.identity.hostname.clone(),
        mac_addresses: ctx.identity.mac_addresses.clone(),
    }
}

fn register(ctx: &Ctx, token: &str) -> Message {
    Message::RegisterRequest {
        id: 0,
        node_id: ctx.identity.node_id.clone(),
        token: token.to_owned(),
        hostname: ctx.identity.hostname.clone(),
        mac_addresses: ctx.identity.mac_addresses.clone(),
    }
}

/// First step after the transport comes up: check a configured token, or
/// ask for a fresh one.
pub fn start(ctx: &Ctx) -> Step {
    match ctx.token.as_deref() {
        Some(token) if !token.is_empty() => {
            Step::with(State::CheckingToken, Action::Send(token_check(ctx, token)))
        }
        _ => Step::with(State::RequestingToken, Action::Send(new_token(ctx))),
    }
}

/// Advance the machine with one inbound message.
pub fn handle(state: State, ctx: &Ctx, msg: Message) -> Step {
    match (state, msg) {
        (State::CheckingToken, Message::TokenCheckResponse { valid: true, .. }) => {
            match ctx.token.as_deref() {
                Some(token) => Step::with(State::Registering, Action::Send(register(ctx, token))),
                None => Step::fatal("token validated but none held"),
            }
        }
        (State::CheckingToken, Message::TokenCheckResponse { valid: false, .. }) => {
            tracing::info!("persisted token rejected, requesting a new one");
            Step::with(State::RequestingToken, Action::Send(new_token(ctx)))
        }

        (State::RequestingToken, Message::NewTokenResponse { token: Some(token), .. }) => Step {
            next: State::Registering,
            actions: vec![
                Action::PersistToken(token.clone()),
                Action::Send(register(ctx, &token)),
            ],
        },
        (State::RequestingToken, Message::NewTokenResponse { token: None, error, .. }) => {
            Step::fatal(format!(
                "token issuance refused: {}",
                error.unwrap_or_else(|| "unspecified".to_owned())
            ))
        }

        (State::Registering, Message::RegisterResponse { success: true, dashboard_url, .. }) => {
            let mut actions = Vec::new();
            if let Some(url) = dashboard_url.filter(|u| !u.is_empty()) {
                actions.push(Action::AnnounceDashboard(url));
            }
            actions.push(Action::Ready);
            Step { next: State::Registered, actions }
        }
        (State::Registering, Message::RegisterResponse { success: false, error, .. }) => {
            // No in-session token retry; the supervisor redials if allowed.
            Step::fatal(format!(
                "registration rejected: {}",
                error.unwrap_or_else(|| "unspecified".to_owned())
            ))
        }

        (
            State::Registered,
            msg @ (Message::OpenBridgeRequest { .. }
            | Message::CloseBridgeRequest { .. }
            | Message::BridgeData { .. }),
        ) => Step::with(State::Registered, Action::Bridge(msg)),

        // Responses to our own best-effort bridge closes; nothing waits.
        (State::Registered, Message::CloseBridgeResponse { .. }) => Step::to(State::Registered),

        (State::Closed, _) => Step::to(State::Closed),

        (state, msg) => {
            Step::fatal(format!("unexpected {} in {state:?}", msg.kind()))
        }
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
