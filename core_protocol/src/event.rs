// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dto::{HandoffTicketDto, PlayerRecordDto};
use crate::id::{EngineId, GatewayId, SessionId, ZoneId};
use serde::{Deserialize, Serialize};

/// Why a session was (or is being) closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DisconnectReason {
    ClientQuit,
    ProtocolError,
    Backpressure,
    TransportLost,
    IdleTimeout,
    ServerShutdown,
}

/// Lets renderers choose presentation; the engine never emits escape codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TextKind {
    /// Ordinary game output.
    Line,
    /// Informational, e.g. system notices.
    Info,
    /// Rejected input or failed action.
    Error,
}

/// Result of an off-thread login lookup, re-entering via the inbound bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LoginOutcome {
    Existing(PlayerRecordDto),
    Created(PlayerRecordDto),
    /// Another live session already owns this name.
    NameInUse,
    /// The persistence collaborator failed; the player is told to retry.
    Unavailable,
}

/// Transport -> engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InboundEvent {
    Connected {
        session_id: SessionId,
        gateway: Option<GatewayId>,
        ansi: Option<bool>,
    },
    Disconnected {
        session_id: SessionId,
        reason: DisconnectReason,
    },
    LineReceived {
        session_id: SessionId,
        line: String,
    },
    GmcpReceived {
        session_id: SessionId,
        package: String,
        data: Vec<u8>,
    },
    /// Posted by the login worker, never by a transport. `epoch` is checked
    /// against the session's current epoch so completions that raced a
    /// disconnect are dropped.
    LoginCompleted {
        session_id: SessionId,
        epoch: u32,
        outcome: LoginOutcome,
    },
}

impl InboundEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Connected { session_id, .. }
            | Self::Disconnected { session_id, .. }
            | Self::LineReceived { session_id, .. }
            | Self::GmcpReceived { session_id, .. }
            | Self::LoginCompleted { session_id, .. } => *session_id,
        }
    }
}

/// Engine -> transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OutboundEvent {
    SendText {
        session_id: SessionId,
        text: String,
        kind: TextKind,
    },
    /// Consecutive prompts for one session collapse to one at flush.
    SendPrompt {
        session_id: SessionId,
    },
    ShowLoginScreen {
        session_id: SessionId,
    },
    SetAnsi {
        session_id: SessionId,
        enabled: bool,
    },
    ClearScreen {
        session_id: SessionId,
    },
    ShowAnsiDemo {
        session_id: SessionId,
    },
    Close {
        session_id: SessionId,
        reason: DisconnectReason,
    },
    /// Inbound traffic for this session should be routed to `engine` from now on.
    SessionRedirect {
        session_id: SessionId,
        engine: EngineId,
    },
    GmcpData {
        session_id: SessionId,
        package: String,
        data: Vec<u8>,
    },
}

impl OutboundEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SendText { session_id, .. }
            | Self::SendPrompt { session_id }
            | Self::ShowLoginScreen { session_id }
            | Self::SetAnsi { session_id, .. }
            | Self::ClearScreen { session_id }
            | Self::ShowAnsiDemo { session_id }
            | Self::Close { session_id, .. }
            | Self::SessionRedirect { session_id, .. }
            | Self::GmcpData { session_id, .. } => *session_id,
        }
    }

    pub fn is_prompt(&self) -> bool {
        matches!(self, Self::SendPrompt { .. })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScaleAction {
    Up,
    Down,
}

/// Engine <-> engine (and coordinator), in sharded deployments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InterEngineEvent {
    RoutedInbound {
        target: EngineId,
        event: InboundEvent,
    },
    RoutedOutbound {
        target: GatewayId,
        event: OutboundEvent,
    },
    HandoffPrepare(HandoffTicketDto),
    HandoffAck {
        session_id: SessionId,
        from: EngineId,
        to: EngineId,
    },
    HandoffReject {
        session_id: SessionId,
        from: EngineId,
        to: EngineId,
        reason: String,
    },
    HandoffCommit {
        session_id: SessionId,
        to: EngineId,
    },
    CrossEngineTell {
        target: EngineId,
        from_name: String,
        to_name: String,
        text: String,
    },
    ScaleDecision {
        zone: ZoneId,
        action: ScaleAction,
    },
}
