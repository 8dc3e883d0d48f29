// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport termination: telnet and WebSocket listeners, per-session
//! bounded outbound queues with prompt coalescing, and session-id
//! allocation. The gateway owns no game state; it shuttles events between
//! clients and whichever engine owns each session.

pub mod gateway;
pub mod session;
pub mod telnet;
pub mod web_socket;
