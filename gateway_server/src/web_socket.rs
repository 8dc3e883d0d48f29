// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! WebSocket transport. Text frames carry command lines client->server and
//! JSON-framed output server->client; structured data rides the same socket
//! as a tagged JSON frame, batched into the writer's flush bursts.

use crate::gateway::Gateway;
use crate::session::SessionFrame;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use core_protocol::bus::EventSink;
use core_protocol::event::{DisconnectReason, InboundEvent, TextKind};
use log::{debug, info, warn};
use serde::Serialize;
use server_util::rate_limiter::RateLimiterState;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Server -> client wire frames, JSON-encoded one per WebSocket message.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame<'a> {
    Text { text: &'a str, kind: &'a str },
    Prompt,
    Gmcp { package: &'a str, data: &'a serde_json::value::RawValue },
    LoginScreen,
    ClearScreen,
    Ansi { enabled: bool },
    AnsiDemo,
    Close { reason: String },
}

fn kind_str(kind: TextKind) -> &'static str {
    match kind {
        TextKind::Line => "line",
        TextKind::Info => "info",
        TextKind::Error => "error",
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(gateway)
}

pub async fn run_listener(gateway: Arc<Gateway>, bind: String) {
    let app = router(gateway);
    info!("websocket listening on {}", bind);
    let addr: std::net::SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("websocket bind {} invalid: {}", bind, e);
            return;
        }
    };
    if let Err(e) = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
    {
        warn!("websocket server stopped: {}", e);
    }
}

async fn upgrade_handler(
    State(gateway): State<Arc<Gateway>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| serve_socket(gateway, socket))
}

async fn serve_socket(gateway: Arc<Gateway>, mut socket: WebSocket) {
    if gateway.is_shutting_down() {
        return;
    }
    let session_id = match gateway.allocator.allocate(core_protocol::get_unix_time_now) {
        Ok(session_id) => session_id,
        Err(e) => {
            // Lease invalidation is fatal for the whole gateway, but
            // already-connected sessions still drain cleanly.
            gateway.begin_fatal_shutdown(&format!("session allocation failed: {:?}", e));
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<SessionFrame>(gateway.config.session_queue);
    gateway.registry.register(session_id, tx, true);
    // WebSocket clients always get the structured-data stream.
    gateway.registry.set_gmcp(session_id, true);

    if gateway
        .router
        .publish(InboundEvent::Connected {
            session_id,
            gateway: Some(gateway.config.gateway_id),
            ansi: Some(true),
        })
        .is_err()
    {
        warn!("inbound bus refused connect for {}", session_id);
        gateway.registry.unregister(session_id);
        return;
    }

    let mut rate = RateLimiterState::default();
    let reason = loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if rate.should_limit_rate(&gateway.config.line_rate, std::time::Instant::now()) {
                            continue;
                        }
                        for line in text.lines() {
                            if gateway
                                .router
                                .publish(InboundEvent::LineReceived {
                                    session_id,
                                    line: line.to_owned(),
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("binary frame from {} ignored", session_id);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break DisconnectReason::ClientQuit,
                    Some(Err(e)) => {
                        debug!("websocket error from {}: {}", session_id, e);
                        break DisconnectReason::TransportLost;
                    }
                    None => break DisconnectReason::ClientQuit,
                }
            }
            maybe_frame = rx.recv() => {
                let Some(first) = maybe_frame else {
                    break DisconnectReason::ServerShutdown;
                };
                // Batch whatever is queued into one flush, collapsing
                // prompts so at most one trails the burst.
                let mut burst = vec![first];
                while let Ok(frame) = rx.try_recv() {
                    burst.push(frame);
                }
                let mut pending_prompt = false;
                let mut close = None;
                let mut out = Vec::new();
                for frame in burst {
                    match frame {
                        SessionFrame::Text { text, kind } => out.push(
                            serde_json::to_string(&WsFrame::Text {
                                text: &text,
                                kind: kind_str(kind),
                            })
                            .ok(),
                        ),
                        SessionFrame::Prompt => pending_prompt = true,
                        SessionFrame::Gmcp { package, data } => {
                            let raw = serde_json::from_slice::<Box<serde_json::value::RawValue>>(&data).ok();
                            if let Some(raw) = raw {
                                out.push(
                                    serde_json::to_string(&WsFrame::Gmcp {
                                        package: &package,
                                        data: &raw,
                                    })
                                    .ok(),
                                );
                            }
                        }
                        SessionFrame::ShowLoginScreen => {
                            out.push(serde_json::to_string(&WsFrame::LoginScreen).ok())
                        }
                        SessionFrame::ClearScreen => {
                            out.push(serde_json::to_string(&WsFrame::ClearScreen).ok())
                        }
                        SessionFrame::SetAnsi(enabled) => {
                            out.push(serde_json::to_string(&WsFrame::Ansi { enabled }).ok())
                        }
                        SessionFrame::ShowAnsiDemo => {
                            out.push(serde_json::to_string(&WsFrame::AnsiDemo).ok())
                        }
                        SessionFrame::Close(reason) => {
                            close = Some(reason);
                        }
                    }
                }
                if pending_prompt {
                    out.push(serde_json::to_string(&WsFrame::Prompt).ok());
                }
                let mut failed = false;
                for text in out.into_iter().flatten() {
                    if socket.send(Message::Text(text)).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break DisconnectReason::TransportLost;
                }
                if let Some(reason) = close {
                    let text = serde_json::to_string(&WsFrame::Close {
                        reason: format!("{:?}", reason),
                    })
                    .unwrap_or_default();
                    let _ = socket.send(Message::Text(text)).await;
                    let _ = socket.send(Message::Close(None)).await;
                    break DisconnectReason::ClientQuit;
                }
            }
        }
    };

    gateway.registry.unregister(session_id);
    gateway.report_disconnect(session_id, reason);
}
