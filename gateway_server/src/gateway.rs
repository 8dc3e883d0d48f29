// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::session::{Delivery, SessionAllocator, SessionFrame, SessionRegistry};
use crate::telnet::{self, TelnetDecoder, TelnetError, TelnetEvent};
use core_protocol::bus::{BusError, EventSink};
use core_protocol::event::{DisconnectReason, InboundEvent, OutboundEvent};
use core_protocol::id::{EngineId, GatewayId, SessionId};
use log::{debug, error, info, warn};
use server_util::rate_limiter::{RateLimiterProps, RateLimiterState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
pub struct GatewayConfig {
    pub gateway_id: GatewayId,
    pub session_queue: usize,
    pub overflow_grace: Duration,
    pub max_line_len: usize,
    pub max_nonprintable: usize,
    pub line_rate: RateLimiterProps,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: GatewayId::new(1).unwrap(),
            session_queue: 128,
            overflow_grace: Duration::from_secs(5),
            max_line_len: 512,
            max_nonprintable: 32,
            line_rate: RateLimiterProps::new(Duration::from_millis(100), 10),
        }
    }
}

/// Routes each session's inbound traffic to the engine that owns it.
/// `SessionRedirect` moves a session between engines without the client
/// noticing; the session id never changes.
pub struct InboundRouter {
    default_engine: EngineId,
    sinks: HashMap<EngineId, Arc<dyn EventSink<InboundEvent>>>,
    assignments: Mutex<HashMap<SessionId, EngineId>>,
}

impl InboundRouter {
    pub fn new(
        default_engine: EngineId,
        sinks: HashMap<EngineId, Arc<dyn EventSink<InboundEvent>>>,
    ) -> Self {
        Self {
            default_engine,
            sinks,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    pub fn single(engine: EngineId, sink: Arc<dyn EventSink<InboundEvent>>) -> Self {
        let mut sinks = HashMap::new();
        sinks.insert(engine, sink);
        Self::new(engine, sinks)
    }

    pub fn redirect(&self, session_id: SessionId, engine: EngineId) {
        self.assignments.lock().unwrap().insert(session_id, engine);
    }

    pub fn forget(&self, session_id: SessionId) {
        self.assignments.lock().unwrap().remove(&session_id);
    }

    fn engine_for(&self, session_id: SessionId) -> EngineId {
        self.assignments
            .lock()
            .unwrap()
            .get(&session_id)
            .copied()
            .unwrap_or(self.default_engine)
    }
}

impl EventSink<InboundEvent> for InboundRouter {
    fn publish(&self, event: InboundEvent) -> Result<(), BusError> {
        let engine = self.engine_for(event.session_id());
        match self.sinks.get(&engine) {
            Some(sink) => sink.publish(event),
            None => {
                warn!("no sink for {}", engine);
                Err(BusError::Closed)
            }
        }
    }
}

/// Transport-side hub: session registry, allocator, and inbound routing.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<SessionRegistry>,
    pub allocator: Arc<SessionAllocator>,
    pub router: Arc<InboundRouter>,
    /// Raised by a fatal invariant; the composition root turns it into a
    /// non-zero exit after the drain.
    fatal: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        allocator: Arc<SessionAllocator>,
        router: Arc<InboundRouter>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            registry: Arc::new(SessionRegistry::new(config.overflow_grace)),
            config,
            allocator,
            router,
            fatal: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn had_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Resolves once a fatal invariant started the drain, so composition
    /// roots can stop their listeners alongside ctrl-c.
    pub async fn shutdown_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Fatal invariant (e.g. an invalidated session lease): dump state,
    /// close every session so the engines observe disconnects and persist
    /// their records, then signal the composition root to stop. Never an
    /// abrupt exit; in-flight writers finish their frames.
    pub fn begin_fatal_shutdown(&self, reason: &str) {
        if self.fatal.swap(true, Ordering::AcqRel) {
            return;
        }
        let (last_ms, counter) = self.allocator.snapshot();
        let sessions = self.registry.session_ids();
        error!(
            "fatal on {}: {}; allocator last_ms={} counter={}, draining {} sessions: {:?}",
            self.config.gateway_id,
            reason,
            last_ms,
            counter,
            sessions.len(),
            sessions
        );
        for session_id in sessions {
            let _ = self
                .registry
                .deliver(session_id, SessionFrame::Close(DisconnectReason::ServerShutdown));
            self.report_disconnect(session_id, DisconnectReason::ServerShutdown);
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Applies one engine-emitted event to the owning session's queue. The
    /// pump thread (local mode) and the RPC handler (split mode) both end
    /// up here.
    pub fn deliver(&self, event: OutboundEvent) {
        let session_id = event.session_id();
        let frame = match event {
            OutboundEvent::SendText { text, kind, .. } => SessionFrame::Text { text, kind },
            OutboundEvent::SendPrompt { .. } => SessionFrame::Prompt,
            OutboundEvent::ShowLoginScreen { .. } => SessionFrame::ShowLoginScreen,
            OutboundEvent::SetAnsi { enabled, .. } => {
                self.registry.set_ansi(session_id, enabled);
                SessionFrame::SetAnsi(enabled)
            }
            OutboundEvent::ClearScreen { .. } => SessionFrame::ClearScreen,
            OutboundEvent::ShowAnsiDemo { .. } => SessionFrame::ShowAnsiDemo,
            OutboundEvent::Close { reason, .. } => SessionFrame::Close(reason),
            OutboundEvent::SessionRedirect { engine, .. } => {
                info!("session {} redirected to {}", session_id, engine);
                self.router.redirect(session_id, engine);
                return;
            }
            OutboundEvent::GmcpData { package, data, .. } => {
                if !self.registry.gmcp_enabled(session_id) {
                    return;
                }
                SessionFrame::Gmcp { package, data }
            }
        };
        match self.registry.deliver(session_id, frame) {
            Delivery::Sent | Delivery::Dropped => {}
            Delivery::Overflowed => {
                // Queue stayed full past the grace period; cut the session
                // loose rather than buffer without bound.
                warn!("session {} overflowed; disconnecting", session_id);
                let _ = self
                    .registry
                    .deliver(session_id, SessionFrame::Close(DisconnectReason::Backpressure));
                self.report_disconnect(session_id, DisconnectReason::Backpressure);
            }
            Delivery::UnknownSession => {
                debug!("outbound event for unknown session {}", session_id);
            }
        }
    }

    /// Local-topology pump: drains the engine's outbound channel on a
    /// dedicated thread.
    pub fn spawn_outbound_pump(
        self: &Arc<Self>,
        rx: std::sync::mpsc::Receiver<OutboundEvent>,
    ) -> std::thread::JoinHandle<()> {
        let gateway = Arc::clone(self);
        std::thread::Builder::new()
            .name("outbound-pump".to_owned())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    gateway.deliver(event);
                }
            })
            .expect("failed to spawn outbound pump")
    }

    pub fn report_disconnect(&self, session_id: SessionId, reason: DisconnectReason) {
        self.router.forget(session_id);
        if self
            .router
            .publish(InboundEvent::Disconnected { session_id, reason })
            .is_err()
        {
            warn!("inbound bus refused disconnect for {}", session_id);
        }
    }

    /// Accept loop for the line-oriented protocol.
    pub async fn run_telnet_listener(self: Arc<Self>, bind: String) {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("telnet bind {} failed: {}", bind, e);
                return;
            }
        };
        info!("telnet listening on {}", bind);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("telnet accept from {}", peer);
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        gateway.serve_telnet(stream).await;
                    });
                }
                Err(e) => warn!("telnet accept failed: {}", e),
            }
        }
    }

    async fn serve_telnet(self: Arc<Self>, stream: tokio::net::TcpStream) {
        if self.is_shutting_down() {
            return;
        }
        let session_id = match self.allocator.allocate(core_protocol::get_unix_time_now) {
            Ok(session_id) => session_id,
            Err(e) => {
                // Lease invalidation is fatal for the whole gateway, but
                // already-connected sessions still drain cleanly.
                self.begin_fatal_shutdown(&format!("session allocation failed: {:?}", e));
                return;
            }
        };

        let (mut read_half, mut write_half) = stream.into_split();
        let _ = write_half.write_all(&telnet::negotiation_banner()).await;
        let _ = write_half.write_all(&telnet::request_terminal_type()).await;

        let (tx, mut rx) = mpsc::channel::<SessionFrame>(self.config.session_queue);
        self.registry.register(session_id, tx, false);
        if self
            .router
            .publish(InboundEvent::Connected {
                session_id,
                gateway: Some(self.config.gateway_id),
                ansi: None,
            })
            .is_err()
        {
            warn!("inbound bus refused connect for {}", session_id);
            self.registry.unregister(session_id);
            return;
        }

        // Writer half: frames from the engine, prompts coalesced per burst.
        let writer = tokio::spawn(async move {
            let mut pending_prompt = false;
            'outer: while let Some(first) = rx.recv().await {
                let mut burst = vec![first];
                while let Ok(frame) = rx.try_recv() {
                    burst.push(frame);
                }
                for frame in burst {
                    match frame {
                        SessionFrame::Text { text, .. } => {
                            if write_half.write_all(&telnet::frame_line(&text)).await.is_err() {
                                break 'outer;
                            }
                        }
                        SessionFrame::Prompt => pending_prompt = true,
                        SessionFrame::Gmcp { package, data } => {
                            if write_half
                                .write_all(&telnet::frame_gmcp(&package, &data))
                                .await
                                .is_err()
                            {
                                break 'outer;
                            }
                        }
                        SessionFrame::ShowLoginScreen => {
                            let banner = "\r\nAmbonMUD\r\n";
                            if write_half
                                .write_all(telnet::frame_line(banner).as_slice())
                                .await
                                .is_err()
                            {
                                break 'outer;
                            }
                        }
                        SessionFrame::ClearScreen => {
                            if write_half.write_all(b"\x1b[2J\x1b[H").await.is_err() {
                                break 'outer;
                            }
                        }
                        SessionFrame::SetAnsi(_) | SessionFrame::ShowAnsiDemo => {
                            // Rendering policy belongs to the renderer; the
                            // transport just tracks the capability.
                        }
                        SessionFrame::Close(_) => {
                            let _ = write_half.write_all(b"\r\n").await;
                            break 'outer;
                        }
                    }
                }
                if pending_prompt {
                    pending_prompt = false;
                    if write_half.write_all(&telnet::frame_prompt()).await.is_err() {
                        break 'outer;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader half: bytes to lines to inbound events.
        let mut decoder = TelnetDecoder::new(self.config.max_line_len, self.config.max_nonprintable);
        let mut rate = RateLimiterState::default();
        let mut chunk = [0u8; 2048];
        let reason = loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) => break DisconnectReason::ClientQuit,
                Ok(n) => n,
                Err(_) => break DisconnectReason::TransportLost,
            };
            let events = match decoder.push(&chunk[..n]) {
                Ok(events) => events,
                Err(TelnetError::LineTooLong) | Err(TelnetError::BinaryGarbage) => {
                    let _ = self.registry.deliver(
                        session_id,
                        SessionFrame::Text {
                            text: "Protocol violation.".to_owned(),
                            kind: core_protocol::event::TextKind::Error,
                        },
                    );
                    break DisconnectReason::ProtocolError;
                }
            };
            let mut broke = None;
            for event in events {
                match event {
                    TelnetEvent::Line(line) => {
                        if rate.should_limit_rate(&self.config.line_rate, std::time::Instant::now())
                        {
                            continue;
                        }
                        if self
                            .router
                            .publish(InboundEvent::LineReceived { session_id, line })
                            .is_err()
                        {
                            broke = Some(DisconnectReason::Backpressure);
                            break;
                        }
                    }
                    TelnetEvent::Gmcp { package, data } => {
                        let _ = self.router.publish(InboundEvent::GmcpReceived {
                            session_id,
                            package,
                            data,
                        });
                    }
                    TelnetEvent::OptionEnabled(telnet::OPT_GMCP) => {
                        self.registry.set_gmcp(session_id, true);
                    }
                    TelnetEvent::OptionDisabled(telnet::OPT_GMCP) => {
                        self.registry.set_gmcp(session_id, false);
                    }
                    TelnetEvent::WindowSize { width, height } => {
                        debug!("session {} window {}x{}", session_id, width, height);
                    }
                    TelnetEvent::TerminalType(name) => {
                        debug!("session {} terminal {}", session_id, name);
                        // ANSI-capable unless the terminal says "dumb".
                        self.registry
                            .set_ansi(session_id, !name.eq_ignore_ascii_case("dumb"));
                    }
                    TelnetEvent::OptionEnabled(_) | TelnetEvent::OptionDisabled(_) => {}
                }
            }
            if let Some(reason) = broke {
                break reason;
            }
        };

        self.registry.unregister(session_id);
        self.report_disconnect(session_id, reason);
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_protocol::bus::local_channel;
    use core_protocol::id::LeaseId;

    #[tokio::test]
    async fn fatal_shutdown_drains_sessions_instead_of_exiting() {
        let (inbound_tx, inbound_rx) = local_channel::<InboundEvent>(16);
        let engine = EngineId::new(1).unwrap();
        let router = Arc::new(InboundRouter::single(engine, Arc::new(inbound_tx)));
        let allocator = Arc::new(SessionAllocator::new(LeaseId::default(), 1_000));
        let gateway = Gateway::new(GatewayConfig::default(), allocator, router);

        let (tx, mut rx) = mpsc::channel::<SessionFrame>(8);
        let session_id = SessionId::compose(1_000, LeaseId::default(), 1).unwrap();
        gateway.registry.register(session_id, tx, true);

        gateway.begin_fatal_shutdown("lease invalidated");
        assert!(gateway.had_fatal());
        assert!(gateway.is_shutting_down());

        // The live session was told to close, not cut off.
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionFrame::Close(DisconnectReason::ServerShutdown)
        ));
        // The engine observes the disconnect so it can persist the record.
        assert!(matches!(
            inbound_rx.try_recv().unwrap(),
            InboundEvent::Disconnected {
                reason: DisconnectReason::ServerShutdown,
                ..
            }
        ));
        // Composition roots waiting on the signal wake immediately.
        gateway.shutdown_signal().await;

        // Re-entry is a no-op.
        gateway.begin_fatal_shutdown("again");
        assert!(rx.try_recv().is_err());
    }
}
