// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming-RPC bus: long-lived TCP streams carrying length-prefixed
//! bincode frames with per-stream sequence numbers and piggybacked ack
//! watermarks. Clients reconnect with exponential backoff and resume from
//! their watermark; a server that cannot resume declares session loss.

use core_protocol::bus::{BusError, EventSink};
use core_protocol::event::{InboundEvent, InterEngineEvent, OutboundEvent};
use core_protocol::rpc::{decode_frame, encode_frame, Frame, FrameBody};
use log::{debug, info, warn};
use server_util::backoff::Backoff;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Delivered frames land here, on the runtime's worker threads; handlers
/// must only enqueue toward the tick thread.
pub type Handler = Arc<dyn Fn(FrameBody) + Send + Sync>;

const PING_INTERVAL_SECS: u64 = 10;
/// Unacked frames kept for resume; beyond this the link is declared lost.
const RESEND_LIMIT: usize = 4096;

/// Producer endpoint feeding a stream task. One sink serves whichever
/// event types the deployment routes over this link.
#[derive(Clone)]
pub struct RpcSink {
    tx: mpsc::Sender<FrameBody>,
}

impl RpcSink {
    fn push(&self, body: FrameBody) -> Result<(), BusError> {
        self.tx.try_send(body).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::Full,
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }

    /// Raw frame enqueue, for callers that pre-wrap events (e.g. sealed
    /// inter-engine envelopes).
    pub fn send_body(&self, body: FrameBody) -> Result<(), BusError> {
        self.push(body)
    }
}

impl EventSink<InboundEvent> for RpcSink {
    fn publish(&self, event: InboundEvent) -> Result<(), BusError> {
        self.push(FrameBody::Inbound(event))
    }
}

impl EventSink<OutboundEvent> for RpcSink {
    fn publish(&self, event: OutboundEvent) -> Result<(), BusError> {
        self.push(FrameBody::Outbound(event))
    }
}

impl EventSink<InterEngineEvent> for RpcSink {
    fn publish(&self, event: InterEngineEvent) -> Result<(), BusError> {
        self.push(FrameBody::InterEngine(event))
    }
}

/// Sequence bookkeeping for one direction pair of a link.
#[derive(Default)]
struct LinkState {
    next_seq: u64,
    /// Highest seq received from the peer (the ack we piggyback).
    last_seen: u64,
    /// Sent but unacked, for resume after reconnect.
    resend: VecDeque<Frame>,
}

impl LinkState {
    fn next_frame(&mut self, body: FrameBody) -> Frame {
        self.next_seq += 1;
        Frame {
            seq: self.next_seq,
            ack: self.last_seen,
            body,
        }
    }

    fn on_ack(&mut self, ack: u64) {
        while let Some(front) = self.resend.front() {
            if front.seq <= ack {
                self.resend.pop_front();
            } else {
                break;
            }
        }
    }

    /// Keeps only frames the peer has not seen, for replay after Hello.
    fn trim_to(&mut self, peer_last_seen: u64) {
        self.on_ack(peer_last_seen);
    }
}

async fn send_frame(write: &mut OwnedWriteHalf, frame: &Frame) -> io::Result<()> {
    let bytes = encode_frame(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))?;
    write.write_all(&bytes).await
}

/// Connects (and reconnects forever) to a server, pumping queued bodies out
/// and delivering received bodies to the handler.
pub fn spawn_client(
    handle: &tokio::runtime::Handle,
    addr: String,
    source: String,
    handler: Handler,
    queue: usize,
) -> RpcSink {
    let (tx, rx) = mpsc::channel(queue);
    handle.spawn(run_client(addr, source, rx, handler));
    RpcSink { tx }
}

async fn run_client(
    addr: String,
    source: String,
    mut rx: mpsc::Receiver<FrameBody>,
    handler: Handler,
) {
    let mut backoff = Backoff::standard();
    let mut link = LinkState::default();
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("rpc connected to {}", addr);
                backoff.reset();
                match drive(stream, &source, &mut rx, &handler, &mut link).await {
                    Ok(()) => {
                        // Producer side closed; nothing left to do.
                        return;
                    }
                    Err(e) => {
                        debug!("rpc link to {} broke: {}", addr, e);
                    }
                }
            }
            Err(e) => {
                debug!("rpc connect to {} failed: {}", addr, e);
            }
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Pumps one live connection until it breaks. `Ok(())` means the local
/// producer hung up and the task should end.
async fn drive(
    stream: TcpStream,
    source: &str,
    rx: &mut mpsc::Receiver<FrameBody>,
    handler: &Handler,
    link: &mut LinkState,
) -> io::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    let hello = Frame {
        seq: 0,
        ack: link.last_seen,
        body: FrameBody::Hello {
            source: source.to_owned(),
            last_seen_seq: link.last_seen,
        },
    };
    send_frame(&mut write_half, &hello).await?;

    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let mut ping = tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_body = rx.recv() => {
                let Some(body) = maybe_body else {
                    return Ok(());
                };
                let frame = link.next_frame(body);
                if link.resend.len() >= RESEND_LIMIT {
                    // Too far behind to ever resume; surface as a break.
                    return Err(io::Error::new(io::ErrorKind::Other, "resend overflow"));
                }
                link.resend.push_back(frame.clone());
                send_frame(&mut write_half, &frame).await?;
            }
            read = read_half.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    let decoded = decode_frame(&buf)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))?;
                    let Some((frame, used)) = decoded else {
                        break;
                    };
                    buf.drain(..used);
                    link.on_ack(frame.ack);
                    match frame.body {
                        FrameBody::Hello { last_seen_seq, .. } => {
                            // Replay what the peer missed.
                            link.trim_to(last_seen_seq);
                            let pending: Vec<Frame> = link.resend.iter().cloned().collect();
                            for frame in pending {
                                send_frame(&mut write_half, &frame).await?;
                            }
                        }
                        FrameBody::SessionLoss => {
                            warn!("peer declared session loss");
                            link.resend.clear();
                            (handler.as_ref())(FrameBody::SessionLoss);
                        }
                        FrameBody::Ping { .. } => {}
                        body => {
                            // Replays below the watermark are duplicates.
                            if frame.seq > link.last_seen {
                                link.last_seen = frame.seq;
                                (handler.as_ref())(body);
                            }
                        }
                    }
                }
            }
            _ = ping.tick() => {
                let frame = Frame {
                    seq: 0,
                    ack: link.last_seen,
                    body: FrameBody::Ping { timestamp: core_protocol::get_unix_time_now() },
                };
                send_frame(&mut write_half, &frame).await?;
            }
        }
    }
}

/// What the server remembers about a peer across reconnects.
#[derive(Default)]
struct PeerMemory {
    inbound_last_seen: u64,
    outbound_next_seq: u64,
}

/// Accepting side. Keeps a per-peer outbound queue and enough memory to
/// resume a reconnecting peer, or to tell it the stream history is gone.
pub struct RpcServer {
    peers: Mutex<HashMap<String, mpsc::Sender<FrameBody>>>,
    memory: Mutex<HashMap<String, PeerMemory>>,
    handler: Handler,
    queue: usize,
}

impl RpcServer {
    pub fn spawn(
        handle: &tokio::runtime::Handle,
        bind: String,
        handler: Handler,
        queue: usize,
    ) -> Arc<RpcServer> {
        let server = Arc::new(RpcServer {
            peers: Mutex::new(HashMap::new()),
            memory: Mutex::new(HashMap::new()),
            handler,
            queue,
        });
        let accept_server = Arc::clone(&server);
        handle.spawn(async move {
            let listener = match TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("rpc bind {} failed: {}", bind, e);
                    return;
                }
            };
            info!("rpc listening on {}", bind);
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("rpc accept from {}", peer_addr);
                        let server = Arc::clone(&accept_server);
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(stream).await {
                                debug!("rpc connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("rpc accept failed: {}", e);
                    }
                }
            }
        });
        server
    }

    /// Delivery to every connected peer; receivers filter by session.
    pub fn broadcast(&self, body: FrameBody) {
        let peers = self.peers.lock().unwrap();
        for (name, tx) in peers.iter() {
            if tx.try_send(body.clone()).is_err() {
                debug!("rpc peer {} backed up; frame dropped", name);
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    async fn serve_connection(self: &Arc<Self>, stream: TcpStream) -> io::Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();

        // First frame must identify the peer.
        let mut buf: Vec<u8> = Vec::with_capacity(8192);
        let mut chunk = [0u8; 8192];
        let (peer, peer_last_seen) = loop {
            let n = read_half.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            buf.extend_from_slice(&chunk[..n]);
            let decoded = decode_frame(&buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))?;
            if let Some((frame, used)) = decoded {
                buf.drain(..used);
                match frame.body {
                    FrameBody::Hello {
                        source,
                        last_seen_seq,
                    } => break (source, last_seen_seq),
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "expected hello",
                        ))
                    }
                }
            }
        };

        let mut link = LinkState::default();
        let resumable = {
            let mut memory = self.memory.lock().unwrap();
            let memory = memory.entry(peer.clone()).or_default();
            link.last_seen = memory.inbound_last_seen;
            link.next_seq = memory.outbound_next_seq;
            // The peer expects frames after its watermark; without a resend
            // buffer for that range, the history is gone.
            peer_last_seen == memory.outbound_next_seq
        };

        let hello = Frame {
            seq: 0,
            ack: link.last_seen,
            body: FrameBody::Hello {
                source: "server".to_owned(),
                last_seen_seq: link.last_seen,
            },
        };
        send_frame(&mut write_half, &hello).await?;
        if !resumable {
            warn!("rpc peer {} cannot resume; declaring session loss", peer);
            let frame = Frame {
                seq: 0,
                ack: link.last_seen,
                body: FrameBody::SessionLoss,
            };
            send_frame(&mut write_half, &frame).await?;
            (self.handler.as_ref())(FrameBody::SessionLoss);
        }

        let (tx, mut rx) = mpsc::channel::<FrameBody>(self.queue);
        self.peers.lock().unwrap().insert(peer.clone(), tx);

        let result: io::Result<()> = async {
            loop {
                tokio::select! {
                    maybe_body = rx.recv() => {
                        let Some(body) = maybe_body else {
                            return Ok(());
                        };
                        let frame = link.next_frame(body);
                        send_frame(&mut write_half, &frame).await?;
                    }
                    read = read_half.read(&mut chunk) => {
                        let n = read?;
                        if n == 0 {
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        loop {
                            let decoded = decode_frame(&buf).map_err(|e| {
                                io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e))
                            })?;
                            let Some((frame, used)) = decoded else {
                                break;
                            };
                            buf.drain(..used);
                            link.on_ack(frame.ack);
                            match frame.body {
                                FrameBody::Hello { .. } | FrameBody::SessionLoss => {}
                                FrameBody::Ping { .. } => {}
                                body => {
                                    if frame.seq > link.last_seen {
                                        link.last_seen = frame.seq;
                                        (self.handler.as_ref())(body);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        .await;

        // Remember watermarks for the next connection from this peer.
        {
            let mut memory = self.memory.lock().unwrap();
            let memory = memory.entry(peer.clone()).or_default();
            memory.inbound_last_seen = link.last_seen;
            memory.outbound_next_seq = link.next_seq;
        }
        self.peers.lock().unwrap().remove(&peer);
        result
    }
}

/// Engine-side outbound sink: broadcast to every connected gateway.
pub struct ServerBroadcastSink {
    pub server: Arc<RpcServer>,
}

impl EventSink<OutboundEvent> for ServerBroadcastSink {
    fn publish(&self, event: OutboundEvent) -> Result<(), BusError> {
        self.server.broadcast(FrameBody::Outbound(event));
        Ok(())
    }
}

impl EventSink<InterEngineEvent> for ServerBroadcastSink {
    fn publish(&self, event: InterEngineEvent) -> Result<(), BusError> {
        self.server.broadcast(FrameBody::InterEngine(event));
        Ok(())
    }
}
