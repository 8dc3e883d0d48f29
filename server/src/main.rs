// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! AmbonMUD server binary. One executable, three roles: a standalone world,
//! a simulation engine behind an RPC endpoint, or a gateway terminating
//! client connections. Each role builds its own isolated composition; there
//! is no process-wide mutable state.

mod options;

use crate::options::{Mode, Options};
use core_protocol::bus::{local_channel, BusError, EventSink, LocalSender};
use core_protocol::event::{InboundEvent, InterEngineEvent, OutboundEvent};
use core_protocol::id::{EngineId, GatewayId, LeaseId, ZoneId};
use core_protocol::rpc::FrameBody;
use engine_server::bus::pubsub::{self, PubSubCounters};
use engine_server::bus::rpc::{self, RpcServer, RpcSink, ServerBroadcastSink};
use engine_server::context::{Context, NullSink};
use engine_server::engine::Engine;
use engine_server::location::LocationIndex;
use engine_server::login::LoginWorker;
use engine_server::persistence::{MemoryRecordRepo, SaveCoalescer, SaveWorker};
use engine_server::tick::{self, Clock};
use engine_server::zone::ZoneRepo;
use gateway_server::gateway::{Gateway, GatewayConfig, InboundRouter};
use gateway_server::session::SessionAllocator;
use gateway_server::web_socket;
use log::{error, info, warn};
use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use world::source::{demo_world, validate, JsonWorldSource, WorldContent, WorldSource};

fn main() {
    let options = Options::from_args();

    let mut logger = env_logger::builder();
    logger.format_timestamp(None);
    logger.filter_level(log::LevelFilter::Warn);
    logger.filter_module("ambonmud_server", options.debug_engine);
    logger.filter_module("engine_server", options.debug_engine);
    logger.filter_module("engine_server::bus", options.debug_bus);
    logger.filter_module("gateway_server", options.debug_sockets);
    logger.init();

    let result = match options.mode {
        Mode::Standalone => run_standalone(options),
        Mode::Engine => run_engine(options),
        Mode::Gateway => run_gateway(options),
    };
    if let Err(message) = result {
        error!("fatal: {}", message);
        process::exit(1);
    }
}

/// Loads and validates content, restricted to this engine's zones if any
/// were named.
fn load_content(options: &Options) -> Result<Arc<WorldContent>, String> {
    let content = match &options.world_root {
        Some(root) => JsonWorldSource { root: root.clone() }
            .load()
            .map_err(|e| format!("world content: {:?}", e))?,
        None => demo_world(),
    };
    let content = if options.zone.is_empty() {
        content
    } else {
        let zones: Vec<ZoneId> = options.zone.iter().map(|z| ZoneId::new(z)).collect();
        content.restricted_to(&zones)
    };
    validate(&content).map_err(|e| format!("world content: {:?}", e))?;
    Ok(Arc::new(content))
}

/// Engine-side repos common to standalone and engine modes.
fn build_engine_context(
    options: &Options,
    engine_id: EngineId,
    content: Arc<WorldContent>,
    inbound_tx: LocalSender<InboundEvent>,
    outbound: Box<dyn EventSink<OutboundEvent>>,
    inter: Box<dyn EventSink<InterEngineEvent>>,
) -> Result<Context, String> {
    let starting_room = content
        .starting_room
        .clone()
        .or_else(|| content.rooms.keys().next().cloned())
        .ok_or("no rooms loaded")?;

    let repo = Arc::new(MemoryRecordRepo::new());
    let login = LoginWorker::spawn(repo.clone(), inbound_tx, starting_room);
    let saves = SaveCoalescer::new(Box::new(SaveWorker::spawn(repo)), options.save_interval);

    let config = options.engine_config();
    let mut zones = ZoneRepo::new(
        None,
        config.scale_high_water,
        config.scale_low_water,
        config.scale_sustain_ms,
        config.scale_cooldown_ms,
    );
    for zone in content.zones() {
        zones.assign(zone, engine_id, u32::MAX);
    }
    for declared in &options.owner {
        let zone = ZoneId::new(&declared.zone);
        if declared.engine_id != engine_id {
            zones.declare_remote(zone, declared.engine_id);
        }
    }

    Ok(Context::new(
        engine_id,
        config,
        content,
        zones,
        LocationIndex::new(None),
        Box::new(login),
        saves,
        outbound,
        inter,
    ))
}

fn gateway_config(options: &Options) -> Result<GatewayConfig, String> {
    Ok(GatewayConfig {
        gateway_id: GatewayId::new(options.gateway_id).ok_or("gateway id must be nonzero")?,
        session_queue: options.session_queue,
        overflow_grace: Duration::from_millis(options.overflow_grace),
        ..Default::default()
    })
}

/// Everything in one process: engine thread plus in-process gateway.
fn run_standalone(options: Options) -> Result<(), String> {
    let engine_id = EngineId::new(options.engine_id).ok_or("engine id must be nonzero")?;
    let content = load_content(&options)?;

    let (inbound_tx, inbound_rx) = local_channel::<InboundEvent>(options.inbound_queue);
    let (outbound_tx, outbound_rx) = local_channel::<OutboundEvent>(options.outbound_queue);

    let ctx = build_engine_context(
        &options,
        engine_id,
        content,
        inbound_tx.clone(),
        Box::new(outbound_tx),
        Box::new(NullSink),
    )?;
    let mut engine = Engine::new(ctx, inbound_rx, None);
    engine.populate();

    let shutdown = Arc::new(AtomicBool::new(false));
    let tick_thread = tick::spawn(engine, Clock::System, Arc::clone(&shutdown));

    let lease = LeaseId::new(options.lease).ok_or("lease out of range")?;
    let allocator = Arc::new(SessionAllocator::new(lease, 5_000));
    let router = Arc::new(InboundRouter::single(engine_id, Arc::new(inbound_tx)));
    let gateway = Gateway::new(gateway_config(&options)?, allocator, router);

    // Outbound events cross from the tick thread to the session writers here.
    gateway.spawn_outbound_pump(outbound_rx);

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    runtime.block_on(async {
        let telnet = tokio::spawn(
            Arc::clone(&gateway).run_telnet_listener(options.telnet_bind.clone()),
        );
        let ws = tokio::spawn(web_socket::run_listener(
            Arc::clone(&gateway),
            options.ws_bind.clone(),
        ));
        info!("standalone server up");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
            _ = gateway.shutdown_signal() => warn!("gateway began a fatal drain"),
        }
        // Let session writers flush their close frames.
        tokio::time::sleep(Duration::from_millis(250)).await;
        telnet.abort();
        ws.abort();
    });

    // The tick thread's exit path force-flushes pending player records.
    shutdown.store(true, Ordering::Release);
    let _ = tick_thread.join();
    if gateway.had_fatal() {
        return Err("gateway lease invalidated; sessions drained and records flushed".to_owned());
    }
    Ok(())
}

/// A simulation engine serving gateways (and peered engines) over RPC.
fn run_engine(options: Options) -> Result<(), String> {
    let engine_id = EngineId::new(options.engine_id).ok_or("engine id must be nonzero")?;
    let content = load_content(&options)?;

    let (inbound_tx, inbound_rx) = local_channel::<InboundEvent>(options.inbound_queue);
    let (inter_tx, inter_rx) = local_channel::<InterEngineEvent>(options.inbound_queue);

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;

    // Inter-engine traffic crosses the wire sealed with the shared secret;
    // anything unverifiable is dropped and counted, never trusted.
    let secret: Arc<[u8]> = options.shared_secret.as_bytes().into();
    let max_skew_ms = options.engine_config().envelope_max_skew_ms;
    let bus_counters = Arc::new(PubSubCounters::default());

    // Frames from gateways (and engine peers connecting to us) land here
    // and are queued toward the tick thread.
    let handler_inbound = inbound_tx.clone();
    let handler_inter = inter_tx.clone();
    let handler_secret = Arc::clone(&secret);
    let handler_counters = Arc::clone(&bus_counters);
    let handler: rpc::Handler = Arc::new(move |body| match body {
        FrameBody::Inbound(event) => {
            if handler_inbound.publish(event).is_err() {
                warn!("inbound bus full; frame dropped");
            }
        }
        FrameBody::SealedInterEngine(envelope) => {
            let Some(event) = pubsub::open_event::<InterEngineEvent>(
                &envelope,
                &handler_secret,
                max_skew_ms,
                &handler_counters,
            ) else {
                return;
            };
            if handler_inter.publish(event).is_err() {
                warn!("inter-engine bus full; frame dropped");
            }
        }
        FrameBody::InterEngine(_) => {
            warn!("unauthenticated inter-engine frame dropped");
        }
        FrameBody::SessionLoss => {
            warn!("a gateway lost stream continuity");
        }
        _ => {}
    });
    let rpc_server = RpcServer::spawn(
        runtime.handle(),
        options.rpc_bind.clone(),
        handler,
        options.outbound_queue,
    );

    // Outbound to every connected gateway; inter-engine to peered engines.
    let outbound = Box::new(ServerBroadcastSink {
        server: Arc::clone(&rpc_server),
    });
    let inter: Box<dyn EventSink<InterEngineEvent>> = if options.peer.is_empty() {
        Box::new(NullSink)
    } else {
        let mut peers = HashMap::new();
        for peer in &options.peer {
            let peer_handler_inter = inter_tx.clone();
            let peer_secret = Arc::clone(&secret);
            let peer_counters = Arc::clone(&bus_counters);
            let peer_handler: rpc::Handler = Arc::new(move |body| match body {
                FrameBody::SealedInterEngine(envelope) => {
                    let Some(event) = pubsub::open_event::<InterEngineEvent>(
                        &envelope,
                        &peer_secret,
                        max_skew_ms,
                        &peer_counters,
                    ) else {
                        return;
                    };
                    let _ = peer_handler_inter.publish(event);
                }
                FrameBody::InterEngine(_) => {
                    warn!("unauthenticated inter-engine frame dropped");
                }
                FrameBody::SessionLoss => warn!("peer engine lost stream continuity"),
                _ => {}
            });
            let sink = rpc::spawn_client(
                runtime.handle(),
                peer.addr.clone(),
                engine_id.to_string(),
                peer_handler,
                options.outbound_queue,
            );
            peers.insert(peer.engine_id, sink);
        }
        Box::new(PeerMesh {
            peers,
            source: engine_id.to_string(),
            secret: Arc::clone(&secret),
        })
    };

    let ctx = build_engine_context(
        &options,
        engine_id,
        content,
        inbound_tx,
        outbound,
        inter,
    )?;
    let mut engine = Engine::new(ctx, inbound_rx, Some(inter_rx));
    engine.populate();

    let shutdown = Arc::new(AtomicBool::new(false));
    let tick_thread = tick::spawn(engine, Clock::System, Arc::clone(&shutdown));

    info!("{} up on {}", engine_id, options.rpc_bind);
    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    shutdown.store(true, Ordering::Release);
    let _ = tick_thread.join();
    Ok(())
}

/// A gateway terminating client sockets, speaking RPC to engines.
fn run_gateway(options: Options) -> Result<(), String> {
    if options.engine.is_empty() {
        return Err("gateway mode needs at least one --engine id=addr".to_owned());
    }
    let default_engine =
        EngineId::new(options.default_engine).ok_or("default engine must be nonzero")?;
    let gateway_id = GatewayId::new(options.gateway_id).ok_or("gateway id must be nonzero")?;

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;

    // Engine frames flow through this channel into the delivery pump.
    let (outbound_tx, outbound_rx) = std::sync::mpsc::channel::<OutboundEvent>();

    let mut sinks: HashMap<EngineId, Arc<dyn EventSink<InboundEvent>>> = HashMap::new();
    for peer in &options.engine {
        let tx = outbound_tx.clone();
        let handler: rpc::Handler = Arc::new(move |body| match body {
            FrameBody::Outbound(event) => {
                let _ = tx.send(event);
            }
            FrameBody::InterEngine(InterEngineEvent::RoutedOutbound { event, .. }) => {
                let _ = tx.send(event);
            }
            FrameBody::SessionLoss => {
                warn!("engine stream lost; sessions may be stale");
            }
            _ => {}
        });
        let sink: RpcSink = rpc::spawn_client(
            runtime.handle(),
            peer.addr.clone(),
            gateway_id.to_string(),
            handler,
            options.outbound_queue,
        );
        sinks.insert(peer.engine_id, Arc::new(sink));
    }
    if !sinks.contains_key(&default_engine) {
        return Err("default engine is not among --engine peers".to_owned());
    }

    let lease = LeaseId::new(options.lease).ok_or("lease out of range")?;
    let allocator = Arc::new(SessionAllocator::new(lease, 5_000));
    let router = Arc::new(InboundRouter::new(default_engine, sinks));
    let gateway = Gateway::new(gateway_config(&options)?, allocator, router);

    let pump_gateway = Arc::clone(&gateway);
    std::thread::Builder::new()
        .name("outbound-pump".to_owned())
        .spawn(move || {
            while let Ok(event) = outbound_rx.recv() {
                pump_gateway.deliver(event);
            }
        })
        .map_err(|e| e.to_string())?;

    runtime.block_on(async {
        let telnet = tokio::spawn(
            Arc::clone(&gateway).run_telnet_listener(options.telnet_bind.clone()),
        );
        let ws = tokio::spawn(web_socket::run_listener(
            Arc::clone(&gateway),
            options.ws_bind.clone(),
        ));
        info!("{} up", gateway_id);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
            _ = gateway.shutdown_signal() => warn!("gateway began a fatal drain"),
        }
        // Give the RPC links a beat to carry the disconnects to the
        // engines, which persist the affected records.
        tokio::time::sleep(Duration::from_millis(250)).await;
        telnet.abort();
        ws.abort();
    });
    if gateway.had_fatal() {
        return Err("gateway lease invalidated; sessions drained".to_owned());
    }
    Ok(())
}

/// Routes inter-engine events to the peer link each event names, falling
/// back to every peer for events without a single target. Every event is
/// sealed with the shared secret before it leaves the process.
struct PeerMesh {
    peers: HashMap<EngineId, RpcSink>,
    source: String,
    secret: Arc<[u8]>,
}

impl PeerMesh {
    fn target_of(event: &InterEngineEvent) -> Option<EngineId> {
        match event {
            InterEngineEvent::RoutedInbound { target, .. } => Some(*target),
            InterEngineEvent::RoutedOutbound { .. } => None,
            InterEngineEvent::HandoffPrepare(ticket) => Some(ticket.to),
            InterEngineEvent::HandoffAck { from, .. } => Some(*from),
            InterEngineEvent::HandoffReject { from, .. } => Some(*from),
            InterEngineEvent::HandoffCommit { to, .. } => Some(*to),
            InterEngineEvent::CrossEngineTell { target, .. } => Some(*target),
            InterEngineEvent::ScaleDecision { .. } => None,
        }
    }
}

impl EventSink<InterEngineEvent> for PeerMesh {
    fn publish(&self, event: InterEngineEvent) -> Result<(), BusError> {
        let Some(envelope) = pubsub::seal_event(&event, &self.source, &self.secret) else {
            return Err(BusError::Closed);
        };
        match Self::target_of(&event) {
            Some(target) => match self.peers.get(&target) {
                Some(sink) => sink.send_body(FrameBody::SealedInterEngine(envelope)),
                None => {
                    warn!("no peer link to {}", target);
                    Err(BusError::Closed)
                }
            },
            None => {
                for sink in self.peers.values() {
                    let _ = sink.send_body(FrameBody::SealedInterEngine(envelope.clone()));
                }
                Ok(())
            }
        }
    }
}
