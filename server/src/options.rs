// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{EngineId, LeaseId};
use log::LevelFilter;
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Standalone,
    Engine,
    Gateway,
}

impl FromStr for Mode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" => Ok(Self::Standalone),
            "engine" => Ok(Self::Engine),
            "gateway" => Ok(Self::Gateway),
            _ => Err("expected standalone, engine, or gateway"),
        }
    }
}

/// One `id=addr` pair, e.g. `2=127.0.0.1:7601`.
#[derive(Clone, Debug)]
pub struct EnginePeer {
    pub engine_id: EngineId,
    pub addr: String,
}

impl FromStr for EnginePeer {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s.split_once('=').ok_or("expected id=host:port")?;
        let id: u16 = id.parse().map_err(|_| "engine id must be a number")?;
        Ok(Self {
            engine_id: EngineId::new(id).ok_or("engine id must be nonzero")?,
            addr: addr.to_owned(),
        })
    }
}

/// Static zone-ownership declaration, e.g. `forest=2`.
#[derive(Clone, Debug)]
pub struct ZoneOwner {
    pub zone: String,
    pub engine_id: EngineId,
}

impl FromStr for ZoneOwner {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (zone, id) = s.split_once('=').ok_or("expected zone=engine-id")?;
        let id: u16 = id.parse().map_err(|_| "engine id must be a number")?;
        Ok(Self {
            zone: zone.to_owned(),
            engine_id: EngineId::new(id).ok_or("engine id must be nonzero")?,
        })
    }
}

/// Server options, to be specified as arguments.
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Process role: standalone, engine, or gateway.
    #[structopt(long, default_value = "standalone")]
    pub mode: Mode,
    /// This process's engine id (engine/standalone modes).
    #[structopt(long, default_value = "1")]
    pub engine_id: u16,
    /// This process's gateway id (gateway mode).
    #[structopt(long, default_value = "1")]
    pub gateway_id: u16,
    /// Session-id lease granted by the coordinator (0 in standalone).
    #[structopt(long, default_value = "0")]
    pub lease: u16,
    /// Telnet listen address.
    #[structopt(long, default_value = "0.0.0.0:4000")]
    pub telnet_bind: String,
    /// WebSocket listen address.
    #[structopt(long, default_value = "0.0.0.0:4001")]
    pub ws_bind: String,
    /// Engine RPC listen address (engine mode).
    #[structopt(long, default_value = "0.0.0.0:7600")]
    pub rpc_bind: String,
    /// Engines to connect to, as id=host:port (gateway mode; repeatable).
    #[structopt(long)]
    pub engine: Vec<EnginePeer>,
    /// Peer engines for the inter-engine bus, as id=host:port (repeatable).
    #[structopt(long)]
    pub peer: Vec<EnginePeer>,
    /// Default engine for new sessions (gateway mode).
    #[structopt(long, default_value = "1")]
    pub default_engine: u16,
    /// Shared secret sealing inter-engine bus envelopes; every engine in a
    /// deployment must agree on it.
    #[structopt(long, default_value = "dev-secret")]
    pub shared_secret: String,
    /// World content root (expects world.json); demo world when absent.
    #[structopt(long)]
    pub world_root: Option<PathBuf>,
    /// Zones owned by this engine; all loaded zones when empty.
    #[structopt(long)]
    pub zone: Vec<String>,
    /// Static zone ownership map entries, as zone=engine-id (repeatable).
    #[structopt(long)]
    pub owner: Vec<ZoneOwner>,
    /// Simulation tick period in milliseconds.
    #[structopt(long, default_value = "100")]
    pub tick_period: u64,
    /// Inbound drain budget per tick in milliseconds.
    #[structopt(long, default_value = "30")]
    pub inbound_budget: u64,
    /// Handoff ack timeout in milliseconds.
    #[structopt(long, default_value = "2000")]
    pub ack_timeout: u64,
    /// Queue capacity of the inbound bus.
    #[structopt(long, default_value = "4096")]
    pub inbound_queue: usize,
    /// Queue capacity of the outbound bus.
    #[structopt(long, default_value = "8192")]
    pub outbound_queue: usize,
    /// Per-session outbound queue capacity.
    #[structopt(long, default_value = "128")]
    pub session_queue: usize,
    /// Grace period before a backed-up session is disconnected (ms).
    #[structopt(long, default_value = "5000")]
    pub overflow_grace: u64,
    /// Deferred persistence flush interval (ms).
    #[structopt(long, default_value = "10000")]
    pub save_interval: u64,
    /// Instance scale-up watermark (players per instance).
    #[structopt(long, default_value = "80")]
    pub scale_high_water: u32,
    /// Instance scale-down watermark (players per instance).
    #[structopt(long, default_value = "20")]
    pub scale_low_water: u32,
    /// Log engine diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_engine: LevelFilter,
    /// Log socket diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_sockets: LevelFilter,
    /// Log bus diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_bus: LevelFilter,
}

impl Options {
    pub fn engine_config(&self) -> engine_server::config::EngineConfig {
        let mut config = engine_server::config::EngineConfig::default();
        config.tick_period_ms = self.tick_period;
        config.inbound_budget_ms = self.inbound_budget;
        config.handoff_ack_timeout_ms = self.ack_timeout;
        config.scale_high_water = self.scale_high_water;
        config.scale_low_water = self.scale_low_water;
        config
    }
}
