// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The tick loop proper: run phases, account for overruns, sleep the
//! remainder. Overload is reported, never "recovered" by skipping phases;
//! the engine simply runs at a longer effective period.

use crate::engine::Engine;
use core_protocol::UnixTime;
use log::{info, warn};
use server_util::tick_health::TickHealth;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Time source for the loop. Tests drive a manual clock so scenarios are
/// exact; production reads the wall clock.
#[derive(Clone)]
pub enum Clock {
    System,
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn manual(start: UnixTime) -> (Self, Arc<AtomicU64>) {
        let cell = Arc::new(AtomicU64::new(start));
        (Self::Manual(Arc::clone(&cell)), cell)
    }

    pub fn now(&self) -> UnixTime {
        match self {
            Self::System => core_protocol::get_unix_time_now(),
            Self::Manual(cell) => cell.load(Ordering::Acquire),
        }
    }
}

/// Runs the engine until `shutdown` is raised, then force-flushes pending
/// saves so player records survive a graceful stop.
pub fn run(mut engine: Engine, clock: Clock, shutdown: Arc<AtomicBool>) {
    let period = Duration::from_millis(engine.ctx.config.tick_period_ms);
    let mut health = TickHealth::new(period, engine.ctx.config.degraded_threshold);
    info!("{} tick loop started", engine.ctx.engine_id);

    while !shutdown.load(Ordering::Acquire) {
        let started = Instant::now();
        let now = clock.now();
        engine.tick(now);

        let elapsed = started.elapsed();
        if health.record_tick(elapsed) {
            warn!(
                "tick degraded: {} consecutive overruns (load {:.2})",
                engine.ctx.config.degraded_threshold,
                health.load_factor()
            );
        }
        thread::sleep(period.saturating_sub(elapsed));
    }

    let now = clock.now();
    engine.ctx.saves.flush(now, true);
    info!(
        "{} tick loop stopped ({} overruns)",
        engine.ctx.engine_id, health.total_overruns
    );
}

pub fn spawn(engine: Engine, clock: Clock, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tick-engine".to_owned())
        .spawn(move || run(engine, clock, shutdown))
        .expect("failed to spawn tick thread")
}
