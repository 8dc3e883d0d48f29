// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::ability::AbilityRepo;
use crate::combat::CombatRepo;
use crate::config::EngineConfig;
use crate::dirty::DirtyRepo;
use crate::group::GroupRepo;
use crate::handoff::HandoffRepo;
use crate::item::ItemRepo;
use crate::location::LocationIndex;
use crate::login::{LoginDispatcher, LoginRepo};
use crate::mob::MobRepo;
use crate::outbox::Outbox;
use crate::persistence::SaveCoalescer;
use crate::player::PlayerRepo;
use crate::regen::RegenRepo;
use crate::scheduler::Scheduler;
use crate::status::StatusRepo;
use crate::threat::ThreatRepo;
use crate::zone::ZoneRepo;
use core_protocol::bus::{BusError, EventSink};
use core_protocol::event::InterEngineEvent;
use core_protocol::id::{EngineId, RoomId, SessionId};
use log::warn;
use std::sync::Arc;
use world::source::WorldContent;

/// Writing end of the inter-engine bus with a drop counter.
pub struct InterOutbox {
    sink: Box<dyn EventSink<InterEngineEvent>>,
    pub dropped: u64,
}

impl InterOutbox {
    pub fn new(sink: Box<dyn EventSink<InterEngineEvent>>) -> Self {
        Self { sink, dropped: 0 }
    }

    pub fn send(&mut self, event: InterEngineEvent) {
        match self.sink.publish(event) {
            Ok(()) => {}
            Err(BusError::Full) | Err(BusError::Closed) => {
                self.dropped += 1;
                warn!("inter-engine bus refused event");
            }
        }
    }
}

/// Sink for standalone mode, where no other engine exists.
pub struct NullSink;

impl<T: Send> EventSink<T> for NullSink {
    fn publish(&self, _event: T) -> Result<(), BusError> {
        Ok(())
    }
}

/// Everything the tick thread owns. Subsystem logic lives in the sibling
/// modules as free functions over this struct; field-level borrows keep the
/// pieces independent.
pub struct Context {
    pub engine_id: EngineId,
    pub config: EngineConfig,
    pub content: Arc<WorldContent>,
    pub players: PlayerRepo,
    pub mobs: MobRepo,
    pub items: ItemRepo,
    pub threat: ThreatRepo,
    pub combat: CombatRepo,
    pub status: StatusRepo,
    pub abilities: AbilityRepo,
    pub regen: RegenRepo,
    pub groups: GroupRepo,
    pub scheduler: Scheduler,
    pub dirty: DirtyRepo,
    pub zones: ZoneRepo,
    pub handoff: HandoffRepo,
    pub location: LocationIndex,
    pub lobby: LoginRepo,
    pub login: Box<dyn LoginDispatcher>,
    pub saves: SaveCoalescer,
    pub outbox: Outbox,
    pub inter: InterOutbox,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine_id: EngineId,
        config: EngineConfig,
        content: Arc<WorldContent>,
        zones: ZoneRepo,
        location: LocationIndex,
        login: Box<dyn LoginDispatcher>,
        saves: SaveCoalescer,
        outbound: Box<dyn EventSink<core_protocol::event::OutboundEvent>>,
        inter: Box<dyn EventSink<InterEngineEvent>>,
    ) -> Self {
        let scheduler_late_ms = config.tick_period_ms * 10;
        Self {
            engine_id,
            config,
            content,
            players: PlayerRepo::new(),
            mobs: MobRepo::new(),
            items: ItemRepo::new(),
            threat: ThreatRepo::new(),
            combat: CombatRepo::new(),
            status: StatusRepo::new(),
            abilities: AbilityRepo::new(),
            regen: RegenRepo::new(),
            groups: GroupRepo::new(),
            scheduler: Scheduler::new(scheduler_late_ms),
            dirty: DirtyRepo::new(),
            zones,
            handoff: HandoffRepo::new(),
            location,
            lobby: LoginRepo::new(),
            login,
            saves,
            outbox: Outbox::new(outbound),
            inter: InterOutbox::new(inter),
        }
    }

    /// Sends a line to every player in the room except those listed.
    pub fn broadcast(&mut self, room_id: &RoomId, text: &str, exclude: &[SessionId]) {
        let recipients: Vec<SessionId> = self
            .players
            .players_in_room(room_id)
            .iter()
            .copied()
            .filter(|sid| !exclude.contains(sid))
            .collect();
        for session_id in recipients {
            self.outbox.line(session_id, text.to_owned());
        }
    }

    /// Room lookup in the loaded content; `None` for rooms of zones this
    /// engine does not host (remote stubs).
    pub fn room(&self, room_id: &RoomId) -> Option<&world::room::Room> {
        self.content.rooms.get(room_id)
    }
}
