// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event handling and the ordered simulation phases of one tick. All state
//! mutation funnels through [`Engine::tick`] on the tick thread.

use crate::command;
use crate::combat;
use crate::context::Context;
use crate::handoff;
use crate::login::LoginRequest;
use crate::mob::MobState;
use crate::player::PlayerState;
use crate::progress;
use crate::regen;
use crate::scheduler::ActionKind;
use crate::status::EffectTarget;
use core_protocol::dto::{
    EffectStacksDto, GroupInfoDto, MobHpDto, PlayerVitalsDto,
};
use core_protocol::event::{
    DisconnectReason, InboundEvent, InterEngineEvent, LoginOutcome, OutboundEvent,
};
use core_protocol::id::{RoomId, SessionId};
use core_protocol::name::PlayerName;
use core_protocol::UnixTime;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use world::room::Direction;
use world::templates::EffectKind;

/// Boundary to the external behavior-tree library. The simulation phase
/// offers each scripted mob a chance to act; what "thinking" means is the
/// collaborator's business.
pub trait MobBrain: Send {
    fn think(&mut self, now: UnixTime, mob: &MobState) -> Option<MobAction>;
}

pub enum MobAction {
    Say(String),
    Wander(Direction),
}

pub struct Engine {
    pub ctx: Context,
    inbound_rx: Receiver<InboundEvent>,
    inter_rx: Option<Receiver<InterEngineEvent>>,
    brains: HashMap<String, Box<dyn MobBrain>>,
    ticks: u64,
}

impl Engine {
    pub fn new(
        ctx: Context,
        inbound_rx: Receiver<InboundEvent>,
        inter_rx: Option<Receiver<InterEngineEvent>>,
    ) -> Self {
        Self {
            ctx,
            inbound_rx,
            inter_rx,
            brains: HashMap::new(),
            ticks: 0,
        }
    }

    pub fn register_brain(&mut self, key: &str, brain: Box<dyn MobBrain>) {
        self.brains.insert(key.to_owned(), brain);
    }

    /// Initial population from the content's spawn table.
    pub fn populate(&mut self) {
        let spawns = self.ctx.content.spawns.clone();
        for spawn in spawns {
            let Some(template) = self.ctx.content.mob_templates.get(&spawn.template).cloned()
            else {
                continue;
            };
            for _ in 0..spawn.count {
                self.ctx.mobs.spawn(&template, spawn.room.clone());
            }
        }
        info!(
            "{} populated with {} mobs",
            self.ctx.engine_id,
            self.ctx.mobs.len()
        );
    }

    /// One full tick: bounded inbound drain, simulation phases in their
    /// fixed order, dirty flush, prompt flush. Never skips a phase.
    pub fn tick(&mut self, now: UnixTime) {
        self.drain_inbound(now);

        // Simulation, in contract order.
        self.run_scheduler(now);
        regen::tick(&mut self.ctx, now);
        self.status_phase(now);
        self.behavior_phase(now);
        combat::tick(&mut self.ctx, now);
        self.ctx.abilities.prune(now);
        handoff::tick(&mut self.ctx, now);
        self.ctx.groups.purge_expired(now);
        self.scale_phase(now);

        self.flush_dirty();

        self.ctx.saves.flush(now, false);
        self.ctx.outbox.flush_prompts();
    }

    /// Drains both buses under the configured wall-clock budget; whatever
    /// remains is simply next tick's work.
    fn drain_inbound(&mut self, now: UnixTime) {
        let deadline = Instant::now() + Duration::from_millis(self.ctx.config.inbound_budget_ms);
        loop {
            let mut idle = true;
            if let Ok(event) = self.inbound_rx.try_recv() {
                self.handle_inbound(now, event);
                idle = false;
            }
            if let Some(inter_rx) = &self.inter_rx {
                if let Ok(event) = inter_rx.try_recv() {
                    self.handle_inter(now, event);
                    idle = false;
                }
            }
            if idle || Instant::now() >= deadline {
                break;
            }
        }
    }

    pub fn handle_inbound(&mut self, now: UnixTime, event: InboundEvent) {
        match event {
            InboundEvent::Connected {
                session_id,
                gateway,
                ansi,
            } => {
                self.ctx.lobby.connect(session_id, ansi, gateway);
                self.ctx
                    .outbox
                    .send(OutboundEvent::ShowLoginScreen { session_id });
                self.ctx
                    .outbox
                    .line(session_id, "By what name are you known?");
                self.ctx.outbox.prompt(session_id);
            }
            InboundEvent::Disconnected { session_id, reason } => {
                self.disconnect(now, session_id, reason);
            }
            InboundEvent::LineReceived { session_id, line } => {
                if self.ctx.lobby.contains(session_id) {
                    self.login_line(session_id, &line);
                } else if self.ctx.players.contains(session_id) {
                    command::dispatch(&mut self.ctx, now, session_id, &line);
                } else {
                    debug!("line from unknown session {}", session_id);
                }
            }
            InboundEvent::GmcpReceived {
                session_id,
                package,
                ..
            } => {
                // Structured-data handling belongs to the telemetry
                // collaborator; the core only logs it.
                debug!("gmcp {} from {}", package, session_id);
            }
            InboundEvent::LoginCompleted {
                session_id,
                epoch,
                outcome,
            } => {
                self.login_completed(now, session_id, epoch, outcome);
            }
        }
    }

    pub fn handle_inter(&mut self, now: UnixTime, event: InterEngineEvent) {
        match event {
            InterEngineEvent::RoutedInbound { target, event } => {
                if target == self.ctx.engine_id {
                    self.handle_inbound(now, event);
                }
            }
            InterEngineEvent::RoutedOutbound { .. } => {
                // Gateway-bound traffic; engines are not a hop for it.
            }
            InterEngineEvent::HandoffPrepare(ticket) => {
                handoff::on_prepare(&mut self.ctx, now, ticket);
            }
            InterEngineEvent::HandoffAck { session_id, from, .. } => {
                if from == self.ctx.engine_id {
                    handoff::on_ack(&mut self.ctx, now, session_id);
                }
            }
            InterEngineEvent::HandoffReject {
                session_id,
                from,
                reason,
                ..
            } => {
                if from == self.ctx.engine_id {
                    handoff::on_reject(&mut self.ctx, session_id, &reason);
                }
            }
            InterEngineEvent::HandoffCommit { session_id, to } => {
                if to == self.ctx.engine_id {
                    handoff::on_commit(&mut self.ctx, now, session_id);
                }
            }
            InterEngineEvent::CrossEngineTell {
                target,
                from_name,
                to_name,
                text,
            } => {
                if target != self.ctx.engine_id {
                    return;
                }
                if let Some(session_id) = self.ctx.players.find_by_name(&to_name) {
                    self.ctx.outbox.line(
                        session_id,
                        format!("{} tells you, \"{}\"", from_name, text),
                    );
                    self.ctx.outbox.prompt(session_id);
                }
            }
            InterEngineEvent::ScaleDecision { zone, action } => {
                info!("scale signal for {}: {:?}", zone, action);
            }
        }
    }

    fn login_line(&mut self, session_id: SessionId, line: &str) {
        let Some(lobby) = self.ctx.lobby.get_mut(session_id) else {
            return;
        };
        if lobby.pending {
            self.ctx
                .outbox
                .line(session_id, "One moment, the archives are being consulted.");
            self.ctx.outbox.prompt(session_id);
            return;
        }
        let epoch = lobby.epoch;
        let Some(name) = PlayerName::new(line) else {
            self.ctx.outbox.error(
                session_id,
                "Names are 3-16 letters. By what name are you known?",
            );
            self.ctx.outbox.prompt(session_id);
            return;
        };
        if self.ctx.players.is_name_online(&name) {
            self.ctx
                .outbox
                .error(session_id, "That name is already connected.");
            self.ctx.outbox.prompt(session_id);
            return;
        }
        if let Some(lobby) = self.ctx.lobby.get_mut(session_id) {
            lobby.pending = true;
        }
        // The lookup runs on a worker; the tick thread moves on.
        self.ctx.login.submit(LoginRequest {
            session_id,
            epoch,
            name,
        });
    }

    fn login_completed(
        &mut self,
        now: UnixTime,
        session_id: SessionId,
        epoch: u32,
        outcome: LoginOutcome,
    ) {
        // Stale completions (session gone, or a newer connection reused the
        // slot) are dropped on the floor.
        let Some(lobby) = self.ctx.lobby.get(session_id) else {
            return;
        };
        if lobby.epoch != epoch {
            return;
        }
        let ansi = lobby.ansi;

        let record = match outcome {
            LoginOutcome::Existing(record) | LoginOutcome::Created(record) => record,
            LoginOutcome::NameInUse => {
                if let Some(lobby) = self.ctx.lobby.get_mut(session_id) {
                    lobby.pending = false;
                }
                self.ctx
                    .outbox
                    .error(session_id, "That name is already connected.");
                self.ctx.outbox.prompt(session_id);
                return;
            }
            LoginOutcome::Unavailable => {
                if let Some(lobby) = self.ctx.lobby.get_mut(session_id) {
                    lobby.pending = false;
                }
                self.ctx.outbox.error(
                    session_id,
                    "The archives are unreachable. Try again shortly.",
                );
                self.ctx.outbox.prompt(session_id);
                return;
            }
        };

        if self.ctx.players.is_name_online(&record.name) {
            if let Some(lobby) = self.ctx.lobby.get_mut(session_id) {
                lobby.pending = false;
            }
            self.ctx
                .outbox
                .error(session_id, "That name is already connected.");
            self.ctx.outbox.prompt(session_id);
            return;
        }

        // Place the player in their saved room if this engine hosts it;
        // otherwise start locally and transfer to the owner.
        let saved_room = record.room_id.clone();
        let hosted_here = self.ctx.room(&saved_room).is_some();
        let fallback = self.ctx.content.starting_room.clone();
        let spawn_room = if hosted_here {
            saved_room.clone()
        } else {
            match fallback {
                Some(room) => room,
                None => {
                    warn!("no hostable room for {}", record.name);
                    self.ctx
                        .outbox
                        .close(session_id, DisconnectReason::ServerShutdown);
                    return;
                }
            }
        };

        let mut state = PlayerState::from_record(session_id, &record, ansi);
        state.room_id = spawn_room.clone();
        let name = state.name;
        if let Err(reason) = self.ctx.players.attach(state) {
            warn!("could not attach {}: {}", name, reason);
            if let Some(lobby) = self.ctx.lobby.get_mut(session_id) {
                lobby.pending = false;
            }
            self.ctx.outbox.error(session_id, "Login failed.");
            self.ctx.outbox.prompt(session_id);
            return;
        }
        self.ctx.lobby.remove(session_id);
        // Room index entry exists from attach; fix the index if the spawn
        // room differs from the record.
        self.ctx.location.set(name.as_str(), self.ctx.engine_id);

        self.ctx
            .outbox
            .line(session_id, format!("Welcome, {}.", name));
        self.ctx.broadcast(
            &spawn_room,
            &format!("{} has entered the world.", name),
            &[session_id],
        );
        command::look(&mut self.ctx, session_id);
        self.ctx.dirty.mark_vitals(session_id);
        self.ctx.outbox.prompt(session_id);
        progress::queue_save(&mut self.ctx, now, session_id);
        info!("{} logged in as {}", session_id, name);

        if !hosted_here {
            let zone = saved_room.zone();
            if let Some(owner) = self.ctx.zones.owner(&zone) {
                if owner != self.ctx.engine_id {
                    let _ = handoff::begin(&mut self.ctx, now, session_id, saved_room, owner);
                }
            }
        }
    }

    fn disconnect(&mut self, now: UnixTime, session_id: SessionId, reason: DisconnectReason) {
        if self.ctx.lobby.remove(session_id).is_some() {
            debug!("lobby session {} disconnected: {:?}", session_id, reason);
            return;
        }
        combat::purge_session(&mut self.ctx, session_id);

        let name = self.ctx.players.name_of(session_id);
        if let Some(outcome) = self.ctx.groups.on_disconnect(session_id) {
            self.ctx.dirty.mark_group(outcome.group_id);
            for member in &outcome.remaining {
                self.ctx
                    .outbox
                    .line(*member, format!("{} has left your group.", name));
                if outcome.disbanded {
                    self.ctx.outbox.line(*member, "Your group has disbanded.");
                } else if outcome.new_leader == Some(*member) {
                    self.ctx.outbox.line(*member, "You are now the group leader.");
                }
                self.ctx.outbox.prompt(*member);
            }
        }

        let Some(player) = self.ctx.players.detach(session_id) else {
            return;
        };
        info!("{} ({}) disconnected: {:?}", player.name, session_id, reason);
        self.ctx.broadcast(
            &player.room_id,
            &format!("{} has left the world.", player.name),
            &[],
        );
        // Persist (room, last seen) through the deferred writer.
        self.ctx.saves.queue(player.to_record(now));
        self.ctx.location.remove(player.name.as_str());

        for item_id in self.ctx.items.carried_by(session_id).to_vec() {
            self.ctx.items.remove(item_id);
        }
        self.ctx.handoff.forget_session(session_id);
        self.ctx.regen.forget(session_id);
        self.ctx.abilities.forget(session_id);
        self.ctx.status.clear_player(session_id);
        self.ctx.dirty.forget_session(session_id);
        self.ctx.outbox.forget(session_id);
    }

    /// Reports per-zone population for instance scaling, about once a
    /// second. Decisions go to the coordinator over the inter-engine bus.
    fn scale_phase(&mut self, now: UnixTime) {
        self.ticks += 1;
        if self.ticks % 10 != 0 {
            return;
        }
        let mut counts: HashMap<core_protocol::id::ZoneId, u32> = HashMap::new();
        for player in self.ctx.players.iter() {
            *counts.entry(player.room_id.zone()).or_default() += 1;
        }
        for zone in self.ctx.content.zones() {
            let count = counts.get(&zone).copied().unwrap_or(0);
            let Some(instance) = self.ctx.zones.instances(&zone).first().map(|i| i.id) else {
                continue;
            };
            if let Some(action) = self.ctx.zones.record_count(now, &zone, instance, count) {
                info!("zone {} wants to scale {:?}", zone, action);
                self.ctx.inter.send(InterEngineEvent::ScaleDecision {
                    zone: zone.clone(),
                    action,
                });
            }
        }
    }

    fn run_scheduler(&mut self, now: UnixTime) {
        let cap = self.ctx.config.scheduler_max_per_tick;
        if self.ctx.scheduler.is_overloaded(cap * 64) {
            warn!(
                "scheduler backlog: {} queued, {} late drains",
                self.ctx.scheduler.len(),
                self.ctx.scheduler.late_drains
            );
        }
        for action in self.ctx.scheduler.drain_due(now, cap) {
            match action.kind {
                ActionKind::RespawnMob { template, room } => {
                    let Some(template) = self.ctx.content.mob_templates.get(&template).cloned()
                    else {
                        continue;
                    };
                    self.ctx.mobs.spawn(&template, room.clone());
                    self.ctx
                        .broadcast(&room, &format!("{} arrives.", template.name), &[]);
                }
                ActionKind::ExpireInvite { .. } => {
                    // The repo sweeps everything stale in one pass.
                    self.ctx.groups.purge_expired(now);
                }
                ActionKind::Announce { room, text } => {
                    self.ctx.broadcast(&room, &text, &[]);
                }
            }
        }
    }

    fn status_phase(&mut self, now: UnixTime) {
        for expired in self.ctx.status.expire_due(now) {
            if let EffectTarget::Player(session_id) = expired.target {
                self.ctx
                    .outbox
                    .line(session_id, format!("The {} effect fades.", expired.name));
                self.ctx.dirty.mark_status(session_id);
                self.ctx.outbox.prompt(session_id);
            }
        }

        for periodic in self.ctx.status.due_periodics(now) {
            let effect_name = self
                .ctx
                .content
                .effects
                .get(&periodic.def_id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "magic".to_owned());
            match (&periodic.target, periodic.kind) {
                (EffectTarget::Player(session_id), EffectKind::Dot) => {
                    combat::apply_player_damage(
                        &mut self.ctx,
                        now,
                        *session_id,
                        periodic.amount,
                        &effect_name,
                    );
                }
                (EffectTarget::Player(session_id), EffectKind::Hot) => {
                    let healed = combat::heal_player(
                        &mut self.ctx,
                        now,
                        *session_id,
                        periodic.amount,
                        periodic.caster,
                    );
                    if healed > 0 {
                        self.ctx.outbox.line(
                            *session_id,
                            format!("{} knits your wounds (+{}).", effect_name, healed),
                        );
                    }
                }
                (EffectTarget::Mob(mob_id), EffectKind::Dot) => {
                    if let Some(caster) = periodic.caster {
                        combat::apply_mob_damage(
                            &mut self.ctx,
                            now,
                            mob_id,
                            caster,
                            periodic.amount,
                            1.0,
                        );
                    } else if let Some(mob) = self.ctx.mobs.get_mut(mob_id) {
                        // Ownerless damage cannot claim a kill.
                        mob.hp = (mob.hp - periodic.amount).max(1);
                        let mob_id = mob.id.clone();
                        self.ctx.dirty.mark_mob_hp(&mob_id);
                    }
                }
                (EffectTarget::Mob(mob_id), EffectKind::Hot) => {
                    if let Some(mob) = self.ctx.mobs.get_mut(mob_id) {
                        mob.hp = (mob.hp + periodic.amount).min(mob.max_hp);
                        let mob_id = mob.id.clone();
                        self.ctx.dirty.mark_mob_hp(&mob_id);
                    }
                }
                _ => {}
            }
        }
    }

    fn behavior_phase(&mut self, now: UnixTime) {
        if self.brains.is_empty() {
            return;
        }
        let mob_ids = self.ctx.mobs.mob_ids();
        for mob_id in mob_ids {
            let action = {
                let Some(mob) = self.ctx.mobs.get(&mob_id) else {
                    continue;
                };
                let Some(key) = &mob.behavior else {
                    continue;
                };
                let Some(brain) = self.brains.get_mut(key) else {
                    continue;
                };
                brain.think(now, mob)
            };
            match action {
                Some(MobAction::Say(text)) => {
                    let Some(mob) = self.ctx.mobs.get(&mob_id) else {
                        continue;
                    };
                    let line = format!("{} says, \"{}\"", mob.name, text);
                    let room_id = mob.room_id.clone();
                    self.ctx.broadcast(&room_id, &line, &[]);
                }
                Some(MobAction::Wander(direction)) => {
                    // Mobs in combat hold their ground.
                    if self.ctx.threat.has_entry(&mob_id) {
                        continue;
                    }
                    let Some(mob) = self.ctx.mobs.get(&mob_id) else {
                        continue;
                    };
                    let name = mob.name.clone();
                    let from = mob.room_id.clone();
                    let Some(to) = self
                        .ctx
                        .room(&from)
                        .and_then(|room| room.exits.get(&direction))
                        .cloned()
                    else {
                        continue;
                    };
                    if self.ctx.mobs.move_to(&mob_id, to.clone()).is_ok() {
                        self.ctx
                            .broadcast(&from, &format!("{} leaves {}.", name, direction), &[]);
                        self.ctx.broadcast(&to, &format!("{} arrives.", name), &[]);
                    }
                }
                None => {}
            }
        }
    }

    /// Emits the minimum set of change events. For mob HP the loop is over
    /// players, testing dirty membership per room, so a packed room with one
    /// bleeding mob costs one pass over its occupants rather than a product
    /// over all dirty mobs.
    fn flush_dirty(&mut self) {
        for session_id in self.ctx.dirty.take_vitals() {
            let Some(player) = self.ctx.players.get(session_id) else {
                continue;
            };
            let dto = PlayerVitalsDto {
                hp: player.hp,
                max_hp: player.max_hp,
                mana: player.mana,
                max_mana: player.max_mana,
            };
            if let Ok(data) = serde_json::to_vec(&dto) {
                self.ctx.outbox.gmcp(session_id, "Char.Vitals", data);
            }
        }

        for session_id in self.ctx.dirty.take_status() {
            if !self.ctx.players.contains(session_id) {
                continue;
            }
            let dto = EffectStacksDto {
                stacks: self.ctx.status.stacks_snapshot(session_id),
            };
            if let Ok(data) = serde_json::to_vec(&dto) {
                self.ctx.outbox.gmcp(session_id, "Char.Status", data);
            }
        }

        let dirty_mobs = self.ctx.dirty.take_mob_hp();
        if !dirty_mobs.is_empty() {
            let sessions: Vec<(SessionId, RoomId)> = self
                .ctx
                .players
                .iter()
                .map(|p| (p.session_id, p.room_id.clone()))
                .collect();
            for (session_id, room_id) in sessions {
                let updates: Vec<MobHpDto> = self
                    .ctx
                    .mobs
                    .mobs_in_room(&room_id)
                    .iter()
                    .filter(|mob_id| dirty_mobs.contains(*mob_id))
                    .filter_map(|mob_id| self.ctx.mobs.get(mob_id))
                    .map(|mob| MobHpDto {
                        mob_id: mob.id.clone(),
                        name: mob.name.clone(),
                        hp: mob.hp,
                        max_hp: mob.max_hp,
                    })
                    .collect();
                if updates.is_empty() {
                    continue;
                }
                if let Ok(data) = serde_json::to_vec(&updates) {
                    self.ctx.outbox.gmcp(session_id, "Room.Mobs", data);
                }
            }
        }

        for group_id in self.ctx.dirty.take_groups() {
            let Some(group) = self.ctx.groups.get(group_id) else {
                continue;
            };
            let members = group.members.clone();
            let dto = GroupInfoDto {
                group_id,
                leader: self.ctx.players.name_of(members[0]),
                members: members
                    .iter()
                    .map(|sid| self.ctx.players.name_of(*sid))
                    .collect(),
            };
            if let Ok(data) = serde_json::to_vec(&dto) {
                for member in members {
                    self.ctx.outbox.gmcp(member, "Group.Info", data.clone());
                }
            }
        }
    }
}
