// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Two-phase transfer of a live session between engines. The sender keeps
//! the player fully intact (frozen) until the receiver acknowledges, so a
//! timeout or rejection restores the pre-handoff world exactly.

use crate::combat;
use crate::context::Context;
use crate::item::ItemLocation;
use crate::player::PlayerState;
use crate::progress;
use core_protocol::dto::{CarriedItemDto, HandoffStateDto, HandoffTicketDto};
use core_protocol::event::{InterEngineEvent, OutboundEvent};
use core_protocol::id::{EngineId, RoomId, SessionId};
use core_protocol::UnixTime;
use log::{info, warn};
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicketPhase {
    Prepared,
    Sent,
    Acked,
    Committed,
    RolledBack,
}

/// Sender-side ticket.
pub struct OutgoingHandoff {
    pub ticket: HandoffTicketDto,
    pub phase: TicketPhase,
    pub deadline: UnixTime,
}

/// Receiver-side reserved slot, discarded if no commit arrives in time.
pub struct PendingArrival {
    pub state: HandoffStateDto,
    pub from: EngineId,
    pub expires_at: UnixTime,
}

#[derive(Default)]
pub struct HandoffRepo {
    outgoing: HashMap<SessionId, OutgoingHandoff>,
    pending: HashMap<SessionId, PendingArrival>,
}

impl HandoffRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outgoing_phase(&self, session_id: SessionId) -> Option<TicketPhase> {
        self.outgoing.get(&session_id).map(|o| o.phase)
    }

    pub fn has_pending(&self, session_id: SessionId) -> bool {
        self.pending.contains_key(&session_id)
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Disconnect cleanup: abandon any ticket or reservation.
    pub fn forget_session(&mut self, session_id: SessionId) {
        self.outgoing.remove(&session_id);
        self.pending.remove(&session_id);
    }
}

/// Starts a transfer. The player is frozen but untouched; rollback is a
/// single flag flip.
pub fn begin(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    target_room: RoomId,
    to: EngineId,
) -> Result<(), &'static str> {
    if ctx.handoff.outgoing.contains_key(&session_id) {
        return Err("transfer already in progress");
    }
    let state = snapshot(ctx, now, session_id, &target_room).ok_or("no such player")?;
    let player_id = state.record.player_id;

    let blob = match bincode::serialize(&state) {
        Ok(blob) => blob,
        Err(e) => {
            warn!("handoff snapshot failed to encode: {}", e);
            return Err("transfer failed");
        }
    };
    let ticket = HandoffTicketDto {
        session_id,
        player_id,
        from: ctx.engine_id,
        to,
        target_room,
        state: blob,
        created_at: now,
    };

    if let Some(player) = ctx.players.get_mut(session_id) {
        player.in_handoff = true;
    }
    ctx.handoff.outgoing.insert(
        session_id,
        OutgoingHandoff {
            ticket: ticket.clone(),
            phase: TicketPhase::Sent,
            deadline: now + ctx.config.handoff_ack_timeout_ms,
        },
    );
    ctx.inter.send(InterEngineEvent::HandoffPrepare(ticket));
    Ok(())
}

/// Receiver: validate and reserve, or reject.
pub fn on_prepare(ctx: &mut Context, now: UnixTime, ticket: HandoffTicketDto) {
    if ticket.to != ctx.engine_id {
        return;
    }
    let reject = |ctx: &mut Context, reason: &str| {
        ctx.inter.send(InterEngineEvent::HandoffReject {
            session_id: ticket.session_id,
            from: ticket.from,
            to: ticket.to,
            reason: reason.to_owned(),
        });
    };

    if !ctx.zones.owns(ctx.engine_id, &ticket.target_room.zone()) {
        return reject(ctx, "zone not owned here");
    }
    if ctx.room(&ticket.target_room).is_none() {
        return reject(ctx, "no such room");
    }
    let state: HandoffStateDto = match bincode::deserialize(&ticket.state) {
        Ok(state) => state,
        Err(_) => return reject(ctx, "unreadable state"),
    };
    if ctx.players.is_name_online(&state.record.name) {
        return reject(ctx, "name already active");
    }

    ctx.handoff.pending.insert(
        ticket.session_id,
        PendingArrival {
            state,
            from: ticket.from,
            expires_at: now + 2 * ctx.config.handoff_ack_timeout_ms,
        },
    );
    ctx.inter.send(InterEngineEvent::HandoffAck {
        session_id: ticket.session_id,
        from: ticket.from,
        to: ticket.to,
    });
}

/// Sender: receiver said yes. Commit, strip the player out of this engine,
/// and point the gateway at the new owner.
pub fn on_ack(ctx: &mut Context, now: UnixTime, session_id: SessionId) {
    let Some(outgoing) = ctx.handoff.outgoing.get_mut(&session_id) else {
        return;
    };
    if outgoing.phase != TicketPhase::Sent {
        return;
    }
    outgoing.phase = TicketPhase::Acked;
    let to = outgoing.ticket.to;

    ctx.inter
        .send(InterEngineEvent::HandoffCommit { session_id, to });

    // Roll combat and social state off this engine.
    combat::purge_session(ctx, session_id);
    leave_group_with_notice(ctx, session_id);

    let Some(player) = ctx.players.detach(session_id) else {
        ctx.handoff.outgoing.remove(&session_id);
        return;
    };
    let name = player.name;
    let room_id = player.room_id.clone();
    ctx.broadcast(&room_id, &format!("{} leaves.", name), &[]);

    for item_id in ctx.items.carried_by(session_id).to_vec() {
        ctx.items.remove(item_id);
    }
    ctx.regen.forget(session_id);
    ctx.abilities.forget(session_id);
    ctx.dirty.forget_session(session_id);
    ctx.outbox.forget(session_id);
    ctx.saves.forget(player.player_id);
    // Last known location persists with the destination room already set.
    ctx.saves.queue(player.to_record(now));
    ctx.saves.flush(now, true);
    ctx.location.evict_local(name.as_str());

    ctx.outbox.send(OutboundEvent::SessionRedirect {
        session_id,
        engine: to,
    });

    if let Some(outgoing) = ctx.handoff.outgoing.get_mut(&session_id) {
        outgoing.phase = TicketPhase::Committed;
    }
    ctx.handoff.outgoing.remove(&session_id);
    info!("handed off session {} to {}", session_id, to);
}

/// Receiver: sender committed; promote the reserved slot to a live player.
pub fn on_commit(ctx: &mut Context, now: UnixTime, session_id: SessionId) {
    let Some(arrival) = ctx.handoff.pending.remove(&session_id) else {
        return;
    };
    let state = arrival.state;
    let record = &state.record;

    let mut player = PlayerState::from_record(session_id, record, state.ansi_enabled);
    player.hp = state.hp;
    player.max_hp = state.max_hp;
    player.mana = state.mana;
    player.max_mana = state.max_mana;
    let name = player.name;
    let room_id = player.room_id.clone();

    if let Err(e) = ctx.players.attach(player) {
        warn!("handoff commit could not attach {}: {}", name, e);
        return;
    }
    for carried in &state.inventory {
        let location = match carried.equipped {
            Some(slot) => ItemLocation::Equipped(session_id, slot),
            None => ItemLocation::Inventory(session_id),
        };
        ctx.items.spawn(carried.template.clone(), location);
    }
    if let Some(player) = ctx.players.get_mut(session_id) {
        player.achievement_progress = state.achievement_progress.clone();
        player.active_quests = state.quest_progress.clone();
    }

    ctx.location.set(name.as_str(), ctx.engine_id);
    ctx.broadcast(&room_id, &format!("{} enters.", name), &[session_id]);
    crate::command::look(ctx, session_id);
    ctx.dirty.mark_vitals(session_id);
    ctx.outbox.prompt(session_id);
    progress::queue_save(ctx, now, session_id);
    info!("session {} arrived from {}", session_id, arrival.from);
}

/// Sender: receiver refused; restore the player in place.
pub fn on_reject(ctx: &mut Context, session_id: SessionId, reason: &str) {
    if ctx.handoff.outgoing.remove(&session_id).is_none() {
        return;
    }
    warn!("handoff of {} rejected: {}", session_id, reason);
    rollback(ctx, session_id);
}

fn rollback(ctx: &mut Context, session_id: SessionId) {
    if let Some(player) = ctx.players.get_mut(session_id) {
        player.in_handoff = false;
    }
    ctx.outbox.line(session_id, "The way is blocked.");
    ctx.outbox.prompt(session_id);
}

/// Timer phase: sender timeouts roll back; receiver reservations expire.
pub fn tick(ctx: &mut Context, now: UnixTime) {
    let timed_out: Vec<SessionId> = ctx
        .handoff
        .outgoing
        .iter()
        .filter(|(_, o)| o.phase == TicketPhase::Sent && o.deadline <= now)
        .map(|(sid, _)| *sid)
        .collect();
    for session_id in timed_out {
        ctx.handoff.outgoing.remove(&session_id);
        warn!("handoff of {} timed out", session_id);
        rollback(ctx, session_id);
    }

    ctx.handoff
        .pending
        .retain(|_, arrival| arrival.expires_at > now);
}

/// Everything the destination engine needs, from this engine's registries.
fn snapshot(
    ctx: &Context,
    now: UnixTime,
    session_id: SessionId,
    target_room: &RoomId,
) -> Option<HandoffStateDto> {
    let player = ctx.players.get(session_id)?;
    let mut record = player.to_record(now);
    record.room_id = target_room.clone();

    let inventory = ctx
        .items
        .carried_by(session_id)
        .iter()
        .filter_map(|item_id| {
            let item = ctx.items.get(*item_id)?;
            let equipped = match item.location {
                ItemLocation::Equipped(_, slot) => Some(slot),
                _ => None,
            };
            Some(CarriedItemDto {
                template: item.template.clone(),
                equipped,
            })
        })
        .collect();

    Some(HandoffStateDto {
        record,
        hp: player.hp,
        max_hp: player.max_hp,
        mana: player.mana,
        max_mana: player.max_mana,
        ansi_enabled: player.ansi_enabled,
        inventory,
        quest_progress: player.active_quests.clone(),
        achievement_progress: player.achievement_progress.clone(),
    })
}

/// Group cleanup with member notifications, for the sending side.
fn leave_group_with_notice(ctx: &mut Context, session_id: SessionId) {
    let name = ctx.players.name_of(session_id);
    if let Some(outcome) = ctx.groups.on_disconnect(session_id) {
        ctx.dirty.mark_group(outcome.group_id);
        for member in &outcome.remaining {
            ctx.outbox
                .line(*member, format!("{} has left your group.", name));
            if outcome.disbanded {
                ctx.outbox.line(*member, "Your group has disbanded.");
            } else if outcome.new_leader == Some(*member) {
                ctx.outbox.line(*member, "You are now the group leader.");
            }
        }
    }
}
