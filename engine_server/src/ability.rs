// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ability casting: class/level/mana/cooldown gates, target resolution, and
//! the four effect shapes. Damage and healing go through the combat module
//! so threat and death handling are the same as melee.

use crate::combat;
use crate::context::Context;
use crate::status::EffectTarget;
use core_protocol::id::{AbilityId, SessionId};
use core_protocol::UnixTime;
use std::collections::HashMap;
use world::templates::{AbilityDef, AbilityEffect, TargetRule};

/// Per-session, per-ability cooldowns (ready-at timestamps).
#[derive(Default)]
pub struct AbilityRepo {
    cooldowns: HashMap<(SessionId, AbilityId), UnixTime>,
}

impl AbilityRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_at(&self, session_id: SessionId, ability: &AbilityId) -> Option<UnixTime> {
        self.cooldowns.get(&(session_id, ability.clone())).copied()
    }

    pub fn trigger(&mut self, session_id: SessionId, ability: &AbilityId, ready_at: UnixTime) {
        self.cooldowns
            .insert((session_id, ability.clone()), ready_at);
    }

    /// Bookkeeping phase: drop elapsed entries so the map tracks only live
    /// cooldowns.
    pub fn prune(&mut self, now: UnixTime) {
        self.cooldowns.retain(|_, ready_at| *ready_at > now);
    }

    pub fn forget(&mut self, session_id: SessionId) {
        self.cooldowns.retain(|(sid, _), _| *sid != session_id);
    }

    pub fn len(&self) -> usize {
        self.cooldowns.len()
    }
}

enum ResolvedTarget {
    Me,
    Ally(SessionId),
    Enemy(core_protocol::id::MobId),
}

/// `cast <ability> [target]`.
pub fn cast(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    ability_keyword: &str,
    target_keyword: &str,
) -> Result<(), String> {
    let (class, level, mana, room_id) = {
        let player = ctx
            .players
            .get(session_id)
            .ok_or_else(|| "You are not in the world.".to_owned())?;
        (player.class, player.level, player.mana, player.room_id.clone())
    };

    // Class gate is implicit: only this class's spellbook is searched.
    let keyword = ability_keyword.to_ascii_lowercase();
    let def: AbilityDef = ctx
        .content
        .abilities_for_class(class)
        .into_iter()
        .find(|a| {
            a.id.as_str() == keyword || a.name.to_ascii_lowercase().starts_with(&keyword)
        })
        .cloned()
        .ok_or_else(|| "You know no such ability.".to_owned())?;

    if level < def.min_level {
        return Err(format!(
            "{} requires level {}.",
            def.name, def.min_level
        ));
    }
    if mana < def.mana_cost {
        return Err("You don't have enough mana.".to_owned());
    }
    if let Some(ready_at) = ctx.abilities.ready_at(session_id, &def.id) {
        if ready_at > now {
            return Err(format!("{} is not ready yet.", def.name));
        }
    }

    let target = resolve_target(ctx, session_id, &def, target_keyword, &room_id)?;

    // Gates passed: spend mana and start the cooldown.
    if let Some(player) = ctx.players.get_mut(session_id) {
        player.mana -= def.mana_cost;
    }
    ctx.dirty.mark_vitals(session_id);
    ctx.abilities
        .trigger(session_id, &def.id, now + def.cooldown_ms);

    apply(ctx, now, session_id, &def, target);
    ctx.outbox.prompt(session_id);
    Ok(())
}

fn resolve_target(
    ctx: &Context,
    session_id: SessionId,
    def: &AbilityDef,
    keyword: &str,
    room_id: &core_protocol::id::RoomId,
) -> Result<ResolvedTarget, String> {
    match def.target {
        TargetRule::SelfOnly => Ok(ResolvedTarget::Me),
        TargetRule::Ally => {
            if keyword.is_empty() {
                return Ok(ResolvedTarget::Me);
            }
            let target = ctx
                .players
                .find_by_name(keyword)
                .ok_or_else(|| "They are not here.".to_owned())?;
            if target == session_id {
                return Ok(ResolvedTarget::Me);
            }
            let same_room = ctx
                .players
                .get(target)
                .map(|p| p.room_id == *room_id)
                .unwrap_or(false);
            if !same_room {
                return Err("They are not here.".to_owned());
            }
            if !ctx.groups.are_grouped(session_id, target) {
                return Err("They are not in your group.".to_owned());
            }
            Ok(ResolvedTarget::Ally(target))
        }
        TargetRule::Enemy => {
            let mob_id = if keyword.is_empty() {
                ctx.combat
                    .target_of(session_id)
                    .cloned()
                    .ok_or_else(|| "Cast it at what?".to_owned())?
            } else {
                ctx.mobs
                    .find_in_room(room_id, keyword)
                    .ok_or_else(|| "You don't see that here.".to_owned())?
            };
            Ok(ResolvedTarget::Enemy(mob_id))
        }
    }
}

fn apply(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    def: &AbilityDef,
    target: ResolvedTarget,
) {
    let caster_class = ctx
        .players
        .get(session_id)
        .map(|p| p.class)
        .unwrap_or(core_protocol::dto::PlayerClass::Warrior);

    match (&def.effect, target) {
        (AbilityEffect::Damage { amount }, ResolvedTarget::Enemy(mob_id)) => {
            let mob_name = ctx.mobs.name_of(&mob_id);
            ctx.outbox.line(
                session_id,
                format!("Your {} hits {} for {}.", def.name, mob_name, amount),
            );
            combat::apply_mob_damage(
                ctx,
                now,
                &mob_id,
                session_id,
                *amount,
                caster_class.threat_multiplier(),
            );
        }
        (AbilityEffect::AreaDamage { amount }, _) => {
            area_damage(ctx, now, session_id, def, *amount, caster_class);
        }
        (AbilityEffect::Heal { amount }, target) => {
            let target_sid = match target {
                ResolvedTarget::Ally(sid) => sid,
                _ => session_id,
            };
            let healed = combat::heal_player(ctx, now, target_sid, *amount, Some(session_id));
            if target_sid == session_id {
                ctx.outbox.line(
                    session_id,
                    format!("Your {} restores {} health.", def.name, healed),
                );
            } else {
                let target_name = ctx.players.name_of(target_sid);
                ctx.outbox.line(
                    session_id,
                    format!("Your {} restores {} health to {}.", def.name, healed, target_name),
                );
                let caster_name = ctx.players.name_of(session_id);
                ctx.outbox.line(
                    target_sid,
                    format!("{}'s {} restores {} health.", caster_name, def.name, healed),
                );
            }
        }
        (AbilityEffect::ApplyEffect { effect }, target) => {
            let Some(effect_def) = ctx.content.effects.get(effect).cloned() else {
                return;
            };
            match target {
                ResolvedTarget::Enemy(mob_id) => {
                    ctx.status
                        .apply_to_mob(now, &mob_id, &effect_def, Some(session_id));
                    let mob_name = ctx.mobs.name_of(&mob_id);
                    ctx.outbox.line(
                        session_id,
                        format!("{} afflicts {}.", effect_def.name, mob_name),
                    );
                    // Applying a hostile effect is an act of aggression.
                    ctx.threat
                        .add(&mob_id, session_id, caster_class.threat_multiplier());
                    ctx.combat
                        .ensure_mob(&mob_id, now + ctx.config.combat_period_ms);
                }
                ResolvedTarget::Ally(sid) => {
                    ctx.status.apply_to_player(now, sid, &effect_def, Some(session_id));
                    ctx.dirty.mark_status(sid);
                    let target_name = ctx.players.name_of(sid);
                    ctx.outbox.line(
                        session_id,
                        format!("You grant {} to {}.", effect_def.name, target_name),
                    );
                    ctx.outbox
                        .line(sid, format!("{} surrounds you.", effect_def.name));
                }
                ResolvedTarget::Me => {
                    ctx.status
                        .apply_to_player(now, session_id, &effect_def, Some(session_id));
                    ctx.dirty.mark_status(session_id);
                    ctx.outbox
                        .line(session_id, format!("{} surrounds you.", effect_def.name));
                }
            }
        }
        // Damage with no enemy in reach was already rejected at resolution.
        (AbilityEffect::Damage { .. }, _) => {}
    }
}

/// Area damage hits every mob in the caster's room that already has threat
/// from any of the caster's groupmates; it never pulls bystander mobs.
fn area_damage(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    def: &AbilityDef,
    amount: i32,
    caster_class: core_protocol::dto::PlayerClass,
) {
    let Some(player) = ctx.players.get(session_id) else {
        return;
    };
    let room_id = player.room_id.clone();
    let members = ctx.groups.members_or_self(session_id);

    let engaged: Vec<_> = ctx
        .mobs
        .mobs_in_room(&room_id)
        .iter()
        .filter(|mob_id| {
            members
                .iter()
                .any(|member| ctx.threat.has_threat_from(mob_id, *member))
        })
        .cloned()
        .collect();

    if engaged.is_empty() {
        ctx.outbox
            .line(session_id, format!("Your {} finds no target.", def.name));
        return;
    }
    for mob_id in engaged {
        let mob_name = ctx.mobs.name_of(&mob_id);
        ctx.outbox.line(
            session_id,
            format!("Your {} scorches {} for {}.", def.name, mob_name, amount),
        );
        combat::apply_mob_damage(
            ctx,
            now,
            &mob_id,
            session_id,
            amount,
            caster_class.threat_multiplier(),
        );
    }
}
