// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! N-to-M combat: any number of players on any number of mobs. Who a mob
//! swings at is always the threat table's answer; everything that deals
//! damage or healing funnels through here so threat, dirty marking, and
//! death handling cannot diverge.

use crate::context::Context;
use crate::progress;
use core_protocol::id::{MobId, SessionId};
use core_protocol::UnixTime;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use world::templates::EffectKind;

#[derive(Clone, Debug)]
pub struct PlayerCombat {
    pub mob_id: MobId,
    pub next_swing_at: UnixTime,
}

#[derive(Clone, Debug)]
pub struct MobCombat {
    pub next_strike_at: UnixTime,
}

/// Who is fighting what, and when they act next. Threat lives in
/// [`crate::threat::ThreatRepo`], not here.
#[derive(Default)]
pub struct CombatRepo {
    player_targets: HashMap<SessionId, PlayerCombat>,
    active_mobs: HashMap<MobId, MobCombat>,
}

impl CombatRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_of(&self, session_id: SessionId) -> Option<&MobId> {
        self.player_targets.get(&session_id).map(|pc| &pc.mob_id)
    }

    pub fn is_engaged(&self, session_id: SessionId) -> bool {
        self.player_targets.contains_key(&session_id)
    }

    pub fn engage_player(&mut self, session_id: SessionId, mob_id: MobId, next_swing_at: UnixTime) {
        self.player_targets.insert(
            session_id,
            PlayerCombat {
                mob_id,
                next_swing_at,
            },
        );
    }

    pub fn clear_player(&mut self, session_id: SessionId) -> Option<MobId> {
        self.player_targets
            .remove(&session_id)
            .map(|pc| pc.mob_id)
    }

    pub fn player_entry_mut(&mut self, session_id: SessionId) -> Option<&mut PlayerCombat> {
        self.player_targets.get_mut(&session_id)
    }

    pub fn ensure_mob(&mut self, mob_id: &MobId, next_strike_at: UnixTime) {
        self.active_mobs
            .entry(mob_id.clone())
            .or_insert(MobCombat { next_strike_at });
    }

    pub fn mob_is_active(&self, mob_id: &MobId) -> bool {
        self.active_mobs.contains_key(mob_id)
    }

    pub fn mob_entry_mut(&mut self, mob_id: &MobId) -> Option<&mut MobCombat> {
        self.active_mobs.get_mut(mob_id)
    }

    pub fn remove_mob(&mut self, mob_id: &MobId) {
        self.active_mobs.remove(mob_id);
    }

    /// Sessions currently targeting this mob (for prompts and cleanup).
    pub fn attackers_of(&self, mob_id: &MobId) -> Vec<SessionId> {
        self.player_targets
            .iter()
            .filter(|(_, pc)| pc.mob_id == *mob_id)
            .map(|(sid, _)| *sid)
            .collect()
    }

    pub fn player_entries(&self) -> Vec<(SessionId, MobId)> {
        self.player_targets
            .iter()
            .map(|(sid, pc)| (*sid, pc.mob_id.clone()))
            .collect()
    }

    pub fn active_mob_ids(&self) -> Vec<MobId> {
        self.active_mobs.keys().cloned().collect()
    }

    pub fn active_mob_count(&self) -> usize {
        self.active_mobs.len()
    }
}

/// `kill <keyword>` entry point.
pub fn start_combat(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    keyword: &str,
) -> Result<(), String> {
    let (room_id, class, attacker_name) = {
        let player = ctx
            .players
            .get(session_id)
            .ok_or_else(|| "You are not in the world.".to_owned())?;
        (player.room_id.clone(), player.class, player.name.to_string())
    };
    if let Some(current) = ctx.combat.target_of(session_id) {
        return Err(format!(
            "You are already fighting {}.",
            ctx.mobs.name_of(current)
        ));
    }
    let mob_id = ctx
        .mobs
        .find_in_room(&room_id, keyword)
        .ok_or_else(|| "You don't see that here.".to_owned())?;
    let mob_name = ctx.mobs.name_of(&mob_id);

    let period = ctx.config.combat_period_ms;
    ctx.combat
        .engage_player(session_id, mob_id.clone(), now + period);
    ctx.combat.ensure_mob(&mob_id, now + period);
    // Seed threat so the mob retaliates against the initiator.
    ctx.threat
        .add(&mob_id, session_id, class.threat_multiplier());

    ctx.outbox
        .line(session_id, format!("You attack {}.", mob_name));
    ctx.outbox.prompt(session_id);
    ctx.broadcast(
        &room_id,
        &format!("{} attacks {}.", attacker_name, mob_name),
        &[session_id],
    );
    Ok(())
}

/// One combat phase: player swings, then mob strikes, sharing one budget so
/// a crowded battlefield defers work instead of stretching the tick.
pub fn tick(ctx: &mut Context, now: UnixTime) {
    let budget = ctx.config.max_combats_per_tick;
    let used = player_swings(ctx, now, budget);
    mob_strikes(ctx, now, budget.saturating_sub(used));
}

fn player_swings(ctx: &mut Context, now: UnixTime, budget: usize) -> usize {
    let mut entries = ctx.combat.player_entries();
    entries.shuffle(&mut thread_rng());

    let mut used = 0;
    for (session_id, mob_id) in entries {
        if used >= budget {
            break;
        }
        used += 1;
        // A death earlier in this phase may have already cleared the pair.
        if ctx.combat.target_of(session_id) != Some(&mob_id) {
            continue;
        }
        let Some(player) = ctx.players.get(session_id) else {
            ctx.combat.clear_player(session_id);
            continue;
        };
        let room_id = player.room_id.clone();
        let player_hp = player.hp;

        let mob_present = ctx
            .mobs
            .get(&mob_id)
            .map(|m| m.room_id == room_id)
            .unwrap_or(false);
        if !mob_present {
            ctx.combat.clear_player(session_id);
            ctx.threat.remove_player_from(&mob_id, session_id);
            release_mob_if_uncontested(ctx, &mob_id);
            ctx.outbox
                .line(session_id, "Your opponent is no longer here.");
            ctx.outbox.prompt(session_id);
            continue;
        }

        if player_hp <= 0 {
            handle_player_death(ctx, now, session_id, None);
            continue;
        }

        if ctx.status.has_player_effect(session_id, EffectKind::Stun) {
            ctx.outbox
                .line(session_id, "You are stunned and cannot act!");
            continue;
        }

        let period = ctx.config.combat_period_ms;
        {
            let Some(entry) = ctx.combat.player_entry_mut(session_id) else {
                continue;
            };
            if entry.next_swing_at > now {
                continue;
            }
            entry.next_swing_at = now + period;
        }

        swing(ctx, now, session_id, &mob_id);
    }
    used
}

/// One melee swing, already past the cadence gate.
fn swing(ctx: &mut Context, now: UnixTime, session_id: SessionId, mob_id: &MobId) {
    let (class, strength_total) = {
        let Some(player) = ctx.players.get(session_id) else {
            return;
        };
        let equip = ctx.items.equip_stat_mods(session_id, &ctx.content);
        let status = ctx.status.player_stat_mods(session_id);
        (
            player.class,
            player.base_stats.strength as i32 + equip.strength + status.strength,
        )
    };
    let attack_bonus = ctx.items.attack_bonus(session_id, &ctx.content);
    let str_bonus =
        (strength_total - ctx.config.stat_baseline) / ctx.config.strength_divisor;

    let roll = thread_rng()
        .gen_range(ctx.config.player_min_damage..=ctx.config.player_max_damage);

    let (mob_name, armor) = {
        let Some(mob) = ctx.mobs.get(mob_id) else {
            return;
        };
        (mob.name.clone(), mob.armor)
    };
    let damage = (roll + attack_bonus + str_bonus - armor).max(1);

    ctx.outbox.line(
        session_id,
        format!("You hit {} for {}.", mob_name, damage),
    );
    apply_mob_damage(ctx, now, mob_id, session_id, damage, class.threat_multiplier());
}

fn mob_strikes(ctx: &mut Context, now: UnixTime, budget: usize) {
    let mut mob_ids = ctx.combat.active_mob_ids();
    mob_ids.shuffle(&mut thread_rng());

    let mut used = 0;
    for mob_id in mob_ids {
        if used >= budget {
            break;
        }
        let due = ctx
            .combat
            .mob_entry_mut(&mob_id)
            .map(|mc| mc.next_strike_at <= now)
            .unwrap_or(false);
        if !due {
            continue;
        }
        used += 1;

        let Some(mob) = ctx.mobs.get(&mob_id) else {
            ctx.combat.remove_mob(&mob_id);
            ctx.threat.remove_mob(&mob_id);
            continue;
        };
        let mob_room = mob.room_id.clone();
        let mob_name = mob.name.clone();
        let (min_damage, max_damage) = (mob.min_damage, mob.max_damage);

        let period = ctx.config.combat_period_ms;
        if let Some(entry) = ctx.combat.mob_entry_mut(&mob_id) {
            entry.next_strike_at = now + period;
        }

        if ctx.status.has_mob_effect(&mob_id, EffectKind::Stun) {
            continue;
        }

        // Threat-weighted victim, restricted to players actually here.
        let players = &ctx.players;
        let target = ctx.threat.top(&mob_id, |sid| {
            players
                .get(sid)
                .map(|p| p.room_id == mob_room && !p.in_handoff)
                .unwrap_or(false)
        });
        let Some(target) = target else {
            // Nobody reachable: the mob leaves combat.
            ctx.combat.remove_mob(&mob_id);
            continue;
        };

        let dodged = {
            let Some(player) = ctx.players.get(target) else {
                continue;
            };
            let equip = ctx.items.equip_stat_mods(target, &ctx.content);
            let status = ctx.status.player_stat_mods(target);
            let dex_total =
                player.base_stats.dexterity as i32 + equip.dexterity + status.dexterity;
            let dodge_pct = ((dex_total - ctx.config.stat_baseline) as f64
                * ctx.config.dodge_pct_per_dex)
                .clamp(0.0, ctx.config.max_dodge_pct);
            thread_rng().gen_bool(dodge_pct / 100.0)
        };

        if dodged {
            ctx.outbox
                .line(target, format!("You dodge {}'s attack.", mob_name));
        } else {
            let raw = thread_rng().gen_range(min_damage..=max_damage);
            let armor = ctx.items.armor_bonus(target, &ctx.content);
            let reduced = (raw - armor).max(1);
            apply_player_damage(ctx, now, target, reduced, &mob_name);
        }

        // Everyone in this fight gets a fresh prompt after the strike.
        for attacker in ctx.combat.attackers_of(&mob_id) {
            ctx.outbox.prompt(attacker);
        }
        ctx.outbox.prompt(target);
    }
}

/// Applies damage to a player through shields, marking vitals and handling
/// death. `source` is the attacker's display name.
pub fn apply_player_damage(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    amount: i32,
    source: &str,
) -> bool {
    let absorb = ctx.status.absorb_player_damage(session_id, amount);
    if absorb.absorbed > 0 {
        ctx.dirty.mark_status(session_id);
        ctx.outbox.line(
            session_id,
            format!("Your shield absorbs {} damage.", absorb.absorbed),
        );
    }
    for name in &absorb.broken {
        ctx.outbox
            .line(session_id, format!("Your {} shatters!", name));
    }
    if absorb.after <= 0 {
        return false;
    }

    let dead = {
        let Some(player) = ctx.players.get_mut(session_id) else {
            return false;
        };
        player.hp -= absorb.after;
        player.hp <= 0
    };
    ctx.dirty.mark_vitals(session_id);
    ctx.outbox.line(
        session_id,
        format!("{} hits you for {}.", source, absorb.after),
    );
    if dead {
        handle_player_death(ctx, now, session_id, Some(source));
    }
    dead
}

/// Applies damage to a mob and credits threat; the uniform path for melee,
/// abilities, and DOTs.
pub fn apply_mob_damage(
    ctx: &mut Context,
    now: UnixTime,
    mob_id: &MobId,
    attacker: SessionId,
    amount: i32,
    threat_multiplier: f64,
) -> bool {
    let dead = {
        let Some(mob) = ctx.mobs.get_mut(mob_id) else {
            return false;
        };
        mob.hp -= amount;
        mob.hp <= 0
    };
    ctx.dirty.mark_mob_hp(mob_id);
    ctx.threat
        .add(mob_id, attacker, amount as f64 * threat_multiplier);
    // Even a cast from ambush wakes the mob up.
    ctx.combat
        .ensure_mob(mob_id, now + ctx.config.combat_period_ms);

    if dead {
        handle_mob_death(ctx, now, mob_id, attacker);
    }
    dead
}

/// Heals a player, clamped to max, generating healing threat for the healer.
pub fn heal_player(
    ctx: &mut Context,
    now: UnixTime,
    target: SessionId,
    amount: i32,
    healer: Option<SessionId>,
) -> i32 {
    let actual = {
        let Some(player) = ctx.players.get_mut(target) else {
            return 0;
        };
        let actual = amount.min(player.max_hp - player.hp).max(0);
        player.hp += actual;
        actual
    };
    if actual == 0 {
        return 0;
    }
    ctx.dirty.mark_vitals(target);
    if let Some(healer) = healer {
        healing_threat(ctx, healer, actual);
        progress::on_heal(ctx, now, healer, actual);
    }
    actual
}

/// Healing aggro: every mob in the healer's room that is already fighting
/// one of the healer's same-room groupmates resents the heal. Mobs in other
/// rooms never gain threat from it.
pub fn healing_threat(ctx: &mut Context, healer: SessionId, amount: i32) {
    let Some(player) = ctx.players.get(healer) else {
        return;
    };
    let room_id = player.room_id.clone();
    let mates: Vec<SessionId> = ctx
        .groups
        .members_or_self(healer)
        .into_iter()
        .filter(|sid| {
            ctx.players
                .get(*sid)
                .map(|p| p.room_id == room_id)
                .unwrap_or(false)
        })
        .collect();

    let threat = amount as f64 * ctx.config.healing_threat_multiplier;
    for mob_id in ctx.mobs.mobs_in_room(&room_id).to_vec() {
        if mates
            .iter()
            .any(|mate| ctx.threat.has_threat_from(&mob_id, *mate))
        {
            ctx.threat.add(&mob_id, healer, threat);
        }
    }
}

/// Mob death: loot, gold to the killer, split XP, hooks, respawn timer.
pub fn handle_mob_death(ctx: &mut Context, now: UnixTime, mob_id: &MobId, killer: SessionId) {
    let contributors = ctx.threat.contributors(mob_id);
    for attacker in ctx.combat.attackers_of(mob_id) {
        ctx.combat.clear_player(attacker);
        ctx.outbox.prompt(attacker);
    }
    ctx.combat.remove_mob(mob_id);
    ctx.threat.remove_mob(mob_id);
    ctx.status.clear_mob(mob_id);
    ctx.dirty.unmark_mob(mob_id);

    let Some(mob) = ctx.mobs.remove(mob_id) else {
        return;
    };

    // Carried items and template drops end up on the floor.
    for item_id in ctx.items.items_on_mob(mob_id) {
        let _ = ctx
            .items
            .move_to(item_id, crate::item::ItemLocation::Room(mob.room_id.clone()));
    }
    if let Some(template) = ctx.content.mob_templates.get(&mob.template).cloned() {
        for drop in &template.drops {
            if thread_rng().gen_bool(drop.chance.clamp(0.0, 1.0)) {
                ctx.items.spawn(
                    drop.template.clone(),
                    crate::item::ItemLocation::Room(mob.room_id.clone()),
                );
            }
        }
        ctx.scheduler.schedule(
            now + template.respawn_ms,
            crate::scheduler::ActionKind::RespawnMob {
                template: mob.template.clone(),
                room: mob.room_id.clone(),
            },
        );
    }

    ctx.broadcast(&mob.room_id, &format!("{} dies.", mob.name), &[]);

    // Gold goes to the killer alone.
    if mob.gold_max > 0 {
        let gold = thread_rng().gen_range(mob.gold_min..=mob.gold_max);
        if gold > 0 {
            if let Some(player) = ctx.players.get_mut(killer) {
                player.gold += gold;
                ctx.outbox
                    .line(killer, format!("You loot {} gold.", gold));
            }
        }
    }

    // XP splits across groupmates present in the killing room, with a bonus
    // for fighting together and a per-recipient charisma adjustment.
    let recipients: Vec<SessionId> = ctx
        .groups
        .members_or_self(killer)
        .into_iter()
        .filter(|sid| {
            ctx.players
                .get(*sid)
                .map(|p| p.room_id == mob.room_id)
                .unwrap_or(false)
        })
        .collect();
    let k = recipients.len().max(1) as u64;
    let bonus = 1.0 + (k - 1) as f64 * ctx.config.group_xp_bonus_per_member;
    let share = ((mob.xp_reward / k) as f64 * bonus) as u64;
    for session_id in recipients {
        let charisma_total = ctx
            .players
            .get(session_id)
            .map(|p| p.base_stats.charisma as i32)
            .unwrap_or(0)
            + ctx.items.equip_stat_mods(session_id, &ctx.content).charisma
            + ctx.status.player_stat_mods(session_id).charisma;
        let over_baseline = (charisma_total - ctx.config.stat_baseline).max(0) as f64;
        let amount =
            (share as f64 * (1.0 + over_baseline * ctx.config.charisma_xp_bonus_per_point)) as u64;
        progress::award_xp(ctx, now, session_id, amount);
    }

    for contributor in contributors {
        progress::on_kill(ctx, now, contributor, &mob.template, contributor == killer);
    }
}

/// Player death: leave combat everywhere, drop threat, respawn at the
/// engine's starting room at half health.
pub fn handle_player_death(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    killer: Option<&str>,
) {
    ctx.combat.clear_player(session_id);
    let threatened = ctx.threat.mobs_threatened_by(session_id);
    ctx.threat.remove_player(session_id);
    for mob_id in threatened {
        release_mob_if_uncontested(ctx, &mob_id);
    }
    ctx.status.clear_player(session_id);
    ctx.dirty.mark_status(session_id);

    let (room_id, name) = {
        let Some(player) = ctx.players.get(session_id) else {
            return;
        };
        (player.room_id.clone(), player.name.to_string())
    };
    match killer {
        Some(killer) => {
            ctx.outbox
                .line(session_id, format!("You have been slain by {}!", killer));
        }
        None => {
            ctx.outbox.line(session_id, "You collapse, lifeless.");
        }
    }
    ctx.broadcast(
        &room_id,
        &format!("{} falls to the ground, slain.", name),
        &[session_id],
    );

    let respawn_room = ctx.content.starting_room.clone().unwrap_or(room_id);
    {
        let Some(player) = ctx.players.get_mut(session_id) else {
            return;
        };
        player.hp = (player.max_hp / 2).max(1);
    }
    let _ = ctx.players.move_to(session_id, respawn_room.clone());
    ctx.dirty.mark_vitals(session_id);
    if let Some(room) = ctx.room(&respawn_room) {
        let title = room.title.clone();
        ctx.outbox
            .line(session_id, format!("You awaken at {}.", title));
    }
    ctx.outbox.prompt(session_id);
    progress::queue_save(ctx, now, session_id);
}

/// `flee` clears the target and every threat entry; a mob nobody threatens
/// or targets returns to idle.
pub fn flee(ctx: &mut Context, session_id: SessionId) -> Result<(), String> {
    let Some(mob_id) = ctx.combat.clear_player(session_id) else {
        return Err("You are not fighting anyone.".to_owned());
    };
    let mob_name = ctx.mobs.name_of(&mob_id);
    let threatened = ctx.threat.mobs_threatened_by(session_id);
    ctx.threat.remove_player(session_id);
    for threatened_mob in threatened {
        release_mob_if_uncontested(ctx, &threatened_mob);
    }

    ctx.outbox
        .line(session_id, format!("You flee from {}!", mob_name));
    ctx.outbox.prompt(session_id);
    let (room_id, name) = {
        let Some(player) = ctx.players.get(session_id) else {
            return Ok(());
        };
        (player.room_id.clone(), player.name.to_string())
    };
    ctx.broadcast(&room_id, &format!("{} flees!", name), &[session_id]);
    Ok(())
}

/// A mob stays in combat only while someone threatens or targets it.
pub fn release_mob_if_uncontested(ctx: &mut Context, mob_id: &MobId) {
    if !ctx.threat.has_entry(mob_id) && ctx.combat.attackers_of(mob_id).is_empty() {
        ctx.combat.remove_mob(mob_id);
    }
}

/// Full combat exit for a session leaving this engine (disconnect/handoff).
pub fn purge_session(ctx: &mut Context, session_id: SessionId) {
    ctx.combat.clear_player(session_id);
    let threatened = ctx.threat.mobs_threatened_by(session_id);
    ctx.threat.remove_player(session_id);
    for mob_id in threatened {
        release_mob_if_uncontested(ctx, &mob_id);
    }
    ctx.status.clear_player(session_id);
}
