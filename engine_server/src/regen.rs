// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::context::Context;
use core_protocol::id::SessionId;
use core_protocol::UnixTime;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;

/// Passive HP/mana recovery timestamps. Constitution shortens the HP
/// interval down to a floor; mana runs on a flat interval.
#[derive(Default)]
pub struct RegenRepo {
    last_hp: HashMap<SessionId, UnixTime>,
    last_mana: HashMap<SessionId, UnixTime>,
}

impl RegenRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forget(&mut self, session_id: SessionId) {
        self.last_hp.remove(&session_id);
        self.last_mana.remove(&session_id);
    }
}

/// One regen pass. Shuffled and capped like every per-player phase so a
/// large population degrades fairly instead of starving late entries.
pub fn tick(ctx: &mut Context, now: UnixTime) {
    let mut session_ids = ctx.players.session_ids();
    session_ids.shuffle(&mut thread_rng());
    session_ids.truncate(ctx.config.max_regens_per_tick);

    for session_id in session_ids {
        let Some(player) = ctx.players.get(session_id) else {
            continue;
        };
        if player.in_handoff {
            continue;
        }

        let con_total = player.base_stats.constitution as i64
            + ctx.items.equip_stat_mods(session_id, &ctx.content).constitution as i64
            + ctx.status.player_stat_mods(session_id).constitution as i64;
        let hp_interval = ctx
            .config
            .hp_regen_base_ms
            .saturating_sub((con_total.max(0) as u64) * ctx.config.hp_regen_ms_per_con)
            .max(ctx.config.hp_regen_min_ms);

        let hp_due = {
            let last = *self_entry(&mut ctx.regen.last_hp, session_id, now);
            player.hp < player.max_hp && now.saturating_sub(last) >= hp_interval
        };
        let mana_due = {
            let last = *self_entry(&mut ctx.regen.last_mana, session_id, now);
            player.mana < player.max_mana && now.saturating_sub(last) >= ctx.config.mana_regen_ms
        };
        if !hp_due && !mana_due {
            continue;
        }

        let hp_amount = ctx.config.hp_regen_amount;
        let mana_amount = ctx.config.mana_regen_amount;
        let Some(player) = ctx.players.get_mut(session_id) else {
            continue;
        };
        if hp_due {
            player.hp = (player.hp + hp_amount).min(player.max_hp);
            ctx.regen.last_hp.insert(session_id, now);
        }
        if mana_due {
            player.mana = (player.mana + mana_amount).min(player.max_mana);
            ctx.regen.last_mana.insert(session_id, now);
        }
        ctx.dirty.mark_vitals(session_id);
    }
}

/// First sighting of a session starts its timer at `now`; no retroactive
/// regen on login.
fn self_entry(
    map: &mut HashMap<SessionId, UnixTime>,
    session_id: SessionId,
    now: UnixTime,
) -> &UnixTime {
    map.entry(session_id).or_insert(now)
}
