// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Quest/achievement hooks and XP progression. Hooks are plain functions
//! invoked by combat (kills), the registry (room changes), and abilities
//! (heals); they mutate in-memory progress and queue coalesced saves, never
//! touching persistence synchronously.

use crate::context::Context;
use core_protocol::id::{QuestId, SessionId, TemplateKey};
use core_protocol::UnixTime;
use world::templates::{rules, AchievementGoal, QuestGoal};

/// Grants XP, applying level-ups as many times as the curve allows. Emits
/// the gain line and a line per new level.
pub fn award_xp(ctx: &mut Context, now: UnixTime, session_id: SessionId, amount: u64) {
    if amount == 0 {
        return;
    }
    let (mut level, xp_total) = {
        let Some(player) = ctx.players.get_mut(session_id) else {
            return;
        };
        player.xp_total += amount;
        (player.level, player.xp_total)
    };
    ctx.outbox
        .line(session_id, format!("You gain {} XP.", amount));

    let target_level = rules::level_for_xp(xp_total);
    while level < target_level {
        level += 1;
        let (room_id, name) = {
            let Some(player) = ctx.players.get_mut(session_id) else {
                return;
            };
            player.level = level;
            player.base_max_hp =
                rules::max_hp_for(player.class, player.base_stats.constitution, level);
            player.max_hp = player.base_max_hp;
            player.hp = player.max_hp;
            player.max_mana = rules::max_mana_for(
                player.class,
                player.base_stats.intelligence,
                player.base_stats.wisdom,
                level,
            );
            player.mana = player.max_mana;
            (player.room_id.clone(), player.name.to_string())
        };
        ctx.dirty.mark_vitals(session_id);
        ctx.outbox
            .line(session_id, format!("You are now level {}!", level));
        ctx.broadcast(
            &room_id,
            &format!("{} has reached level {}!", name, level),
            &[session_id],
        );
        on_level(ctx, now, session_id, level);
    }
    queue_save(ctx, now, session_id);
}

/// Kill credit for one contributor. `killing_blow` gates nothing today but
/// is part of the hook contract for content that cares.
pub fn on_kill(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    template: &TemplateKey,
    _killing_blow: bool,
) {
    let quest_ids: Vec<QuestId> = ctx
        .content
        .quests
        .values()
        .filter(|quest| {
            matches!(&quest.goal, QuestGoal::KillCount { template: t, .. } if t == template)
        })
        .map(|quest| quest.id.clone())
        .collect();

    for quest_id in quest_ids {
        bump_quest(ctx, now, session_id, &quest_id, 1);
    }

    // Lifetime kill counters for achievements.
    let achievement_ids: Vec<_> = ctx
        .content
        .achievements
        .values()
        .filter(|a| matches!(a.goal, AchievementGoal::TotalKills { .. }))
        .map(|a| a.id.clone())
        .collect();
    for achievement_id in achievement_ids {
        let Some(player) = ctx.players.get_mut(session_id) else {
            return;
        };
        let count = player
            .achievement_progress
            .entry(achievement_id.clone())
            .or_insert(0);
        *count += 1;
        let count = *count;
        if let Some(def) = ctx.content.achievements.get(&achievement_id).cloned() {
            if let AchievementGoal::TotalKills { count: needed } = def.goal {
                if count >= needed {
                    unlock_achievement(ctx, now, session_id, &def.id);
                }
            }
        }
    }
}

pub fn on_room_change(ctx: &mut Context, now: UnixTime, session_id: SessionId) {
    let Some(player) = ctx.players.get(session_id) else {
        return;
    };
    let room_id = player.room_id.clone();
    let quest_ids: Vec<QuestId> = ctx
        .content
        .quests
        .values()
        .filter(|quest| matches!(&quest.goal, QuestGoal::VisitRoom { room } if *room == room_id))
        .map(|quest| quest.id.clone())
        .collect();
    for quest_id in quest_ids {
        bump_quest(ctx, now, session_id, &quest_id, 1);
    }
}

pub fn on_level(ctx: &mut Context, now: UnixTime, session_id: SessionId, level: u32) {
    let achievements: Vec<_> = ctx
        .content
        .achievements
        .values()
        .filter(
            |a| matches!(a.goal, AchievementGoal::ReachLevel { level: needed } if level >= needed),
        )
        .map(|a| a.id.clone())
        .collect();
    for id in achievements {
        unlock_achievement(ctx, now, session_id, &id);
    }
}

/// Heal hook; reserved for content goals, currently only bookkeeping-free.
pub fn on_heal(_ctx: &mut Context, _now: UnixTime, _session_id: SessionId, _amount: i32) {}

/// Advances a quest counter, auto-tracking on first progress and completing
/// when the goal is met.
fn bump_quest(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    quest_id: &QuestId,
    by: u32,
) {
    let Some(def) = ctx.content.quests.get(quest_id).cloned() else {
        return;
    };
    let needed = match &def.goal {
        QuestGoal::KillCount { count, .. } => *count,
        QuestGoal::VisitRoom { .. } => 1,
    };
    let Some(player) = ctx.players.get_mut(session_id) else {
        return;
    };
    if player.completed_quests.contains(quest_id) {
        return;
    }
    let progress = player.active_quests.entry(quest_id.clone()).or_insert(0);
    *progress += by;
    let done = *progress >= needed;
    if !done {
        return;
    }
    player.active_quests.remove(quest_id);
    player.completed_quests.insert(quest_id.clone());
    player.gold += def.gold_reward;
    ctx.outbox
        .line(session_id, format!("Quest complete: {}!", def.name));
    if def.gold_reward > 0 {
        ctx.outbox
            .line(session_id, format!("You receive {} gold.", def.gold_reward));
    }
    award_xp(ctx, now, session_id, def.xp_reward);

    // Quests-completed achievements.
    let achievements: Vec<_> = ctx
        .content
        .achievements
        .values()
        .filter(|a| matches!(a.goal, AchievementGoal::QuestsCompleted { .. }))
        .map(|a| (a.id.clone(), a.goal.clone()))
        .collect();
    for (id, goal) in achievements {
        let Some(player) = ctx.players.get(session_id) else {
            return;
        };
        let completed = player.completed_quests.len() as u64;
        if let AchievementGoal::QuestsCompleted { count } = goal {
            if completed >= count {
                unlock_achievement(ctx, now, session_id, &id);
            }
        }
    }
}

fn unlock_achievement(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    id: &core_protocol::id::AchievementId,
) {
    let Some(def) = ctx.content.achievements.get(id).cloned() else {
        return;
    };
    let Some(player) = ctx.players.get_mut(session_id) else {
        return;
    };
    if !player.unlocked_achievements.insert(id.clone()) {
        return;
    }
    if let Some(title) = &def.title {
        player.active_title = Some(title.clone());
    }
    ctx.outbox
        .info(session_id, format!("Achievement unlocked: {}!", def.name));
    queue_save(ctx, now, session_id);
}

/// Queues a coalesced persistence write of the player's current state.
pub fn queue_save(ctx: &mut Context, now: UnixTime, session_id: SessionId) {
    if let Some(player) = ctx.players.get(session_id) {
        ctx.saves.queue(player.to_record(now));
    }
}
