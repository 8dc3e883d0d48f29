// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Line -> command dispatch for logged-in sessions. Handlers return
//! `Result<(), String>`; the dispatcher renders errors and re-prompts, so
//! every input produces exactly one prompt at flush.

use crate::ability;
use crate::combat;
use crate::context::Context;
use crate::handoff;
use crate::item::ItemLocation;
use crate::progress;
use crate::scheduler::ActionKind;
use core_protocol::event::{DisconnectReason, InterEngineEvent, OutboundEvent};
use core_protocol::id::{RoomId, SessionId};
use core_protocol::UnixTime;
use world::room::Direction;
use world::templates::EffectKind;

pub fn dispatch(ctx: &mut Context, now: UnixTime, session_id: SessionId, line: &str) {
    let trimmed = line.trim();
    let in_handoff = ctx
        .players
        .get(session_id)
        .map(|p| p.in_handoff)
        .unwrap_or(false);
    if in_handoff {
        ctx.outbox
            .line(session_id, "You are between worlds and cannot act.");
        ctx.outbox.prompt(session_id);
        return;
    }

    let result = run(ctx, now, session_id, trimmed);
    if let Err(message) = result {
        ctx.outbox.error(session_id, message);
    }
    ctx.outbox.prompt(session_id);
}

fn run(ctx: &mut Context, now: UnixTime, session_id: SessionId, line: &str) -> Result<(), String> {
    if line.is_empty() {
        return Ok(());
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let verb = verb.to_ascii_lowercase();

    if let Some(direction) = Direction::parse(&verb) {
        return move_player(ctx, now, session_id, direction);
    }

    match verb.as_str() {
        "look" | "l" => {
            look(ctx, session_id);
            Ok(())
        }
        "go" => {
            let direction =
                Direction::parse(rest).ok_or_else(|| "Go which way?".to_owned())?;
            move_player(ctx, now, session_id, direction)
        }
        "say" => say(ctx, session_id, rest),
        "tell" => tell(ctx, session_id, rest),
        "who" => {
            who(ctx, session_id);
            Ok(())
        }
        "kill" | "attack" | "k" => {
            if rest.is_empty() {
                return Err("Kill what?".to_owned());
            }
            combat::start_combat(ctx, now, session_id, rest)
        }
        "flee" => combat::flee(ctx, session_id),
        "cast" => {
            let (ability_keyword, target_keyword) = match rest.split_once(char::is_whitespace) {
                Some((a, t)) => (a, t.trim()),
                None => (rest, ""),
            };
            if ability_keyword.is_empty() {
                return Err("Cast what?".to_owned());
            }
            ability::cast(ctx, now, session_id, ability_keyword, target_keyword)
        }
        "abilities" | "spells" => {
            list_abilities(ctx, session_id);
            Ok(())
        }
        "group" | "g" => group_command(ctx, now, session_id, rest),
        "gtell" | "gt" => group_tell(ctx, session_id, rest),
        "inventory" | "inv" | "i" => {
            inventory(ctx, session_id);
            Ok(())
        }
        "get" | "take" => get_item(ctx, session_id, rest),
        "drop" => drop_item(ctx, session_id, rest),
        "wear" | "wield" | "equip" => equip_item(ctx, session_id, rest),
        "remove" | "unequip" => unequip_item(ctx, session_id, rest),
        "score" | "stats" => {
            score(ctx, session_id);
            Ok(())
        }
        "quests" | "quest" => {
            quests(ctx, session_id);
            Ok(())
        }
        "ansi" => ansi(ctx, session_id, rest),
        "goto" => goto(ctx, now, session_id, rest),
        "quit" => {
            ctx.outbox.line(session_id, "Farewell.");
            ctx.outbox.close(session_id, DisconnectReason::ClientQuit);
            Ok(())
        }
        _ => Err("Huh?".to_owned()),
    }
}

pub fn look(ctx: &mut Context, session_id: SessionId) {
    let Some(player) = ctx.players.get(session_id) else {
        return;
    };
    let room_id = player.room_id.clone();
    let Some(room) = ctx.room(&room_id) else {
        ctx.outbox.line(session_id, "You float in the void.");
        return;
    };
    let mut lines = vec![
        room.title.clone(),
        room.description.clone(),
        format!("Exits: {}.", room.exit_summary()),
    ];
    for feature in &room.features {
        if let world::room::Feature::Sign { name, .. } = feature {
            lines.push(format!("A {} stands here.", name));
        }
    }
    for item_id in ctx.items.items_in_room(&room_id) {
        if let Some(item) = ctx.items.get(*item_id) {
            if let Some(template) = ctx.content.item_templates.get(&item.template) {
                lines.push(format!("{} lies here.", template.name));
            }
        }
    }
    for mob_id in ctx.mobs.mobs_in_room(&room_id) {
        if let Some(mob) = ctx.mobs.get(mob_id) {
            lines.push(format!("{} is here.", mob.name));
        }
    }
    for other in ctx.players.players_in_room(&room_id) {
        if *other != session_id {
            lines.push(format!("{} is here.", ctx.players.name_of(*other)));
        }
    }
    for line in lines {
        ctx.outbox.line(session_id, line);
    }
}

fn move_player(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    direction: Direction,
) -> Result<(), String> {
    if ctx.combat.is_engaged(session_id) {
        return Err("You are in combat! Flee first.".to_owned());
    }
    if ctx.status.has_player_effect(session_id, EffectKind::Root) {
        return Err("You are rooted in place!".to_owned());
    }
    if ctx.status.has_player_effect(session_id, EffectKind::Stun) {
        return Err("You are stunned!".to_owned());
    }

    let (old_room, name) = {
        let player = ctx
            .players
            .get(session_id)
            .ok_or_else(|| "You are not in the world.".to_owned())?;
        (player.room_id.clone(), player.name.to_string())
    };
    let target: RoomId = {
        let room = ctx
            .room(&old_room)
            .ok_or_else(|| "You cannot go that way.".to_owned())?;
        room.exit(direction)
            .cloned()
            .ok_or_else(|| "You cannot go that way.".to_owned())?
    };

    // Same engine: plain move. Another engine's zone: start a handoff.
    if ctx.room(&target).is_some() {
        ctx.broadcast(&old_room, &format!("{} leaves.", name), &[session_id]);
        ctx.players
            .move_to(session_id, target.clone())
            .map_err(|e| e.to_owned())?;
        ctx.broadcast(&target, &format!("{} arrives.", name), &[session_id]);
        look(ctx, session_id);
        progress::on_room_change(ctx, now, session_id);
        return Ok(());
    }

    let zone = target.zone();
    match ctx.zones.owner(&zone) {
        Some(owner) if owner != ctx.engine_id => {
            handoff::begin(ctx, now, session_id, target, owner).map_err(|e| e.to_owned())
        }
        _ => Err("The way is blocked.".to_owned()),
    }
}

fn say(ctx: &mut Context, session_id: SessionId, message: &str) -> Result<(), String> {
    if message.is_empty() {
        return Err("Say what?".to_owned());
    }
    let (room_id, name) = {
        let player = ctx
            .players
            .get(session_id)
            .ok_or_else(|| "You are not in the world.".to_owned())?;
        (player.room_id.clone(), player.name.to_string())
    };
    ctx.outbox
        .line(session_id, format!("You say, \"{}\"", message));
    ctx.broadcast(
        &room_id,
        &format!("{} says, \"{}\"", name, message),
        &[session_id],
    );
    Ok(())
}

fn tell(ctx: &mut Context, session_id: SessionId, rest: &str) -> Result<(), String> {
    let (target_name, message) = rest
        .split_once(char::is_whitespace)
        .map(|(n, m)| (n, m.trim()))
        .ok_or_else(|| "Tell whom what?".to_owned())?;
    if message.is_empty() {
        return Err("Tell whom what?".to_owned());
    }
    let from = ctx.players.name_of(session_id);

    if let Some(target) = ctx.players.find_by_name(target_name) {
        if target == session_id {
            return Err("You mutter to yourself.".to_owned());
        }
        let to = ctx.players.name_of(target);
        ctx.outbox
            .line(session_id, format!("You tell {}, \"{}\"", to, message));
        ctx.outbox
            .line(target, format!("{} tells you, \"{}\"", from, message));
        ctx.outbox.prompt(target);
        return Ok(());
    }

    // O(1) cross-engine routing through the player-location index.
    match ctx.location.lookup(target_name) {
        Some(engine) if engine != ctx.engine_id => {
            ctx.inter.send(InterEngineEvent::CrossEngineTell {
                target: engine,
                from_name: from,
                to_name: target_name.to_owned(),
                text: message.to_owned(),
            });
            ctx.outbox.line(
                session_id,
                format!("You tell {}, \"{}\"", target_name, message),
            );
            Ok(())
        }
        _ => Err("They are not online.".to_owned()),
    }
}

fn who(ctx: &mut Context, session_id: SessionId) {
    let mut entries: Vec<String> = ctx
        .players
        .iter()
        .map(|p| {
            let title = p
                .active_title
                .as_deref()
                .map(|t| format!(" {}", t))
                .unwrap_or_default();
            format!("  {}{} (level {} {:?})", p.name, title, p.level, p.class)
        })
        .collect();
    entries.sort();
    ctx.outbox
        .line(session_id, format!("Online ({}):", entries.len()));
    for entry in entries {
        ctx.outbox.line(session_id, entry);
    }
}

fn list_abilities(ctx: &mut Context, session_id: SessionId) {
    let Some(player) = ctx.players.get(session_id) else {
        return;
    };
    let class = player.class;
    let level = player.level;
    let lines: Vec<String> = ctx
        .content
        .abilities_for_class(class)
        .into_iter()
        .map(|a| {
            let gate = if a.min_level > level {
                format!(" (level {})", a.min_level)
            } else {
                String::new()
            };
            format!("  {} - {} mana{}", a.name, a.mana_cost, gate)
        })
        .collect();
    ctx.outbox.line(session_id, "You know:");
    for line in lines {
        ctx.outbox.line(session_id, line);
    }
}

fn group_command(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    rest: &str,
) -> Result<(), String> {
    let (sub, arg) = match rest.split_once(char::is_whitespace) {
        Some((sub, arg)) => (sub, arg.trim()),
        None => (rest, ""),
    };
    match sub.to_ascii_lowercase().as_str() {
        "invite" => group_invite(ctx, now, session_id, arg),
        "accept" => group_accept(ctx, now, session_id),
        "leave" => group_leave(ctx, session_id),
        "kick" => group_kick(ctx, session_id, arg),
        "tell" => group_tell(ctx, session_id, arg),
        "" | "list" => {
            group_list(ctx, session_id);
            Ok(())
        }
        _ => Err("Usage: group invite|accept|leave|kick|tell|list".to_owned()),
    }
}

fn group_invite(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    target_name: &str,
) -> Result<(), String> {
    if target_name.is_empty() {
        return Err("Invite whom?".to_owned());
    }
    let target = ctx
        .players
        .find_by_name(target_name)
        .ok_or_else(|| "They are not online.".to_owned())?;
    let same_room = {
        let me = ctx.players.get(session_id);
        let them = ctx.players.get(target);
        match (me, them) {
            (Some(a), Some(b)) => a.room_id == b.room_id,
            _ => false,
        }
    };
    if !same_room {
        return Err("They are not here.".to_owned());
    }
    let ttl = ctx.config.invite_ttl_ms;
    let max = ctx.config.max_group_size;
    ctx.groups
        .invite(now, session_id, target, ttl, max)
        .map_err(|e| e.to_owned())?;
    // Eager eviction alongside the lazy sweep.
    ctx.scheduler
        .schedule(now + ttl, ActionKind::ExpireInvite { invitee: target });

    let inviter_name = ctx.players.name_of(session_id);
    let invited_name = ctx.players.name_of(target);
    ctx.outbox
        .line(session_id, format!("You invite {} to your group.", invited_name));
    ctx.outbox.line(
        target,
        format!(
            "{} invites you to their group. Type 'group accept' to join.",
            inviter_name
        ),
    );
    ctx.outbox.prompt(target);
    Ok(())
}

fn group_accept(ctx: &mut Context, now: UnixTime, session_id: SessionId) -> Result<(), String> {
    let max = ctx.config.max_group_size;
    let (group_id, _) = ctx
        .groups
        .accept(now, session_id, max)
        .map_err(|e| e.to_owned())?;
    ctx.dirty.mark_group(group_id);
    let joiner = ctx.players.name_of(session_id);
    let members = ctx.groups.members_or_self(session_id);
    for member in members {
        if member == session_id {
            ctx.outbox.line(member, "You join the group.");
        } else {
            ctx.outbox
                .line(member, format!("{} joins your group.", joiner));
            ctx.outbox.prompt(member);
        }
    }
    Ok(())
}

fn group_leave(ctx: &mut Context, session_id: SessionId) -> Result<(), String> {
    let outcome = ctx
        .groups
        .leave(session_id)
        .ok_or_else(|| "You are not in a group.".to_owned())?;
    ctx.dirty.mark_group(outcome.group_id);
    ctx.outbox.line(session_id, "You leave the group.");
    let name = ctx.players.name_of(session_id);
    for member in &outcome.remaining {
        ctx.outbox
            .line(*member, format!("{} has left your group.", name));
        if outcome.disbanded {
            ctx.outbox.line(*member, "Your group has disbanded.");
        } else if outcome.new_leader == Some(*member) {
            ctx.outbox.line(*member, "You are now the group leader.");
        }
        ctx.outbox.prompt(*member);
    }
    Ok(())
}

fn group_kick(ctx: &mut Context, session_id: SessionId, target_name: &str) -> Result<(), String> {
    if target_name.is_empty() {
        return Err("Kick whom?".to_owned());
    }
    let target = ctx
        .players
        .find_by_name(target_name)
        .ok_or_else(|| "They are not online.".to_owned())?;
    let outcome = ctx
        .groups
        .kick(session_id, target)
        .map_err(|e| e.to_owned())?;
    ctx.dirty.mark_group(outcome.group_id);
    let kicked = ctx.players.name_of(target);
    ctx.outbox
        .line(target, "You have been kicked from the group.");
    ctx.outbox.prompt(target);
    ctx.outbox
        .line(session_id, format!("You kick {} from the group.", kicked));
    for member in &outcome.remaining {
        if *member != session_id {
            ctx.outbox
                .line(*member, format!("{} was kicked from the group.", kicked));
            ctx.outbox.prompt(*member);
        }
    }
    Ok(())
}

fn group_tell(ctx: &mut Context, session_id: SessionId, message: &str) -> Result<(), String> {
    if message.is_empty() {
        return Err("Tell your group what?".to_owned());
    }
    if ctx.groups.group_of(session_id).is_none() {
        return Err("You are not in a group.".to_owned());
    }
    let from = ctx.players.name_of(session_id);
    for member in ctx.groups.members_or_self(session_id) {
        if member == session_id {
            ctx.outbox
                .line(member, format!("You tell the group, \"{}\"", message));
        } else {
            ctx.outbox
                .line(member, format!("{} tells the group, \"{}\"", from, message));
            ctx.outbox.prompt(member);
        }
    }
    Ok(())
}

fn group_list(ctx: &mut Context, session_id: SessionId) {
    let Some(group_id) = ctx.groups.group_of(session_id) else {
        ctx.outbox.line(session_id, "You are not in a group.");
        return;
    };
    let Some(group) = ctx.groups.get(group_id) else {
        return;
    };
    let members = group.members.clone();
    ctx.outbox.line(session_id, "Your group:");
    for (i, member) in members.iter().enumerate() {
        let tag = if i == 0 { " (leader)" } else { "" };
        let line = match ctx.players.get(*member) {
            Some(p) => format!("  {}{} - {}/{} hp", p.name, tag, p.hp, p.max_hp),
            None => continue,
        };
        ctx.outbox.line(session_id, line);
    }
}

fn inventory(ctx: &mut Context, session_id: SessionId) {
    let carried = ctx.items.inventory(session_id);
    let equipped = ctx.items.equipped(session_id);

    ctx.outbox.line(session_id, "You are carrying:");
    if carried.is_empty() {
        ctx.outbox.line(session_id, "  nothing");
    }
    for item_id in carried {
        if let Some(name) = item_name(ctx, item_id) {
            ctx.outbox.line(session_id, format!("  {}", name));
        }
    }
    for (slot, item_id) in equipped {
        if let Some(name) = item_name(ctx, item_id) {
            ctx.outbox
                .line(session_id, format!("  {} ({:?})", name, slot));
        }
    }
}

fn item_name(ctx: &Context, item_id: core_protocol::id::ItemId) -> Option<String> {
    let item = ctx.items.get(item_id)?;
    ctx.content
        .item_templates
        .get(&item.template)
        .map(|t| t.name.clone())
}

fn get_item(ctx: &mut Context, session_id: SessionId, keyword: &str) -> Result<(), String> {
    if keyword.is_empty() {
        return Err("Get what?".to_owned());
    }
    let room_id = ctx
        .players
        .get(session_id)
        .map(|p| p.room_id.clone())
        .ok_or_else(|| "You are not in the world.".to_owned())?;
    let item_id = ctx
        .items
        .find_by_keyword(ctx.items.items_in_room(&room_id), keyword, &ctx.content)
        .ok_or_else(|| "You don't see that here.".to_owned())?;
    ctx.items
        .move_to(item_id, ItemLocation::Inventory(session_id))
        .map_err(|e| e.to_owned())?;
    let name = item_name(ctx, item_id).unwrap_or_else(|| "it".to_owned());
    let player_name = ctx.players.name_of(session_id);
    ctx.outbox
        .line(session_id, format!("You pick up {}.", name));
    ctx.broadcast(
        &room_id,
        &format!("{} picks up {}.", player_name, name),
        &[session_id],
    );
    Ok(())
}

fn drop_item(ctx: &mut Context, session_id: SessionId, keyword: &str) -> Result<(), String> {
    if keyword.is_empty() {
        return Err("Drop what?".to_owned());
    }
    let room_id = ctx
        .players
        .get(session_id)
        .map(|p| p.room_id.clone())
        .ok_or_else(|| "You are not in the world.".to_owned())?;
    let item_id = ctx
        .items
        .find_by_keyword(&ctx.items.inventory(session_id), keyword, &ctx.content)
        .ok_or_else(|| "You aren't carrying that.".to_owned())?;
    ctx.items
        .move_to(item_id, ItemLocation::Room(room_id.clone()))
        .map_err(|e| e.to_owned())?;
    let name = item_name(ctx, item_id).unwrap_or_else(|| "it".to_owned());
    let player_name = ctx.players.name_of(session_id);
    ctx.outbox.line(session_id, format!("You drop {}.", name));
    ctx.broadcast(
        &room_id,
        &format!("{} drops {}.", player_name, name),
        &[session_id],
    );
    Ok(())
}

fn equip_item(ctx: &mut Context, session_id: SessionId, keyword: &str) -> Result<(), String> {
    if keyword.is_empty() {
        return Err("Wear what?".to_owned());
    }
    let item_id = ctx
        .items
        .find_by_keyword(&ctx.items.inventory(session_id), keyword, &ctx.content)
        .ok_or_else(|| "You aren't carrying that.".to_owned())?;
    let slot = {
        let item = ctx.items.get(item_id).ok_or("You aren't carrying that.")?;
        ctx.content
            .item_templates
            .get(&item.template)
            .and_then(|t| t.slot)
            .ok_or_else(|| "You can't wear that.".to_owned())?
    };
    // Swap out whatever occupied the slot.
    if let Some(previous) = ctx.items.equipped_in_slot(session_id, slot) {
        ctx.items
            .move_to(previous, ItemLocation::Inventory(session_id))
            .map_err(|e| e.to_owned())?;
    }
    ctx.items
        .move_to(item_id, ItemLocation::Equipped(session_id, slot))
        .map_err(|e| e.to_owned())?;
    let name = item_name(ctx, item_id).unwrap_or_else(|| "it".to_owned());
    ctx.outbox.line(session_id, format!("You equip {}.", name));
    ctx.dirty.mark_status(session_id);
    Ok(())
}

fn unequip_item(ctx: &mut Context, session_id: SessionId, keyword: &str) -> Result<(), String> {
    if keyword.is_empty() {
        return Err("Remove what?".to_owned());
    }
    let equipped: Vec<_> = ctx
        .items
        .equipped(session_id)
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    let item_id = ctx
        .items
        .find_by_keyword(&equipped, keyword, &ctx.content)
        .ok_or_else(|| "You aren't wearing that.".to_owned())?;
    ctx.items
        .move_to(item_id, ItemLocation::Inventory(session_id))
        .map_err(|e| e.to_owned())?;
    let name = item_name(ctx, item_id).unwrap_or_else(|| "it".to_owned());
    ctx.outbox
        .line(session_id, format!("You remove {}.", name));
    ctx.dirty.mark_status(session_id);
    Ok(())
}

fn score(ctx: &mut Context, session_id: SessionId) {
    let Some(player) = ctx.players.get(session_id) else {
        return;
    };
    let equip = ctx.items.equip_stat_mods(session_id, &ctx.content);
    let status = ctx.status.player_stat_mods(session_id);
    let s = &player.base_stats;
    let line1 = format!(
        "{}{}, level {} {:?} {:?}",
        player.name,
        player
            .active_title
            .as_deref()
            .map(|t| format!(" {}", t))
            .unwrap_or_default(),
        player.level,
        player.race,
        player.class
    );
    let line2 = format!(
        "HP {}/{}  Mana {}/{}  Gold {}  XP {}",
        player.hp, player.max_hp, player.mana, player.max_mana, player.gold, player.xp_total
    );
    let line3 = format!(
        "Str {} Dex {} Con {} Int {} Wis {} Cha {}",
        s.strength as i32 + equip.strength + status.strength,
        s.dexterity as i32 + equip.dexterity + status.dexterity,
        s.constitution as i32 + equip.constitution + status.constitution,
        s.intelligence as i32 + equip.intelligence + status.intelligence,
        s.wisdom as i32 + equip.wisdom + status.wisdom,
        s.charisma as i32 + equip.charisma + status.charisma,
    );
    ctx.outbox.line(session_id, line1);
    ctx.outbox.line(session_id, line2);
    ctx.outbox.line(session_id, line3);
}

fn quests(ctx: &mut Context, session_id: SessionId) {
    let Some(player) = ctx.players.get(session_id) else {
        return;
    };
    let mut lines = vec!["Quests:".to_owned()];
    for (quest_id, progress) in &player.active_quests {
        if let Some(def) = ctx.content.quests.get(quest_id) {
            lines.push(format!("  {} ({} so far)", def.name, progress));
        }
    }
    for quest_id in &player.completed_quests {
        if let Some(def) = ctx.content.quests.get(quest_id) {
            lines.push(format!("  {} (complete)", def.name));
        }
    }
    if lines.len() == 1 {
        lines.push("  none underway".to_owned());
    }
    for line in lines {
        ctx.outbox.line(session_id, line);
    }
}

fn ansi(ctx: &mut Context, session_id: SessionId, arg: &str) -> Result<(), String> {
    let enabled = match arg.to_ascii_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => return Err("Usage: ansi on|off".to_owned()),
    };
    if let Some(player) = ctx.players.get_mut(session_id) {
        player.ansi_enabled = enabled;
    }
    ctx.outbox.send(OutboundEvent::SetAnsi {
        session_id,
        enabled,
    });
    ctx.outbox.line(
        session_id,
        if enabled {
            "Color enabled."
        } else {
            "Color disabled."
        },
    );
    Ok(())
}

/// Staff teleport, mostly for operating and testing live worlds.
fn goto(
    ctx: &mut Context,
    now: UnixTime,
    session_id: SessionId,
    target: &str,
) -> Result<(), String> {
    let is_staff = ctx
        .players
        .get(session_id)
        .map(|p| p.is_staff)
        .unwrap_or(false);
    if !is_staff {
        return Err("Huh?".to_owned());
    }
    let room_id = RoomId::parse(target).ok_or_else(|| "Rooms look like zone:name.".to_owned())?;
    if ctx.room(&room_id).is_none() {
        return Err("No such room here.".to_owned());
    }
    let (old_room, name) = {
        let player = ctx
            .players
            .get(session_id)
            .ok_or_else(|| "You are not in the world.".to_owned())?;
        (player.room_id.clone(), player.name.to_string())
    };
    ctx.broadcast(&old_room, &format!("{} vanishes.", name), &[session_id]);
    ctx.players
        .move_to(session_id, room_id.clone())
        .map_err(|e| e.to_owned())?;
    ctx.broadcast(&room_id, &format!("{} appears.", name), &[session_id]);
    look(ctx, session_id);
    progress::on_room_change(ctx, now, session_id);
    Ok(())
}
