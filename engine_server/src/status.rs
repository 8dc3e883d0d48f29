// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::dto::StatMods;
use core_protocol::id::{EffectId, MobId, SessionId};
use core_protocol::UnixTime;
use std::collections::HashMap;
use world::templates::{EffectDef, EffectKind};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum EffectTarget {
    Player(SessionId),
    Mob(MobId),
}

#[derive(Clone, Debug)]
pub struct ActiveEffect {
    pub def_id: EffectId,
    pub name: String,
    pub kind: EffectKind,
    pub expires_at: UnixTime,
    pub next_tick_at: Option<UnixTime>,
    tick_interval_ms: Option<u64>,
    pub stacks: u32,
    /// Per-tick amount for DOT/HOT; initial pool for shields.
    pub magnitude: i32,
    pub remaining_absorb: i32,
    pub stat_mods: StatMods,
    /// Who applied it; DOT damage credits threat to this session.
    pub caster: Option<SessionId>,
}

/// One DOT/HOT application owed this tick. Damage and healing are applied by
/// the combat module so threat and death handling stay uniform.
#[derive(Clone, Debug)]
pub struct PeriodicTick {
    pub target: EffectTarget,
    pub def_id: EffectId,
    pub kind: EffectKind,
    pub amount: i32,
    pub caster: Option<SessionId>,
}

#[derive(Clone, Debug)]
pub struct ExpiredEffect {
    pub target: EffectTarget,
    pub name: String,
    pub kind: EffectKind,
}

#[derive(Debug)]
pub struct AbsorbResult {
    pub after: i32,
    pub absorbed: i32,
    /// Names of shields whose pool was exhausted by this hit.
    pub broken: Vec<String>,
}

/// Active status effects with cached per-player aggregates, so stat reads
/// and stack snapshots cost O(1) per query instead of a rescan.
#[derive(Default)]
pub struct StatusRepo {
    player_effects: HashMap<SessionId, Vec<ActiveEffect>>,
    mob_effects: HashMap<MobId, Vec<ActiveEffect>>,
    player_stacks: HashMap<SessionId, HashMap<EffectId, u32>>,
    player_stat_mods: HashMap<SessionId, StatMods>,
}

fn negate(mods: StatMods) -> StatMods {
    StatMods {
        strength: -mods.strength,
        dexterity: -mods.dexterity,
        constitution: -mods.constitution,
        intelligence: -mods.intelligence,
        wisdom: -mods.wisdom,
        charisma: -mods.charisma,
    }
}

fn make_effect(now: UnixTime, def: &EffectDef, caster: Option<SessionId>) -> ActiveEffect {
    ActiveEffect {
        def_id: def.id.clone(),
        name: def.name.clone(),
        kind: def.kind,
        expires_at: now + def.duration_ms,
        next_tick_at: def.tick_interval_ms.map(|i| now + i),
        tick_interval_ms: def.tick_interval_ms,
        stacks: 1,
        magnitude: def.magnitude,
        remaining_absorb: if def.kind == EffectKind::Shield {
            def.magnitude
        } else {
            0
        },
        stat_mods: def.stat_mods,
        caster,
    }
}

impl StatusRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies or stacks an effect on a player. Re-application refreshes the
    /// duration; stacks cap at the definition's max; a shield's pool refills.
    pub fn apply_to_player(
        &mut self,
        now: UnixTime,
        session_id: SessionId,
        def: &EffectDef,
        caster: Option<SessionId>,
    ) -> u32 {
        let effects = self.player_effects.entry(session_id).or_default();
        let stacks = if let Some(existing) = effects.iter_mut().find(|e| e.def_id == def.id) {
            existing.expires_at = now + def.duration_ms;
            if existing.stacks < def.max_stacks {
                existing.stacks += 1;
                self.player_stat_mods
                    .entry(session_id)
                    .or_default()
                    .add(def.stat_mods);
            }
            if def.kind == EffectKind::Shield {
                existing.remaining_absorb = def.magnitude;
            }
            existing.stacks
        } else {
            effects.push(make_effect(now, def, caster));
            self.player_stat_mods
                .entry(session_id)
                .or_default()
                .add(def.stat_mods);
            1
        };
        self.player_stacks
            .entry(session_id)
            .or_default()
            .insert(def.id.clone(), stacks);
        stacks
    }

    pub fn apply_to_mob(
        &mut self,
        now: UnixTime,
        mob_id: &MobId,
        def: &EffectDef,
        caster: Option<SessionId>,
    ) -> u32 {
        let effects = self.mob_effects.entry(mob_id.clone()).or_default();
        if let Some(existing) = effects.iter_mut().find(|e| e.def_id == def.id) {
            existing.expires_at = now + def.duration_ms;
            if existing.stacks < def.max_stacks {
                existing.stacks += 1;
            }
            existing.stacks
        } else {
            effects.push(make_effect(now, def, caster));
            1
        }
    }

    pub fn has_player_effect(&self, session_id: SessionId, kind: EffectKind) -> bool {
        self.player_effects
            .get(&session_id)
            .map(|effects| effects.iter().any(|e| e.kind == kind))
            .unwrap_or(false)
    }

    pub fn has_mob_effect(&self, mob_id: &MobId, kind: EffectKind) -> bool {
        self.mob_effects
            .get(mob_id)
            .map(|effects| effects.iter().any(|e| e.kind == kind))
            .unwrap_or(false)
    }

    /// Cached aggregate of every active effect's stat mods for the player.
    pub fn player_stat_mods(&self, session_id: SessionId) -> StatMods {
        self.player_stat_mods
            .get(&session_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn stacks_snapshot(&self, session_id: SessionId) -> HashMap<String, u32> {
        self.player_stacks
            .get(&session_id)
            .map(|stacks| {
                stacks
                    .iter()
                    .map(|(id, n)| (id.as_str().to_owned(), *n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes every effect past its deadline and reports them for
    /// narration. Shields also die here if a hit drained them earlier.
    pub fn expire_due(&mut self, now: UnixTime) -> Vec<ExpiredEffect> {
        let mut expired = Vec::new();

        let stacks_index = &mut self.player_stacks;
        let mods_index = &mut self.player_stat_mods;
        self.player_effects.retain(|session_id, effects| {
            effects.retain(|effect| {
                let done = effect.expires_at <= now
                    || (effect.kind == EffectKind::Shield && effect.remaining_absorb <= 0);
                if done {
                    if let Some(stacks) = stacks_index.get_mut(session_id) {
                        stacks.remove(&effect.def_id);
                        if stacks.is_empty() {
                            stacks_index.remove(session_id);
                        }
                    }
                    if let Some(mods) = mods_index.get_mut(session_id) {
                        for _ in 0..effect.stacks {
                            mods.add(negate(effect.stat_mods));
                        }
                    }
                    expired.push(ExpiredEffect {
                        target: EffectTarget::Player(*session_id),
                        name: effect.name.clone(),
                        kind: effect.kind,
                    });
                }
                !done
            });
            !effects.is_empty()
        });

        self.mob_effects.retain(|mob_id, effects| {
            effects.retain(|effect| {
                let done = effect.expires_at <= now;
                if done {
                    expired.push(ExpiredEffect {
                        target: EffectTarget::Mob(mob_id.clone()),
                        name: effect.name.clone(),
                        kind: effect.kind,
                    });
                }
                !done
            });
            !effects.is_empty()
        });

        expired
    }

    /// DOT/HOT applications due this tick. Amount scales with stacks.
    pub fn due_periodics(&mut self, now: UnixTime) -> Vec<PeriodicTick> {
        let mut due = Vec::new();
        for (session_id, effects) in &mut self.player_effects {
            for effect in effects.iter_mut() {
                while let Some(at) = effect.next_tick_at {
                    if at > now {
                        break;
                    }
                    effect.next_tick_at =
                        effect.tick_interval_ms.map(|i| at + i);
                    due.push(PeriodicTick {
                        target: EffectTarget::Player(*session_id),
                        def_id: effect.def_id.clone(),
                        kind: effect.kind,
                        amount: effect.magnitude * effect.stacks as i32,
                        caster: effect.caster,
                    });
                }
            }
        }
        for (mob_id, effects) in &mut self.mob_effects {
            for effect in effects.iter_mut() {
                while let Some(at) = effect.next_tick_at {
                    if at > now {
                        break;
                    }
                    effect.next_tick_at =
                        effect.tick_interval_ms.map(|i| at + i);
                    due.push(PeriodicTick {
                        target: EffectTarget::Mob(mob_id.clone()),
                        def_id: effect.def_id.clone(),
                        kind: effect.kind,
                        amount: effect.magnitude * effect.stacks as i32,
                        caster: effect.caster,
                    });
                }
            }
        }
        due
    }

    /// Runs incoming damage through the player's shields, oldest first.
    /// Exhausted shields are reported and removed at the next expiry sweep.
    pub fn absorb_player_damage(&mut self, session_id: SessionId, amount: i32) -> AbsorbResult {
        let mut remaining = amount;
        let mut absorbed = 0;
        let mut broken = Vec::new();
        if let Some(effects) = self.player_effects.get_mut(&session_id) {
            for effect in effects
                .iter_mut()
                .filter(|e| e.kind == EffectKind::Shield && e.remaining_absorb > 0)
            {
                if remaining <= 0 {
                    break;
                }
                let soak = remaining.min(effect.remaining_absorb);
                effect.remaining_absorb -= soak;
                remaining -= soak;
                absorbed += soak;
                if effect.remaining_absorb == 0 {
                    broken.push(effect.name.clone());
                }
            }
        }
        AbsorbResult {
            after: remaining,
            absorbed,
            broken,
        }
    }

    pub fn clear_player(&mut self, session_id: SessionId) {
        self.player_effects.remove(&session_id);
        self.player_stacks.remove(&session_id);
        self.player_stat_mods.remove(&session_id);
    }

    pub fn clear_mob(&mut self, mob_id: &MobId) {
        self.mob_effects.remove(mob_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::session;
    use world::source::demo_world;

    fn def(world: &world::source::WorldContent, key: &str) -> EffectDef {
        world.effects.get(&EffectId::new(key)).unwrap().clone()
    }

    #[test]
    fn stat_mods_track_stacks_and_expiry() {
        let content = demo_world();
        let fury = def(&content, "battle-fury");
        let mut repo = StatusRepo::new();

        repo.apply_to_player(1_000, session(1), &fury, None);
        assert_eq!(repo.player_stat_mods(session(1)).strength, 4);

        // max_stacks = 1: re-apply refreshes but does not stack mods.
        repo.apply_to_player(2_000, session(1), &fury, None);
        assert_eq!(repo.player_stat_mods(session(1)).strength, 4);

        let expired = repo.expire_due(2_000 + fury.duration_ms);
        assert_eq!(expired.len(), 1);
        assert_eq!(repo.player_stat_mods(session(1)).strength, 0);
        assert!(repo.stacks_snapshot(session(1)).is_empty());
    }

    #[test]
    fn dot_stacks_scale_periodic_amount() {
        let content = demo_world();
        let bleed = def(&content, "bleed");
        let mut repo = StatusRepo::new();
        let rat = MobId::new("hub", "rat", 1);

        repo.apply_to_mob(0, &rat, &bleed, Some(session(1)));
        repo.apply_to_mob(0, &rat, &bleed, Some(session(1)));

        let due = repo.due_periodics(3_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].amount, 4);
        assert_eq!(due[0].caster, Some(session(1)));
        // Next application only after another interval.
        assert!(repo.due_periodics(3_100).is_empty());
    }

    #[test]
    fn shield_absorbs_then_breaks() {
        let content = demo_world();
        let ward = def(&content, "ward");
        let mut repo = StatusRepo::new();

        repo.apply_to_player(0, session(1), &ward, Some(session(2)));
        let result = repo.absorb_player_damage(session(1), 5);
        assert_eq!((result.after, result.absorbed), (0, 5));
        assert!(result.broken.is_empty());

        let result = repo.absorb_player_damage(session(1), 10);
        assert_eq!((result.after, result.absorbed), (3, 7));
        assert_eq!(result.broken, vec!["Ward".to_owned()]);

        // Exhausted pool expires on the next sweep even before the deadline.
        let expired = repo.expire_due(1);
        assert_eq!(expired.len(), 1);
        assert!(!repo.has_player_effect(session(1), EffectKind::Shield));
    }

    #[test]
    fn stun_queries() {
        let content = demo_world();
        let daze = def(&content, "daze");
        let mut repo = StatusRepo::new();
        repo.apply_to_player(0, session(1), &daze, None);
        assert!(repo.has_player_effect(session(1), EffectKind::Stun));
        repo.expire_due(2_001);
        assert!(!repo.has_player_effect(session(1), EffectKind::Stun));
    }
}
