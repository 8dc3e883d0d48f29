// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::dto::{EquipSlot, PlayerClass, Race, StatBlock, StatMods};
use core_protocol::id::{AbilityId, AchievementId, EffectId, QuestId, RoomId, TemplateKey};
use serde::{Deserialize, Serialize};

/// One possible corpse drop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropEntry {
    pub template: TemplateKey,
    /// Probability in [0, 1], rolled independently per entry.
    pub chance: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MobTemplate {
    pub key: TemplateKey,
    pub name: String,
    pub hp: i32,
    pub min_damage: i32,
    pub max_damage: i32,
    pub armor: i32,
    pub xp_reward: u64,
    pub gold_min: u64,
    pub gold_max: u64,
    pub drops: Vec<DropEntry>,
    /// Quests that count kills of this mob.
    pub quest_ids: Vec<QuestId>,
    /// Key into the external behavior-tree library, if any.
    pub behavior: Option<String>,
    pub respawn_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemTemplate {
    pub key: TemplateKey,
    pub name: String,
    pub slot: Option<EquipSlot>,
    pub attack_bonus: i32,
    pub armor_bonus: i32,
    pub stat_mods: StatMods,
    pub value: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TargetRule {
    SelfOnly,
    Enemy,
    /// Empty keyword targets self; otherwise a same-room groupmate.
    Ally,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AbilityEffect {
    Damage { amount: i32 },
    Heal { amount: i32 },
    ApplyEffect { effect: EffectId },
    /// Hits every mob in the caster's room already fighting the group.
    AreaDamage { amount: i32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbilityDef {
    pub id: AbilityId,
    pub name: String,
    pub class: PlayerClass,
    pub min_level: u32,
    pub mana_cost: i32,
    pub cooldown_ms: u64,
    pub target: TargetRule,
    pub effect: AbilityEffect,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EffectKind {
    Dot,
    Hot,
    StatBuff,
    StatDebuff,
    Stun,
    Root,
    Shield,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EffectDef {
    pub id: EffectId,
    pub name: String,
    pub kind: EffectKind,
    pub duration_ms: u64,
    /// For DOT/HOT: how often the magnitude is applied.
    pub tick_interval_ms: Option<u64>,
    /// Damage per tick, heal per tick, or shield absorb pool.
    pub magnitude: i32,
    pub max_stacks: u32,
    pub stat_mods: StatMods,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QuestGoal {
    KillCount { template: TemplateKey, count: u32 },
    VisitRoom { room: RoomId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestDef {
    pub id: QuestId,
    pub name: String,
    pub goal: QuestGoal,
    pub xp_reward: u64,
    pub gold_reward: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AchievementGoal {
    TotalKills { count: u64 },
    ReachLevel { level: u32 },
    QuestsCompleted { count: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AchievementDef {
    pub id: AchievementId,
    pub name: String,
    pub goal: AchievementGoal,
    /// Title granted on unlock, if any.
    pub title: Option<String>,
}

/// Rules tables that are code, not content.
pub mod rules {
    use super::*;

    /// Total XP required to have reached `level`.
    pub fn xp_for_level(level: u32) -> u64 {
        // Quadratic curve; level 1 is free.
        let l = level.saturating_sub(1) as u64;
        l * l * 100
    }

    pub fn level_for_xp(xp_total: u64) -> u32 {
        let mut level = 1;
        while xp_for_level(level + 1) <= xp_total {
            level += 1;
        }
        level
    }

    pub fn max_hp_for(class: PlayerClass, constitution: u16, level: u32) -> i32 {
        let base = match class {
            PlayerClass::Warrior => 30,
            PlayerClass::Cleric => 24,
            PlayerClass::Rogue => 22,
            PlayerClass::Mage => 18,
        };
        base + constitution as i32 * 2 + (level as i32 - 1) * 5
    }

    pub fn max_mana_for(class: PlayerClass, intelligence: u16, wisdom: u16, level: u32) -> i32 {
        let base = match class {
            PlayerClass::Mage => 30,
            PlayerClass::Cleric => 26,
            PlayerClass::Rogue => 10,
            PlayerClass::Warrior => 8,
        };
        base + (intelligence + wisdom) as i32 + (level as i32 - 1) * 3
    }

    pub fn starting_stats(race: Race, class: PlayerClass) -> StatBlock {
        let mut stats = StatBlock {
            strength: 10,
            dexterity: 10,
            constitution: 10,
            intelligence: 10,
            wisdom: 10,
            charisma: 10,
        };
        match race {
            Race::Human => stats.charisma += 2,
            Race::Elf => {
                stats.dexterity += 2;
                stats.intelligence += 1;
                stats.constitution -= 1;
            }
            Race::Dwarf => {
                stats.constitution += 2;
                stats.wisdom += 1;
                stats.dexterity -= 1;
            }
            Race::Orc => {
                stats.strength += 2;
                stats.constitution += 1;
                stats.intelligence -= 1;
            }
        }
        match class {
            PlayerClass::Warrior => stats.strength += 2,
            PlayerClass::Cleric => stats.wisdom += 2,
            PlayerClass::Mage => stats.intelligence += 2,
            PlayerClass::Rogue => stats.dexterity += 2,
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::rules;
    use core_protocol::dto::{PlayerClass, Race};

    #[test]
    fn xp_curve_inverts() {
        for level in 1..30 {
            let xp = rules::xp_for_level(level);
            assert_eq!(rules::level_for_xp(xp), level);
            if level > 1 {
                assert_eq!(rules::level_for_xp(xp - 1), level - 1);
            }
        }
    }

    #[test]
    fn starting_stats_apply_both_tables() {
        let stats = rules::starting_stats(Race::Orc, PlayerClass::Warrior);
        assert_eq!(stats.strength, 14);
        assert_eq!(stats.intelligence, 9);
    }

    #[test]
    fn warrior_outlasts_mage() {
        assert!(
            rules::max_hp_for(PlayerClass::Warrior, 10, 1)
                > rules::max_hp_for(PlayerClass::Mage, 10, 1)
        );
    }
}
