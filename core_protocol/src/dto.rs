// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::id::{
    AchievementId, EngineId, GroupId, MobId, PlayerId, QuestId, RoomId, SessionId, TemplateKey,
};
use crate::name::PlayerName;
use crate::UnixTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Character classes, a fixed rules table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PlayerClass {
    Warrior,
    Cleric,
    Mage,
    Rogue,
}

impl PlayerClass {
    /// Warriors generate extra threat per point of damage.
    pub fn threat_multiplier(self) -> f64 {
        match self {
            Self::Warrior => 1.5,
            _ => 1.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Race {
    Human,
    Elf,
    Dwarf,
    Orc,
}

/// The six base attributes. Stored unsigned; buffs/debuffs apply as signed
/// deltas via [`StatMods`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatBlock {
    pub strength: u16,
    pub dexterity: u16,
    pub constitution: u16,
    pub intelligence: u16,
    pub wisdom: u16,
    pub charisma: u16,
}

/// Signed stat deltas from equipment or status effects.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatMods {
    pub strength: i32,
    pub dexterity: i32,
    pub constitution: i32,
    pub intelligence: i32,
    pub wisdom: i32,
    pub charisma: i32,
}

impl StatMods {
    pub fn add(&mut self, other: StatMods) {
        self.strength += other.strength;
        self.dexterity += other.dexterity;
        self.constitution += other.constitution;
        self.intelligence += other.intelligence;
        self.wisdom += other.wisdom;
        self.charisma += other.charisma;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EquipSlot {
    Weapon,
    Head,
    Chest,
    Legs,
    Hands,
    Feet,
    Ring,
    Amulet,
}

/// Vitals pushed to a session whose own numbers changed this tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlayerVitalsDto {
    pub hp: i32,
    pub max_hp: i32,
    pub mana: i32,
    pub max_mana: i32,
}

/// Mob health broadcast to watchers in the mob's room.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MobHpDto {
    pub mob_id: MobId,
    pub name: String,
    pub hp: i32,
    pub max_hp: i32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoomOccupantsDto {
    pub room_id: RoomId,
    pub players: Vec<String>,
    pub mobs: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupInfoDto {
    pub group_id: GroupId,
    pub leader: String,
    pub members: Vec<String>,
}

/// Active status effects and stack counts for one target.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EffectStacksDto {
    pub stacks: HashMap<String, u32>,
}

/// Persisted player record, as exchanged with the persistence collaborator
/// and carried inside handoff state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecordDto {
    pub player_id: PlayerId,
    pub name: PlayerName,
    pub room_id: RoomId,
    pub race: Race,
    pub class: PlayerClass,
    pub level: u32,
    pub xp_total: u64,
    pub gold: u64,
    pub base_stats: StatBlock,
    pub is_staff: bool,
    pub completed_quests: Vec<QuestId>,
    pub unlocked_achievements: Vec<AchievementId>,
    pub active_title: Option<String>,
    pub last_seen: UnixTime,
}

/// One carried item inside a handoff blob.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CarriedItemDto {
    pub template: TemplateKey,
    pub equipped: Option<EquipSlot>,
}

/// Everything the receiving engine needs to reconstruct a live player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandoffStateDto {
    pub record: PlayerRecordDto,
    pub hp: i32,
    pub max_hp: i32,
    pub mana: i32,
    pub max_mana: i32,
    pub ansi_enabled: bool,
    pub inventory: Vec<CarriedItemDto>,
    pub quest_progress: HashMap<QuestId, u32>,
    pub achievement_progress: HashMap<AchievementId, u64>,
}

/// Wire form of a handoff ticket. The full phase machine lives engine-side;
/// only PREPARE crosses the bus with the state blob attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandoffTicketDto {
    pub session_id: SessionId,
    pub player_id: PlayerId,
    pub from: EngineId,
    pub to: EngineId,
    pub target_room: RoomId,
    /// Bincode-encoded [`HandoffStateDto`].
    pub state: Vec<u8>,
    pub created_at: UnixTime,
}
