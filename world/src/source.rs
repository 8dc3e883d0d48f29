// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::room::{Direction, Feature, Room};
use crate::templates::{
    AbilityDef, AbilityEffect, AchievementDef, AchievementGoal, DropEntry, EffectDef, EffectKind,
    ItemTemplate, MobTemplate, QuestDef, QuestGoal, TargetRule,
};
use core_protocol::dto::{EquipSlot, PlayerClass, StatMods};
use core_protocol::id::{
    AbilityId, AchievementId, EffectId, QuestId, RoomId, TemplateKey, ZoneId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where and how many mobs a zone keeps alive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpawnDef {
    pub room: RoomId,
    pub template: TemplateKey,
    pub count: u32,
}

/// Everything a loader produces. Immutable after startup.
#[derive(Clone, Debug, Default)]
pub struct WorldContent {
    pub rooms: HashMap<RoomId, Room>,
    pub spawns: Vec<SpawnDef>,
    pub mob_templates: HashMap<TemplateKey, MobTemplate>,
    pub item_templates: HashMap<TemplateKey, ItemTemplate>,
    pub abilities: HashMap<AbilityId, AbilityDef>,
    pub effects: HashMap<EffectId, EffectDef>,
    pub quests: HashMap<QuestId, QuestDef>,
    pub achievements: HashMap<AchievementId, AchievementDef>,
    pub starting_room: Option<RoomId>,
}

impl WorldContent {
    pub fn zones(&self) -> Vec<ZoneId> {
        let mut zones: Vec<ZoneId> = self.rooms.keys().map(|r| r.zone()).collect();
        zones.sort();
        zones.dedup();
        zones
    }

    /// The subset of content belonging to one zone, for zone-sharded engines.
    pub fn restricted_to(&self, zones: &[ZoneId]) -> WorldContent {
        let keep = |room: &RoomId| zones.iter().any(|z| room.zone_str() == z.as_str());
        WorldContent {
            rooms: self
                .rooms
                .iter()
                .filter(|(id, _)| keep(id))
                .map(|(id, room)| (id.clone(), room.clone()))
                .collect(),
            spawns: self
                .spawns
                .iter()
                .filter(|s| keep(&s.room))
                .cloned()
                .collect(),
            mob_templates: self.mob_templates.clone(),
            item_templates: self.item_templates.clone(),
            abilities: self.abilities.clone(),
            effects: self.effects.clone(),
            quests: self.quests.clone(),
            achievements: self.achievements.clone(),
            starting_room: self
                .starting_room
                .clone()
                .filter(|room| keep(room)),
        }
    }

    pub fn abilities_for_class(&self, class: PlayerClass) -> Vec<&AbilityDef> {
        let mut list: Vec<&AbilityDef> =
            self.abilities.values().filter(|a| a.class == class).collect();
        list.sort_by(|a, b| a.min_level.cmp(&b.min_level).then(a.name.cmp(&b.name)));
        list
    }
}

#[derive(Debug)]
pub enum ContentError {
    /// The loader found no rooms, or no starting room.
    Empty,
    /// An exit, spawn, or drop references something undefined.
    DanglingReference(String),
}

/// Boundary for the external YAML loader; the engine only sees this trait.
pub trait WorldSource {
    fn load(&self) -> Result<WorldContent, ContentError>;
}

/// Flat file form of the content, for the built-in JSON loader. The YAML
/// content pipeline is a separate collaborator that emits the same shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorldFile {
    pub rooms: Vec<Room>,
    pub spawns: Vec<SpawnDef>,
    pub mob_templates: Vec<MobTemplate>,
    pub item_templates: Vec<ItemTemplate>,
    pub abilities: Vec<AbilityDef>,
    pub effects: Vec<EffectDef>,
    pub quests: Vec<QuestDef>,
    pub achievements: Vec<AchievementDef>,
    pub starting_room: Option<RoomId>,
}

impl From<WorldFile> for WorldContent {
    fn from(file: WorldFile) -> Self {
        WorldContent {
            rooms: file.rooms.into_iter().map(|r| (r.id.clone(), r)).collect(),
            spawns: file.spawns,
            mob_templates: file
                .mob_templates
                .into_iter()
                .map(|t| (t.key.clone(), t))
                .collect(),
            item_templates: file
                .item_templates
                .into_iter()
                .map(|t| (t.key.clone(), t))
                .collect(),
            abilities: file
                .abilities
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            effects: file.effects.into_iter().map(|e| (e.id.clone(), e)).collect(),
            quests: file.quests.into_iter().map(|q| (q.id.clone(), q)).collect(),
            achievements: file
                .achievements
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            starting_room: file.starting_room,
        }
    }
}

/// Loads `world.json` from a content root.
pub struct JsonWorldSource {
    pub root: std::path::PathBuf,
}

impl WorldSource for JsonWorldSource {
    fn load(&self) -> Result<WorldContent, ContentError> {
        let path = self.root.join("world.json");
        let bytes = std::fs::read(&path)
            .map_err(|e| ContentError::DanglingReference(format!("{}: {}", path.display(), e)))?;
        let file: WorldFile = serde_json::from_slice(&bytes)
            .map_err(|e| ContentError::DanglingReference(format!("{}: {}", path.display(), e)))?;
        let content = WorldContent::from(file);
        validate(&content)?;
        Ok(content)
    }
}

/// Validates cross-references so a bad loader fails at startup, not mid-tick.
pub fn validate(content: &WorldContent) -> Result<(), ContentError> {
    if content.rooms.is_empty() || content.starting_room.is_none() {
        return Err(ContentError::Empty);
    }
    for room in content.rooms.values() {
        for target in room.exits.values() {
            if !content.rooms.contains_key(target) {
                return Err(ContentError::DanglingReference(format!(
                    "{} -> {}",
                    room.id, target
                )));
            }
        }
    }
    for spawn in &content.spawns {
        if !content.mob_templates.contains_key(&spawn.template) {
            return Err(ContentError::DanglingReference(format!(
                "spawn {}",
                spawn.template.as_str()
            )));
        }
    }
    for template in content.mob_templates.values() {
        for drop in &template.drops {
            if !content.item_templates.contains_key(&drop.template) {
                return Err(ContentError::DanglingReference(format!(
                    "drop {}",
                    drop.template.as_str()
                )));
            }
        }
    }
    Ok(())
}

/// Built-in two-zone world used by tests and the default standalone run.
/// The hub/forest boundary exists specifically so cross-zone movement is
/// exercisable without content files.
pub fn demo_world() -> WorldContent {
    let mut content = WorldContent::default();

    let plaza = RoomId::new("hub", "plaza");
    let gate = RoomId::new("hub", "gate");
    let cellar = RoomId::new("hub", "cellar");
    let edge = RoomId::new("forest", "edge");
    let clearing = RoomId::new("forest", "clearing");

    let mut room = Room::new(
        plaza.clone(),
        "Hub Plaza",
        "Cobblestones radiate from a dry fountain. Travelers haggle in every direction.",
    );
    room.exits.insert(Direction::North, gate.clone());
    room.exits.insert(Direction::Down, cellar.clone());
    room.features.push(Feature::Sign {
        name: "notice board".to_owned(),
        text: "Rats in the cellar. Reward for culling.".to_owned(),
    });
    content.rooms.insert(plaza.clone(), room);

    let mut room = Room::new(
        gate.clone(),
        "North Gate",
        "The city wall looms overhead. Beyond the arch, a forest track disappears north.",
    );
    room.exits.insert(Direction::South, plaza.clone());
    room.remote_exits.insert(Direction::North, edge.clone());
    content.rooms.insert(gate.clone(), room);

    let mut room = Room::new(
        cellar.clone(),
        "Fountain Cellar",
        "A low vault under the plaza. Something skitters behind the barrels.",
    );
    room.exits.insert(Direction::Up, plaza.clone());
    content.rooms.insert(cellar.clone(), room);

    let mut room = Room::new(
        edge.clone(),
        "Forest Edge",
        "Saplings give way to old growth. The city is a rumor behind you.",
    );
    room.exits.insert(Direction::East, clearing.clone());
    room.remote_exits.insert(Direction::South, gate.clone());
    content.rooms.insert(edge.clone(), room);

    let mut room = Room::new(
        clearing.clone(),
        "Mossy Clearing",
        "Flattened grass and old bones. Things hunt here.",
    );
    room.exits.insert(Direction::West, edge.clone());
    content.rooms.insert(clearing.clone(), room);

    content.starting_room = Some(plaza.clone());

    let sword = TemplateKey::new("rusty-sword");
    let cap = TemplateKey::new("leather-cap");
    let pelt = TemplateKey::new("wolf-pelt");

    content.item_templates.insert(
        sword.clone(),
        ItemTemplate {
            key: sword.clone(),
            name: "a rusty sword".to_owned(),
            slot: Some(EquipSlot::Weapon),
            attack_bonus: 2,
            armor_bonus: 0,
            stat_mods: StatMods::default(),
            value: 5,
        },
    );
    content.item_templates.insert(
        cap.clone(),
        ItemTemplate {
            key: cap.clone(),
            name: "a leather cap".to_owned(),
            slot: Some(EquipSlot::Head),
            attack_bonus: 0,
            armor_bonus: 1,
            stat_mods: StatMods {
                dexterity: 1,
                ..Default::default()
            },
            value: 3,
        },
    );
    content.item_templates.insert(
        pelt.clone(),
        ItemTemplate {
            key: pelt.clone(),
            name: "a wolf pelt".to_owned(),
            slot: None,
            attack_bonus: 0,
            armor_bonus: 0,
            stat_mods: StatMods::default(),
            value: 8,
        },
    );

    let rat = TemplateKey::new("cellar-rat");
    let wolf = TemplateKey::new("grey-wolf");
    let rat_cull = QuestId::new("rat-cull");
    let scout = QuestId::new("scout-the-forest");

    content.mob_templates.insert(
        rat.clone(),
        MobTemplate {
            key: rat.clone(),
            name: "a cellar rat".to_owned(),
            hp: 3,
            min_damage: 1,
            max_damage: 1,
            armor: 0,
            xp_reward: 100,
            gold_min: 0,
            gold_max: 2,
            drops: vec![DropEntry {
                template: cap.clone(),
                chance: 0.25,
            }],
            quest_ids: vec![rat_cull.clone()],
            behavior: None,
            respawn_ms: 30_000,
        },
    );
    content.mob_templates.insert(
        wolf.clone(),
        MobTemplate {
            key: wolf.clone(),
            name: "a grey wolf".to_owned(),
            hp: 20,
            min_damage: 2,
            max_damage: 5,
            armor: 1,
            xp_reward: 250,
            gold_min: 1,
            gold_max: 6,
            drops: vec![DropEntry {
                template: pelt.clone(),
                chance: 0.8,
            }],
            quest_ids: vec![],
            behavior: Some("skirmisher".to_owned()),
            respawn_ms: 45_000,
        },
    );

    content.spawns.push(SpawnDef {
        room: cellar.clone(),
        template: rat.clone(),
        count: 2,
    });
    content.spawns.push(SpawnDef {
        room: plaza.clone(),
        template: rat,
        count: 1,
    });
    content.spawns.push(SpawnDef {
        room: clearing,
        template: wolf,
        count: 2,
    });

    let bleed = EffectId::new("bleed");
    let regrowth = EffectId::new("regrowth");
    let fury = EffectId::new("battle-fury");
    let daze = EffectId::new("daze");
    let ward = EffectId::new("ward");

    content.effects.insert(
        bleed.clone(),
        EffectDef {
            id: bleed.clone(),
            name: "Bleed".to_owned(),
            kind: EffectKind::Dot,
            duration_ms: 9_000,
            tick_interval_ms: Some(3_000),
            magnitude: 2,
            max_stacks: 3,
            stat_mods: StatMods::default(),
        },
    );
    content.effects.insert(
        regrowth.clone(),
        EffectDef {
            id: regrowth.clone(),
            name: "Regrowth".to_owned(),
            kind: EffectKind::Hot,
            duration_ms: 12_000,
            tick_interval_ms: Some(3_000),
            magnitude: 3,
            max_stacks: 1,
            stat_mods: StatMods::default(),
        },
    );
    content.effects.insert(
        fury.clone(),
        EffectDef {
            id: fury.clone(),
            name: "Battle Fury".to_owned(),
            kind: EffectKind::StatBuff,
            duration_ms: 15_000,
            tick_interval_ms: None,
            magnitude: 0,
            max_stacks: 1,
            stat_mods: StatMods {
                strength: 4,
                ..Default::default()
            },
        },
    );
    content.effects.insert(
        daze.clone(),
        EffectDef {
            id: daze.clone(),
            name: "Daze".to_owned(),
            kind: EffectKind::Stun,
            duration_ms: 2_000,
            tick_interval_ms: None,
            magnitude: 0,
            max_stacks: 1,
            stat_mods: StatMods::default(),
        },
    );
    content.effects.insert(
        ward.clone(),
        EffectDef {
            id: ward.clone(),
            name: "Ward".to_owned(),
            kind: EffectKind::Shield,
            duration_ms: 20_000,
            tick_interval_ms: None,
            magnitude: 12,
            max_stacks: 1,
            stat_mods: StatMods::default(),
        },
    );

    for def in [
        AbilityDef {
            id: AbilityId::new("bash"),
            name: "Bash".to_owned(),
            class: PlayerClass::Warrior,
            min_level: 1,
            mana_cost: 4,
            cooldown_ms: 6_000,
            target: TargetRule::Enemy,
            effect: AbilityEffect::Damage { amount: 6 },
        },
        AbilityDef {
            id: AbilityId::new("war-cry"),
            name: "War Cry".to_owned(),
            class: PlayerClass::Warrior,
            min_level: 3,
            mana_cost: 6,
            cooldown_ms: 20_000,
            target: TargetRule::SelfOnly,
            effect: AbilityEffect::ApplyEffect {
                effect: fury.clone(),
            },
        },
        AbilityDef {
            id: AbilityId::new("mend"),
            name: "Mend".to_owned(),
            class: PlayerClass::Cleric,
            min_level: 1,
            mana_cost: 5,
            cooldown_ms: 2_500,
            target: TargetRule::Ally,
            effect: AbilityEffect::Heal { amount: 8 },
        },
        AbilityDef {
            id: AbilityId::new("ward"),
            name: "Ward".to_owned(),
            class: PlayerClass::Cleric,
            min_level: 2,
            mana_cost: 8,
            cooldown_ms: 15_000,
            target: TargetRule::Ally,
            effect: AbilityEffect::ApplyEffect {
                effect: ward.clone(),
            },
        },
        AbilityDef {
            id: AbilityId::new("firebolt"),
            name: "Firebolt".to_owned(),
            class: PlayerClass::Mage,
            min_level: 1,
            mana_cost: 5,
            cooldown_ms: 2_500,
            target: TargetRule::Enemy,
            effect: AbilityEffect::Damage { amount: 7 },
        },
        AbilityDef {
            id: AbilityId::new("flamewave"),
            name: "Flamewave".to_owned(),
            class: PlayerClass::Mage,
            min_level: 4,
            mana_cost: 14,
            cooldown_ms: 12_000,
            target: TargetRule::Enemy,
            effect: AbilityEffect::AreaDamage { amount: 5 },
        },
        AbilityDef {
            id: AbilityId::new("gouge"),
            name: "Gouge".to_owned(),
            class: PlayerClass::Rogue,
            min_level: 1,
            mana_cost: 4,
            cooldown_ms: 5_000,
            target: TargetRule::Enemy,
            effect: AbilityEffect::ApplyEffect {
                effect: bleed.clone(),
            },
        },
    ] {
        content.abilities.insert(def.id.clone(), def);
    }

    content.quests.insert(
        rat_cull.clone(),
        QuestDef {
            id: rat_cull,
            name: "Rat Cull".to_owned(),
            goal: QuestGoal::KillCount {
                template: TemplateKey::new("cellar-rat"),
                count: 3,
            },
            xp_reward: 150,
            gold_reward: 10,
        },
    );
    content.quests.insert(
        scout.clone(),
        QuestDef {
            id: scout,
            name: "Scout the Forest".to_owned(),
            goal: QuestGoal::VisitRoom {
                room: RoomId::new("forest", "edge"),
            },
            xp_reward: 80,
            gold_reward: 5,
        },
    );

    for def in [
        AchievementDef {
            id: AchievementId::new("first-blood"),
            name: "First Blood".to_owned(),
            goal: AchievementGoal::TotalKills { count: 1 },
            title: None,
        },
        AchievementDef {
            id: AchievementId::new("seasoned"),
            name: "Seasoned".to_owned(),
            goal: AchievementGoal::ReachLevel { level: 5 },
            title: Some("the Seasoned".to_owned()),
        },
        AchievementDef {
            id: AchievementId::new("errand-runner"),
            name: "Errand Runner".to_owned(),
            goal: AchievementGoal::QuestsCompleted { count: 2 },
            title: None,
        },
    ] {
        content.achievements.insert(def.id.clone(), def);
    }

    content
}

#[cfg(test)]
mod tests {
    use crate::source::{demo_world, validate};
    use core_protocol::id::ZoneId;

    #[test]
    fn demo_world_validates() {
        let content = demo_world();
        validate(&content).unwrap();
        assert_eq!(
            content.zones(),
            vec![ZoneId::new("forest"), ZoneId::new("hub")]
        );
    }

    #[test]
    fn zone_restriction_keeps_only_owned_rooms() {
        let content = demo_world();
        let hub = content.restricted_to(&[ZoneId::new("hub")]);
        assert!(hub.rooms.keys().all(|r| r.zone_str() == "hub"));
        assert!(hub.spawns.iter().all(|s| s.room.zone_str() == "hub"));
        assert!(hub.starting_room.is_some());

        let forest = content.restricted_to(&[ZoneId::new("forest")]);
        assert!(forest.starting_room.is_none());
        assert_eq!(forest.spawns.len(), 1);
    }

    #[test]
    fn class_ability_listing_is_ordered() {
        let content = demo_world();
        let warrior = content.abilities_for_class(core_protocol::dto::PlayerClass::Warrior);
        assert_eq!(warrior.len(), 2);
        assert!(warrior[0].min_level <= warrior[1].min_level);
    }
}
