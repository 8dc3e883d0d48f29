// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{MobId, RoomId, TemplateKey};
use std::collections::HashMap;
use world::templates::MobTemplate;

/// A live mob. Respawn creates a fresh state (and a fresh id) from the same
/// template; nothing refers to a dead mob's id afterwards.
#[derive(Clone, Debug)]
pub struct MobState {
    pub id: MobId,
    pub name: String,
    pub room_id: RoomId,
    pub hp: i32,
    pub max_hp: i32,
    pub min_damage: i32,
    pub max_damage: i32,
    pub armor: i32,
    pub xp_reward: u64,
    pub gold_min: u64,
    pub gold_max: u64,
    pub template: TemplateKey,
    pub behavior: Option<String>,
}

#[derive(Default)]
pub struct MobRepo {
    mobs: HashMap<MobId, MobState>,
    by_room: HashMap<RoomId, Vec<MobId>>,
    spawn_serial: u64,
}

impl MobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.mobs.len()
    }

    pub fn contains(&self, mob_id: &MobId) -> bool {
        self.mobs.contains_key(mob_id)
    }

    pub fn get(&self, mob_id: &MobId) -> Option<&MobState> {
        self.mobs.get(mob_id)
    }

    pub fn get_mut(&mut self, mob_id: &MobId) -> Option<&mut MobState> {
        self.mobs.get_mut(mob_id)
    }

    pub fn name_of(&self, mob_id: &MobId) -> String {
        self.get(mob_id)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "something".to_owned())
    }

    /// Instantiates a template into a room. The id embeds the room's zone
    /// and a serial so respawns never collide.
    pub fn spawn(&mut self, template: &MobTemplate, room_id: RoomId) -> MobId {
        self.spawn_serial += 1;
        let id = MobId::new(
            room_id.zone_str(),
            template.key.as_str(),
            self.spawn_serial,
        );
        let state = MobState {
            id: id.clone(),
            name: template.name.clone(),
            room_id: room_id.clone(),
            hp: template.hp,
            max_hp: template.hp,
            min_damage: template.min_damage,
            max_damage: template.max_damage,
            armor: template.armor,
            xp_reward: template.xp_reward,
            gold_min: template.gold_min,
            gold_max: template.gold_max,
            template: template.key.clone(),
            behavior: template.behavior.clone(),
        };
        self.by_room.entry(room_id).or_default().push(id.clone());
        self.mobs.insert(id.clone(), state);
        id
    }

    pub fn remove(&mut self, mob_id: &MobId) -> Option<MobState> {
        let state = self.mobs.remove(mob_id)?;
        if let Some(members) = self.by_room.get_mut(&state.room_id) {
            members.retain(|m| m != mob_id);
            if members.is_empty() {
                self.by_room.remove(&state.room_id);
            }
        }
        Some(state)
    }

    pub fn move_to(&mut self, mob_id: &MobId, room_id: RoomId) -> Result<(), &'static str> {
        let old_room = {
            let state = self.mobs.get_mut(mob_id).ok_or("no such mob")?;
            let old = state.room_id.clone();
            state.room_id = room_id.clone();
            old
        };
        if let Some(members) = self.by_room.get_mut(&old_room) {
            members.retain(|m| m != mob_id);
            if members.is_empty() {
                self.by_room.remove(&old_room);
            }
        }
        self.by_room.entry(room_id).or_default().push(mob_id.clone());
        Ok(())
    }

    pub fn mobs_in_room(&self, room_id: &RoomId) -> &[MobId] {
        self.by_room.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Case-insensitive substring match over mob names in a room, ties
    /// resolved by name order so "kill rat" is deterministic.
    pub fn find_in_room(&self, room_id: &RoomId, keyword: &str) -> Option<MobId> {
        let keyword = keyword.to_ascii_lowercase();
        let mut candidates: Vec<&MobState> = self
            .mobs_in_room(room_id)
            .iter()
            .filter_map(|id| self.mobs.get(id))
            .filter(|m| m.name.to_ascii_lowercase().contains(&keyword))
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        candidates.first().map(|m| m.id.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MobState> {
        self.mobs.values()
    }

    pub fn mob_ids(&self) -> Vec<MobId> {
        self.mobs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use world::source::demo_world;

    fn plaza() -> RoomId {
        RoomId::new("hub", "plaza")
    }

    #[test]
    fn spawn_and_find_by_keyword() {
        let content = demo_world();
        let mut repo = MobRepo::new();
        let template = content
            .mob_templates
            .get(&TemplateKey::new("cellar-rat"))
            .unwrap();
        let id = repo.spawn(template, plaza());

        assert_eq!(repo.find_in_room(&plaza(), "RAT"), Some(id.clone()));
        assert_eq!(repo.find_in_room(&plaza(), "dragon"), None);
        assert_eq!(repo.mobs_in_room(&plaza()), &[id]);
    }

    #[test]
    fn remove_clears_room_key() {
        let content = demo_world();
        let mut repo = MobRepo::new();
        let template = content
            .mob_templates
            .get(&TemplateKey::new("cellar-rat"))
            .unwrap();
        let id = repo.spawn(template, plaza());
        repo.remove(&id).unwrap();
        assert!(repo.mobs_in_room(&plaza()).is_empty());
        assert_eq!(repo.len(), 0);
    }

    #[test]
    fn respawn_gets_fresh_id() {
        let content = demo_world();
        let mut repo = MobRepo::new();
        let template = content
            .mob_templates
            .get(&TemplateKey::new("cellar-rat"))
            .unwrap();
        let first = repo.spawn(template, plaza());
        repo.remove(&first);
        let second = repo.spawn(template, plaza());
        assert_ne!(first, second);
    }

    #[test]
    fn keyword_ties_resolve_by_name_order() {
        let content = demo_world();
        let mut repo = MobRepo::new();
        let rat = content
            .mob_templates
            .get(&TemplateKey::new("cellar-rat"))
            .unwrap();
        let wolf = content
            .mob_templates
            .get(&TemplateKey::new("grey-wolf"))
            .unwrap();
        repo.spawn(wolf, plaza());
        repo.spawn(rat, plaza());
        // "a cellar rat" sorts before "a grey wolf".
        let found = repo.find_in_room(&plaza(), "a ").unwrap();
        assert!(found.as_str().contains("cellar-rat"));
    }
}
