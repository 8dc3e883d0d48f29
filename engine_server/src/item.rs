// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::dto::{EquipSlot, StatMods};
use core_protocol::id::{ItemId, MobId, RoomId, SessionId, TemplateKey};
use std::collections::HashMap;
use std::num::NonZeroU64;
use world::source::WorldContent;
use world::templates::ItemTemplate;

/// Where an item instance is. Exactly one location at any time; the repo's
/// move operation is the only way to change it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemLocation {
    Room(RoomId),
    Mob(MobId),
    Inventory(SessionId),
    Equipped(SessionId, EquipSlot),
    Container(String),
}

#[derive(Clone, Debug)]
pub struct ItemInstance {
    pub id: ItemId,
    pub template: TemplateKey,
    pub location: ItemLocation,
}

#[derive(Default)]
pub struct ItemRepo {
    items: HashMap<ItemId, ItemInstance>,
    by_room: HashMap<RoomId, Vec<ItemId>>,
    by_mob: HashMap<MobId, Vec<ItemId>>,
    /// Inventory and equipment together; callers filter by location.
    by_session: HashMap<SessionId, Vec<ItemId>>,
    next_id: u64,
}

impl ItemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, item_id: ItemId) -> Option<&ItemInstance> {
        self.items.get(&item_id)
    }

    pub fn spawn(&mut self, template: TemplateKey, location: ItemLocation) -> ItemId {
        self.next_id += 1;
        let id = ItemId(NonZeroU64::new(self.next_id).unwrap());
        self.index_insert(&location, id);
        self.items.insert(
            id,
            ItemInstance {
                id,
                template,
                location,
            },
        );
        id
    }

    /// Relocates an item, updating both membership indexes in this call.
    pub fn move_to(&mut self, item_id: ItemId, location: ItemLocation) -> Result<(), &'static str> {
        let old = {
            let item = self.items.get_mut(&item_id).ok_or("no such item")?;
            let old = item.location.clone();
            item.location = location.clone();
            old
        };
        self.index_remove(&old, item_id);
        self.index_insert(&location, item_id);
        Ok(())
    }

    pub fn remove(&mut self, item_id: ItemId) -> Option<ItemInstance> {
        let item = self.items.remove(&item_id)?;
        self.index_remove(&item.location, item_id);
        Some(item)
    }

    pub fn items_in_room(&self, room_id: &RoomId) -> &[ItemId] {
        self.by_room.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn items_on_mob(&self, mob_id: &MobId) -> Vec<ItemId> {
        self.by_mob.get(mob_id).cloned().unwrap_or_default()
    }

    pub fn carried_by(&self, session_id: SessionId) -> &[ItemId] {
        self.by_session
            .get(&session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn inventory(&self, session_id: SessionId) -> Vec<ItemId> {
        self.carried_by(session_id)
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    self.items.get(id).map(|i| &i.location),
                    Some(ItemLocation::Inventory(_))
                )
            })
            .collect()
    }

    pub fn equipped(&self, session_id: SessionId) -> Vec<(EquipSlot, ItemId)> {
        self.carried_by(session_id)
            .iter()
            .copied()
            .filter_map(|id| match self.items.get(&id).map(|i| &i.location) {
                Some(ItemLocation::Equipped(_, slot)) => Some((*slot, id)),
                _ => None,
            })
            .collect()
    }

    pub fn equipped_in_slot(&self, session_id: SessionId, slot: EquipSlot) -> Option<ItemId> {
        self.equipped(session_id)
            .into_iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, id)| id)
    }

    /// Case-insensitive substring search over a slice of item ids, by
    /// template name order.
    pub fn find_by_keyword(
        &self,
        ids: &[ItemId],
        keyword: &str,
        content: &WorldContent,
    ) -> Option<ItemId> {
        let keyword = keyword.to_ascii_lowercase();
        let mut named: Vec<(String, ItemId)> = ids
            .iter()
            .filter_map(|id| {
                let item = self.items.get(id)?;
                let template = content.item_templates.get(&item.template)?;
                template
                    .name
                    .to_ascii_lowercase()
                    .contains(&keyword)
                    .then(|| (template.name.clone(), *id))
            })
            .collect();
        named.sort();
        named.first().map(|(_, id)| *id)
    }

    /// Sum of equipment attack bonuses for combat math.
    pub fn attack_bonus(&self, session_id: SessionId, content: &WorldContent) -> i32 {
        self.equipped_templates(session_id, content)
            .map(|t| t.attack_bonus)
            .sum()
    }

    pub fn armor_bonus(&self, session_id: SessionId, content: &WorldContent) -> i32 {
        self.equipped_templates(session_id, content)
            .map(|t| t.armor_bonus)
            .sum()
    }

    pub fn equip_stat_mods(&self, session_id: SessionId, content: &WorldContent) -> StatMods {
        let mut mods = StatMods::default();
        for template in self.equipped_templates(session_id, content) {
            mods.add(template.stat_mods);
        }
        mods
    }

    fn equipped_templates<'a>(
        &'a self,
        session_id: SessionId,
        content: &'a WorldContent,
    ) -> impl Iterator<Item = &'a ItemTemplate> {
        self.equipped(session_id)
            .into_iter()
            .filter_map(move |(_, id)| {
                let item = self.items.get(&id)?;
                content.item_templates.get(&item.template)
            })
    }

    fn index_insert(&mut self, location: &ItemLocation, item_id: ItemId) {
        match location {
            ItemLocation::Room(room) => {
                self.by_room.entry(room.clone()).or_default().push(item_id)
            }
            ItemLocation::Mob(mob) => self.by_mob.entry(mob.clone()).or_default().push(item_id),
            ItemLocation::Inventory(sid) | ItemLocation::Equipped(sid, _) => {
                let carried = self.by_session.entry(*sid).or_default();
                if !carried.contains(&item_id) {
                    carried.push(item_id);
                }
            }
            ItemLocation::Container(_) => {}
        }
    }

    fn index_remove(&mut self, location: &ItemLocation, item_id: ItemId) {
        match location {
            ItemLocation::Room(room) => {
                if let Some(items) = self.by_room.get_mut(room) {
                    items.retain(|i| *i != item_id);
                    if items.is_empty() {
                        self.by_room.remove(room);
                    }
                }
            }
            ItemLocation::Mob(mob) => {
                if let Some(items) = self.by_mob.get_mut(mob) {
                    items.retain(|i| *i != item_id);
                    if items.is_empty() {
                        self.by_mob.remove(mob);
                    }
                }
            }
            ItemLocation::Inventory(sid) | ItemLocation::Equipped(sid, _) => {
                if let Some(items) = self.by_session.get_mut(sid) {
                    items.retain(|i| *i != item_id);
                    if items.is_empty() {
                        self.by_session.remove(sid);
                    }
                }
            }
            ItemLocation::Container(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::session;
    use world::source::demo_world;

    fn plaza() -> RoomId {
        RoomId::new("hub", "plaza")
    }

    #[test]
    fn item_is_in_exactly_one_index() {
        let mut repo = ItemRepo::new();
        let sword = TemplateKey::new("rusty-sword");
        let id = repo.spawn(sword, ItemLocation::Room(plaza()));
        assert_eq!(repo.items_in_room(&plaza()), &[id]);

        repo.move_to(id, ItemLocation::Inventory(session(1))).unwrap();
        assert!(repo.items_in_room(&plaza()).is_empty());
        assert_eq!(repo.inventory(session(1)), vec![id]);

        repo.move_to(id, ItemLocation::Equipped(session(1), EquipSlot::Weapon))
            .unwrap();
        assert!(repo.inventory(session(1)).is_empty());
        assert_eq!(
            repo.equipped_in_slot(session(1), EquipSlot::Weapon),
            Some(id)
        );
    }

    #[test]
    fn equipment_bonuses_sum() {
        let content = demo_world();
        let mut repo = ItemRepo::new();
        let sword = repo.spawn(
            TemplateKey::new("rusty-sword"),
            ItemLocation::Equipped(session(1), EquipSlot::Weapon),
        );
        repo.spawn(
            TemplateKey::new("leather-cap"),
            ItemLocation::Equipped(session(1), EquipSlot::Head),
        );
        assert_eq!(repo.attack_bonus(session(1), &content), 2);
        assert_eq!(repo.armor_bonus(session(1), &content), 1);
        assert_eq!(repo.equip_stat_mods(session(1), &content).dexterity, 1);

        repo.remove(sword).unwrap();
        assert_eq!(repo.attack_bonus(session(1), &content), 0);
    }

    #[test]
    fn keyword_search_uses_template_names() {
        let content = demo_world();
        let mut repo = ItemRepo::new();
        let id = repo.spawn(
            TemplateKey::new("leather-cap"),
            ItemLocation::Room(plaza()),
        );
        let found = repo.find_by_keyword(repo.items_in_room(&plaza()), "CAP", &content);
        assert_eq!(found, Some(id));
    }
}
