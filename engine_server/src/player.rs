// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::dto::{PlayerClass, PlayerRecordDto, Race, StatBlock};
use core_protocol::id::{AchievementId, GroupId, PlayerId, QuestId, RoomId, SessionId};
use core_protocol::name::PlayerName;
use core_protocol::UnixTime;
use std::collections::{HashMap, HashSet};
use world::templates::rules;

/// A logged-in character. Exists only on the engine that owns the player's
/// current zone, and only the tick thread mutates it.
#[derive(Clone, Debug)]
pub struct PlayerState {
    pub session_id: SessionId,
    pub player_id: PlayerId,
    pub name: PlayerName,
    pub room_id: RoomId,
    pub hp: i32,
    pub max_hp: i32,
    /// Max HP before status effects; recomputed on level change.
    pub base_max_hp: i32,
    pub mana: i32,
    pub max_mana: i32,
    pub base_stats: StatBlock,
    pub race: Race,
    pub class: PlayerClass,
    pub level: u32,
    pub xp_total: u64,
    pub gold: u64,
    pub is_staff: bool,
    pub ansi_enabled: bool,
    pub active_quests: HashMap<QuestId, u32>,
    pub completed_quests: HashSet<QuestId>,
    pub achievement_progress: HashMap<AchievementId, u64>,
    pub unlocked_achievements: HashSet<AchievementId>,
    pub active_title: Option<String>,
    pub group_id: Option<GroupId>,
    /// Set while a transfer ticket is outstanding; commands are refused and
    /// the state must survive unchanged in case of rollback.
    pub in_handoff: bool,
}

impl PlayerState {
    /// Builds the live state from a persisted record.
    pub fn from_record(session_id: SessionId, record: &PlayerRecordDto, ansi: bool) -> Self {
        let max_hp = rules::max_hp_for(record.class, record.base_stats.constitution, record.level);
        let max_mana = rules::max_mana_for(
            record.class,
            record.base_stats.intelligence,
            record.base_stats.wisdom,
            record.level,
        );
        Self {
            session_id,
            player_id: record.player_id,
            name: record.name,
            room_id: record.room_id.clone(),
            hp: max_hp,
            max_hp,
            base_max_hp: max_hp,
            mana: max_mana,
            max_mana,
            base_stats: record.base_stats,
            race: record.race,
            class: record.class,
            level: record.level,
            xp_total: record.xp_total,
            gold: record.gold,
            is_staff: record.is_staff,
            ansi_enabled: ansi,
            active_quests: HashMap::new(),
            completed_quests: record.completed_quests.iter().cloned().collect(),
            achievement_progress: HashMap::new(),
            unlocked_achievements: record.unlocked_achievements.iter().cloned().collect(),
            active_title: record.active_title.clone(),
            group_id: None,
            in_handoff: false,
        }
    }

    /// Snapshot for the persistence collaborator.
    pub fn to_record(&self, last_seen: UnixTime) -> PlayerRecordDto {
        PlayerRecordDto {
            player_id: self.player_id,
            name: self.name,
            room_id: self.room_id.clone(),
            race: self.race,
            class: self.class,
            level: self.level,
            xp_total: self.xp_total,
            gold: self.gold,
            base_stats: self.base_stats,
            is_staff: self.is_staff,
            completed_quests: self.completed_quests.iter().cloned().collect(),
            unlocked_achievements: self.unlocked_achievements.iter().cloned().collect(),
            active_title: self.active_title.clone(),
            last_seen,
        }
    }
}

/// Players of one engine: primary map by session plus a room-membership
/// index and a canonical-name index. Every mutation keeps all three in step
/// within the same call.
#[derive(Default)]
pub struct PlayerRepo {
    players: HashMap<SessionId, PlayerState>,
    by_room: HashMap<RoomId, Vec<SessionId>>,
    by_name: HashMap<String, SessionId>,
}

impl PlayerRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.players.contains_key(&session_id)
    }

    pub fn get(&self, session_id: SessionId) -> Option<&PlayerState> {
        self.players.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: SessionId) -> Option<&mut PlayerState> {
        self.players.get_mut(&session_id)
    }

    /// Display name, tolerating a stale id.
    pub fn name_of(&self, session_id: SessionId) -> String {
        self.get(session_id)
            .map(|p| p.name.to_string())
            .unwrap_or_else(|| "someone".to_owned())
    }

    /// Case-insensitive lookup of an online player.
    pub fn find_by_name(&self, name: &str) -> Option<SessionId> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn is_name_online(&self, name: &PlayerName) -> bool {
        self.by_name.contains_key(&name.canonical())
    }

    /// Binds a freshly logged-in (or handed-off) player. Fails if the name
    /// is already live here; the caller turns that into a user message.
    pub fn attach(&mut self, state: PlayerState) -> Result<(), &'static str> {
        if self.players.contains_key(&state.session_id) {
            return Err("session already attached");
        }
        if self.by_name.contains_key(&state.name.canonical()) {
            return Err("name already online");
        }
        self.by_name.insert(state.name.canonical(), state.session_id);
        self.by_room
            .entry(state.room_id.clone())
            .or_default()
            .push(state.session_id);
        self.players.insert(state.session_id, state);
        Ok(())
    }

    /// Removes the player and both index entries; returns the final state so
    /// the caller can persist or hand it off.
    pub fn detach(&mut self, session_id: SessionId) -> Option<PlayerState> {
        let state = self.players.remove(&session_id)?;
        self.by_name.remove(&state.name.canonical());
        self.remove_from_room_index(&state.room_id, session_id);
        Some(state)
    }

    pub fn move_to(&mut self, session_id: SessionId, room_id: RoomId) -> Result<(), &'static str> {
        let old_room = {
            let state = self.players.get_mut(&session_id).ok_or("no such player")?;
            let old = state.room_id.clone();
            state.room_id = room_id.clone();
            old
        };
        self.remove_from_room_index(&old_room, session_id);
        self.by_room.entry(room_id).or_default().push(session_id);
        Ok(())
    }

    /// Changes the display name, keeping the canonical index consistent.
    pub fn rename(&mut self, session_id: SessionId, name: PlayerName) -> Result<(), &'static str> {
        if let Some(existing) = self.by_name.get(&name.canonical()) {
            if *existing != session_id {
                return Err("name already online");
            }
        }
        let state = self.players.get_mut(&session_id).ok_or("no such player")?;
        self.by_name.remove(&state.name.canonical());
        state.name = name;
        self.by_name.insert(name.canonical(), session_id);
        Ok(())
    }

    pub fn players_in_room(&self, room_id: &RoomId) -> &[SessionId] {
        self.by_room.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.players.keys().copied().collect()
    }

    fn remove_from_room_index(&mut self, room_id: &RoomId, session_id: SessionId) {
        if let Some(members) = self.by_room.get_mut(room_id) {
            members.retain(|s| *s != session_id);
            // Empty room keys are removed so the index doesn't grow forever.
            if members.is_empty() {
                self.by_room.remove(room_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn room_index_len(&self) -> usize {
        self.by_room.len()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use core_protocol::id::{LeaseId, PlayerId};
    use std::num::NonZeroU64;

    pub fn session(n: u16) -> SessionId {
        SessionId::compose(1_000, LeaseId::default(), n).unwrap()
    }

    pub fn player(n: u16, name: &str, room: RoomId) -> PlayerState {
        let record = PlayerRecordDto {
            player_id: PlayerId(NonZeroU64::new(n as u64 + 1).unwrap()),
            name: PlayerName::new(name).unwrap(),
            room_id: room,
            race: Race::Human,
            class: PlayerClass::Warrior,
            level: 1,
            xp_total: 0,
            gold: 0,
            base_stats: StatBlock {
                strength: 10,
                dexterity: 10,
                constitution: 10,
                intelligence: 10,
                wisdom: 10,
                charisma: 10,
            },
            is_staff: false,
            completed_quests: vec![],
            unlocked_achievements: vec![],
            active_title: None,
            last_seen: 0,
        };
        PlayerState::from_record(session(n), &record, true)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{player, session};
    use super::*;

    fn plaza() -> RoomId {
        RoomId::new("hub", "plaza")
    }

    fn gate() -> RoomId {
        RoomId::new("hub", "gate")
    }

    #[test]
    fn attach_rejects_duplicate_name_case_insensitively() {
        let mut repo = PlayerRepo::new();
        repo.attach(player(1, "Alice", plaza())).unwrap();
        assert_eq!(
            repo.attach(player(2, "ALICE", plaza())),
            Err("name already online")
        );
        assert_eq!(repo.find_by_name("alice"), Some(session(1)));
    }

    #[test]
    fn move_updates_index_in_one_call() {
        let mut repo = PlayerRepo::new();
        repo.attach(player(1, "Alice", plaza())).unwrap();
        repo.move_to(session(1), gate()).unwrap();
        assert!(repo.players_in_room(&plaza()).is_empty());
        assert_eq!(repo.players_in_room(&gate()), &[session(1)]);
        // Vacated room key is gone entirely.
        assert_eq!(repo.room_index_len(), 1);
    }

    #[test]
    fn detach_clears_every_index() {
        let mut repo = PlayerRepo::new();
        repo.attach(player(1, "Alice", plaza())).unwrap();
        let state = repo.detach(session(1)).unwrap();
        assert_eq!(state.name.as_str(), "Alice");
        assert!(repo.find_by_name("alice").is_none());
        assert_eq!(repo.room_index_len(), 0);
        assert!(repo.detach(session(1)).is_none());
    }

    #[test]
    fn rename_moves_canonical_key() {
        let mut repo = PlayerRepo::new();
        repo.attach(player(1, "Alice", plaza())).unwrap();
        repo.rename(session(1), PlayerName::new("Alicia").unwrap())
            .unwrap();
        assert!(repo.find_by_name("alice").is_none());
        assert_eq!(repo.find_by_name("ALICIA"), Some(session(1)));
    }
}
