// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{GroupId, MobId, SessionId};
use std::collections::HashSet;
use std::mem;

/// Per-tick accumulation of "what changed". Inserts are O(1); the flush
/// takes each set wholesale so late marks land in the next tick instead of
/// being lost or double-emitted.
#[derive(Default)]
pub struct DirtyRepo {
    player_vitals: HashSet<SessionId>,
    player_status: HashSet<SessionId>,
    mob_hp: HashSet<MobId>,
    group_info: HashSet<GroupId>,
}

impl DirtyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_vitals(&mut self, session_id: SessionId) {
        self.player_vitals.insert(session_id);
    }

    pub fn mark_status(&mut self, session_id: SessionId) {
        self.player_status.insert(session_id);
    }

    pub fn mark_mob_hp(&mut self, mob_id: &MobId) {
        self.mob_hp.insert(mob_id.clone());
    }

    pub fn mark_group(&mut self, group_id: GroupId) {
        self.group_info.insert(group_id);
    }

    /// A mob that died this tick has nothing to announce.
    pub fn unmark_mob(&mut self, mob_id: &MobId) {
        self.mob_hp.remove(mob_id);
    }

    pub fn forget_session(&mut self, session_id: SessionId) {
        self.player_vitals.remove(&session_id);
        self.player_status.remove(&session_id);
    }

    pub fn take_vitals(&mut self) -> HashSet<SessionId> {
        mem::take(&mut self.player_vitals)
    }

    pub fn take_status(&mut self) -> HashSet<SessionId> {
        mem::take(&mut self.player_status)
    }

    pub fn take_mob_hp(&mut self) -> HashSet<MobId> {
        mem::take(&mut self.mob_hp)
    }

    pub fn take_groups(&mut self) -> HashSet<GroupId> {
        mem::take(&mut self.group_info)
    }

    pub fn is_empty(&self) -> bool {
        self.player_vitals.is_empty()
            && self.player_status.is_empty()
            && self.mob_hp.is_empty()
            && self.group_info.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::session;

    #[test]
    fn take_clears_for_next_tick() {
        let mut dirty = DirtyRepo::new();
        dirty.mark_vitals(session(1));
        dirty.mark_vitals(session(1));
        dirty.mark_vitals(session(2));

        let drained = dirty.take_vitals();
        assert_eq!(drained.len(), 2);
        assert!(dirty.is_empty());
        assert!(dirty.take_vitals().is_empty());
    }

    #[test]
    fn dead_mob_is_unmarked() {
        let mut dirty = DirtyRepo::new();
        let rat = MobId::new("hub", "rat", 1);
        dirty.mark_mob_hp(&rat);
        dirty.unmark_mob(&rat);
        assert!(dirty.take_mob_hp().is_empty());
    }
}
