// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{MobId, SessionId};
use std::collections::HashMap;

/// Cumulative threat per (mob, attacker). The inner rows are insertion
/// ordered; ties on `top` go to the earliest attacker, and that ordering is
/// part of the observable contract (tests pin it).
#[derive(Default)]
pub struct ThreatRepo {
    rows: HashMap<MobId, Vec<(SessionId, f64)>>,
}

impl ThreatRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds threat, creating the row/entry as needed. Negative deltas are
    /// legal (threat-wipe effects) and may drive an entry below zero.
    pub fn add(&mut self, mob_id: &MobId, session_id: SessionId, delta: f64) {
        let row = self.rows.entry(mob_id.clone()).or_default();
        if let Some(entry) = row.iter_mut().find(|(sid, _)| *sid == session_id) {
            entry.1 += delta;
        } else {
            row.push((session_id, delta));
        }
    }

    /// Highest-threat attacker satisfying the predicate. Strictly-greater
    /// comparison keeps the earliest-inserted entry on ties.
    pub fn top(
        &self,
        mob_id: &MobId,
        mut predicate: impl FnMut(SessionId) -> bool,
    ) -> Option<SessionId> {
        let row = self.rows.get(mob_id)?;
        let mut best: Option<(SessionId, f64)> = None;
        for (sid, threat) in row {
            if !predicate(*sid) {
                continue;
            }
            match best {
                Some((_, best_threat)) if *threat <= best_threat => {}
                _ => best = Some((*sid, *threat)),
            }
        }
        best.map(|(sid, _)| sid)
    }

    pub fn has_entry(&self, mob_id: &MobId) -> bool {
        self.rows.contains_key(mob_id)
    }

    pub fn has_threat_from(&self, mob_id: &MobId, session_id: SessionId) -> bool {
        self.rows
            .get(mob_id)
            .map(|row| row.iter().any(|(sid, _)| *sid == session_id))
            .unwrap_or(false)
    }

    /// Everyone with a threat entry on this mob, in insertion order.
    pub fn contributors(&self, mob_id: &MobId) -> Vec<SessionId> {
        self.rows
            .get(mob_id)
            .map(|row| row.iter().map(|(sid, _)| *sid).collect())
            .unwrap_or_default()
    }

    /// Removes the session from every row; rows left empty disappear.
    pub fn remove_player(&mut self, session_id: SessionId) {
        self.rows.retain(|_, row| {
            row.retain(|(sid, _)| *sid != session_id);
            !row.is_empty()
        });
    }

    /// Removes the session from one mob's row only (flee from one fight).
    pub fn remove_player_from(&mut self, mob_id: &MobId, session_id: SessionId) {
        if let Some(row) = self.rows.get_mut(mob_id) {
            row.retain(|(sid, _)| *sid != session_id);
            if row.is_empty() {
                self.rows.remove(mob_id);
            }
        }
    }

    pub fn remove_mob(&mut self, mob_id: &MobId) {
        self.rows.remove(mob_id);
    }

    /// Mobs holding a threat entry for this session.
    pub fn mobs_threatened_by(&self, session_id: SessionId) -> Vec<MobId> {
        self.rows
            .iter()
            .filter(|(_, row)| row.iter().any(|(sid, _)| *sid == session_id))
            .map(|(mob_id, _)| mob_id.clone())
            .collect()
    }

    /// Merges `old`'s threat into `new` additively, in every row. `old`'s
    /// slot (the earlier of the two) keeps its position.
    pub fn remap_session(&mut self, old: SessionId, new: SessionId) {
        for row in self.rows.values_mut() {
            let Some(old_index) = row.iter().position(|(sid, _)| *sid == old) else {
                continue;
            };
            if let Some(new_index) = row.iter().position(|(sid, _)| *sid == new) {
                let (keep, drop) = if old_index < new_index {
                    (old_index, new_index)
                } else {
                    (new_index, old_index)
                };
                let moved = row[drop].1;
                row[keep] = (new, row[keep].1 + moved);
                row.remove(drop);
            } else {
                row[old_index].0 = new;
            }
        }
    }

    pub fn mob_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::session;

    fn rat() -> MobId {
        MobId::new("hub", "rat", 1)
    }

    fn wolf() -> MobId {
        MobId::new("forest", "wolf", 1)
    }

    #[test]
    fn top_breaks_ties_by_insertion_order() {
        let mut repo = ThreatRepo::new();
        repo.add(&rat(), session(1), 10.0);
        repo.add(&rat(), session(2), 10.0);
        assert_eq!(repo.top(&rat(), |_| true), Some(session(1)));

        repo.add(&rat(), session(2), 0.5);
        assert_eq!(repo.top(&rat(), |_| true), Some(session(2)));
    }

    #[test]
    fn top_respects_predicate() {
        let mut repo = ThreatRepo::new();
        repo.add(&rat(), session(1), 10.0);
        repo.add(&rat(), session(2), 5.0);
        assert_eq!(
            repo.top(&rat(), |sid| sid != session(1)),
            Some(session(2))
        );
        assert_eq!(repo.top(&rat(), |_| false), None);
    }

    #[test]
    fn remove_player_deletes_empty_rows() {
        let mut repo = ThreatRepo::new();
        repo.add(&rat(), session(1), 1.0);
        repo.add(&wolf(), session(1), 1.0);
        repo.add(&wolf(), session(2), 1.0);

        repo.remove_player(session(1));
        assert!(!repo.has_entry(&rat()));
        assert!(repo.has_entry(&wolf()));
        assert!(!repo.has_threat_from(&wolf(), session(1)));
        assert_eq!(repo.mob_count(), 1);
    }

    #[test]
    fn negative_threat_is_allowed() {
        let mut repo = ThreatRepo::new();
        repo.add(&rat(), session(1), 5.0);
        repo.add(&rat(), session(2), 3.0);
        repo.add(&rat(), session(1), -10.0);
        assert_eq!(repo.top(&rat(), |_| true), Some(session(2)));
    }

    #[test]
    fn remap_merges_additively() {
        let mut repo = ThreatRepo::new();
        repo.add(&rat(), session(1), 5.0);
        repo.add(&rat(), session(2), 2.0);
        repo.add(&wolf(), session(1), 1.0);

        repo.remap_session(session(1), session(3));
        assert!(!repo.has_threat_from(&rat(), session(1)));
        assert_eq!(repo.top(&rat(), |_| true), Some(session(3)));
        assert!(repo.has_threat_from(&wolf(), session(3)));

        // Merging into an existing entry sums the two.
        let mut repo = ThreatRepo::new();
        repo.add(&rat(), session(1), 5.0);
        repo.add(&rat(), session(2), 4.0);
        repo.remap_session(session(1), session(2));
        assert_eq!(repo.contributors(&rat()), vec![session(2)]);
        assert_eq!(repo.top(&rat(), |_| true), Some(session(2)));
    }
}
