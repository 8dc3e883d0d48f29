// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{GroupId, SessionId};
use core_protocol::UnixTime;
use std::collections::HashMap;
use std::num::NonZeroU32;

/// A party. First member is the leader, always.
#[derive(Clone, Debug)]
pub struct GroupState {
    pub id: GroupId,
    pub members: Vec<SessionId>,
    /// Round-robin cursor for group-loot assignment modes.
    pub loot_index: usize,
}

impl GroupState {
    pub fn leader(&self) -> SessionId {
        self.members[0]
    }

    pub fn is_leader(&self, session_id: SessionId) -> bool {
        self.members.first() == Some(&session_id)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PendingInvite {
    pub inviter: SessionId,
    pub expires_at: UnixTime,
}

/// Result of a member leaving, so the caller can narrate and reindex.
#[derive(Debug, PartialEq)]
pub struct LeaveOutcome {
    pub group_id: GroupId,
    pub disbanded: bool,
    /// Present when leadership passed to a remaining member.
    pub new_leader: Option<SessionId>,
    pub remaining: Vec<SessionId>,
}

/// Party membership and invitations. A session is in at most one group;
/// groups below two members dissolve. Same-room and online checks belong to
/// the command layer, which sees the player registry.
#[derive(Default)]
pub struct GroupRepo {
    groups: HashMap<GroupId, GroupState>,
    by_session: HashMap<SessionId, GroupId>,
    pending: HashMap<SessionId, PendingInvite>,
    next_id: u32,
}

impl GroupRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_of(&self, session_id: SessionId) -> Option<GroupId> {
        self.by_session.get(&session_id).copied()
    }

    pub fn get(&self, group_id: GroupId) -> Option<&GroupState> {
        self.groups.get(&group_id)
    }

    /// Members of the session's group including the session itself, or just
    /// the session when solo. Useful for XP split and healing threat.
    pub fn members_or_self(&self, session_id: SessionId) -> Vec<SessionId> {
        self.group_of(session_id)
            .and_then(|gid| self.groups.get(&gid))
            .map(|g| g.members.clone())
            .unwrap_or_else(|| vec![session_id])
    }

    pub fn are_grouped(&self, a: SessionId, b: SessionId) -> bool {
        match (self.group_of(a), self.group_of(b)) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => false,
        }
    }

    pub fn pending_invite(&self, invitee: SessionId) -> Option<&PendingInvite> {
        self.pending.get(&invitee)
    }

    /// Lazy eviction; called before any mutation that reads `pending`, and
    /// eagerly from the scheduler when an invite's timer fires.
    pub fn purge_expired(&mut self, now: UnixTime) {
        self.pending.retain(|_, invite| invite.expires_at > now);
    }

    pub fn invite(
        &mut self,
        now: UnixTime,
        inviter: SessionId,
        invitee: SessionId,
        ttl_ms: u64,
        max_size: usize,
    ) -> Result<(), &'static str> {
        self.purge_expired(now);
        if inviter == invitee {
            return Err("You cannot invite yourself.");
        }
        if self.by_session.contains_key(&invitee) {
            return Err("They are already in a group.");
        }
        if let Some(gid) = self.group_of(inviter) {
            let group = &self.groups[&gid];
            if group.members.len() >= max_size {
                return Err("Your group is full.");
            }
        }
        if let Some(existing) = self.pending.get(&invitee) {
            if existing.inviter == inviter {
                return Err("You have already invited them.");
            }
        }
        self.pending.insert(
            invitee,
            PendingInvite {
                inviter,
                expires_at: now + ttl_ms,
            },
        );
        Ok(())
    }

    /// Consumes the invite and joins the inviter's group, creating one with
    /// the inviter as leader if they were solo.
    pub fn accept(
        &mut self,
        now: UnixTime,
        invitee: SessionId,
        max_size: usize,
    ) -> Result<(GroupId, SessionId), &'static str> {
        self.purge_expired(now);
        if self.by_session.contains_key(&invitee) {
            self.pending.remove(&invitee);
            return Err("You are already in a group.");
        }
        let invite = self.pending.remove(&invitee).ok_or("You have no pending invite.")?;
        let inviter = invite.inviter;

        let group_id = match self.group_of(inviter) {
            Some(gid) => gid,
            None => {
                self.next_id += 1;
                let gid = GroupId(NonZeroU32::new(self.next_id).unwrap());
                self.groups.insert(
                    gid,
                    GroupState {
                        id: gid,
                        members: vec![inviter],
                        loot_index: 0,
                    },
                );
                self.by_session.insert(inviter, gid);
                gid
            }
        };

        let group = self.groups.get_mut(&group_id).expect("group just resolved");
        if group.members.len() >= max_size {
            return Err("That group is now full.");
        }
        group.members.push(invitee);
        self.by_session.insert(invitee, group_id);
        Ok((group_id, inviter))
    }

    /// Removes the session from its group. Dissolves the group if it would
    /// drop below two members; otherwise leadership passes to the new first
    /// member when the leader left.
    pub fn leave(&mut self, session_id: SessionId) -> Option<LeaveOutcome> {
        let group_id = self.by_session.remove(&session_id)?;
        let group = self.groups.get_mut(&group_id)?;
        let was_leader = group.is_leader(session_id);
        group.members.retain(|m| *m != session_id);
        group.loot_index = 0;

        if group.members.len() < 2 {
            let remaining = group.members.clone();
            self.groups.remove(&group_id);
            for member in &remaining {
                self.by_session.remove(member);
            }
            Some(LeaveOutcome {
                group_id,
                disbanded: true,
                new_leader: None,
                remaining,
            })
        } else {
            let remaining = group.members.clone();
            Some(LeaveOutcome {
                group_id,
                disbanded: false,
                new_leader: was_leader.then(|| remaining[0]),
                remaining,
            })
        }
    }

    /// Leader-only removal of another member.
    pub fn kick(
        &mut self,
        leader: SessionId,
        target: SessionId,
    ) -> Result<LeaveOutcome, &'static str> {
        let group_id = self.group_of(leader).ok_or("You are not in a group.")?;
        let group = self.groups.get(&group_id).ok_or("You are not in a group.")?;
        if !group.is_leader(leader) {
            return Err("Only the leader can kick.");
        }
        if leader == target {
            return Err("Use leave instead.");
        }
        if !group.members.contains(&target) {
            return Err("They are not in your group.");
        }
        Ok(self.leave(target).expect("target was a member"))
    }

    /// Round-robin member selection for group-loot modes.
    pub fn next_looter(&mut self, group_id: GroupId) -> Option<SessionId> {
        let group = self.groups.get_mut(&group_id)?;
        let member = group.members[group.loot_index % group.members.len()];
        group.loot_index = (group.loot_index + 1) % group.members.len();
        Some(member)
    }

    pub fn on_disconnect(&mut self, session_id: SessionId) -> Option<LeaveOutcome> {
        self.pending.remove(&session_id);
        self.pending.retain(|_, invite| invite.inviter != session_id);
        self.leave(session_id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::session;

    const TTL: u64 = 30_000;
    const MAX: usize = 5;

    fn grouped_pair(repo: &mut GroupRepo) -> GroupId {
        repo.invite(0, session(1), session(2), TTL, MAX).unwrap();
        let (gid, _) = repo.accept(1, session(2), MAX).unwrap();
        gid
    }

    #[test]
    fn invite_accept_creates_group_with_inviter_leading() {
        let mut repo = GroupRepo::new();
        let gid = grouped_pair(&mut repo);
        let group = repo.get(gid).unwrap();
        assert_eq!(group.leader(), session(1));
        assert_eq!(group.members, vec![session(1), session(2)]);
        assert!(repo.are_grouped(session(1), session(2)));
    }

    #[test]
    fn expired_invite_cannot_be_accepted() {
        let mut repo = GroupRepo::new();
        repo.invite(0, session(1), session(2), TTL, MAX).unwrap();
        assert_eq!(
            repo.accept(TTL + 1, session(2), MAX),
            Err("You have no pending invite.")
        );
    }

    #[test]
    fn duplicate_invite_from_same_inviter_rejected() {
        let mut repo = GroupRepo::new();
        repo.invite(0, session(1), session(2), TTL, MAX).unwrap();
        assert_eq!(
            repo.invite(1, session(1), session(2), TTL, MAX),
            Err("You have already invited them.")
        );
        // A different inviter overwrites; latest invite wins.
        repo.invite(2, session(3), session(2), TTL, MAX).unwrap();
        let (_, inviter) = repo.accept(3, session(2), MAX).unwrap();
        assert_eq!(inviter, session(3));
    }

    #[test]
    fn leader_leaving_passes_leadership() {
        let mut repo = GroupRepo::new();
        let gid = grouped_pair(&mut repo);
        repo.invite(2, session(1), session(3), TTL, MAX).unwrap();
        repo.accept(3, session(3), MAX).unwrap();

        let outcome = repo.leave(session(1)).unwrap();
        assert!(!outcome.disbanded);
        assert_eq!(outcome.new_leader, Some(session(2)));
        assert_eq!(repo.get(gid).unwrap().leader(), session(2));
    }

    #[test]
    fn group_dissolves_below_two() {
        let mut repo = GroupRepo::new();
        grouped_pair(&mut repo);
        let outcome = repo.leave(session(2)).unwrap();
        assert!(outcome.disbanded);
        assert_eq!(repo.group_count(), 0);
        assert!(repo.group_of(session(1)).is_none());
    }

    #[test]
    fn kick_is_leader_only() {
        let mut repo = GroupRepo::new();
        grouped_pair(&mut repo);
        repo.invite(2, session(1), session(3), TTL, MAX).unwrap();
        repo.accept(3, session(3), MAX).unwrap();

        assert_eq!(
            repo.kick(session(2), session(3)),
            Err("Only the leader can kick.")
        );
        let outcome = repo.kick(session(1), session(3)).unwrap();
        assert!(!outcome.disbanded);
        assert!(repo.group_of(session(3)).is_none());
    }

    #[test]
    fn capacity_enforced_at_both_ends() {
        let mut repo = GroupRepo::new();
        repo.invite(0, session(1), session(2), TTL, 2).unwrap();
        repo.accept(1, session(2), 2).unwrap();
        assert_eq!(
            repo.invite(2, session(1), session(3), TTL, 2),
            Err("Your group is full.")
        );
    }

    #[test]
    fn loot_rotation_cycles() {
        let mut repo = GroupRepo::new();
        let gid = grouped_pair(&mut repo);
        assert_eq!(repo.next_looter(gid), Some(session(1)));
        assert_eq!(repo.next_looter(gid), Some(session(2)));
        assert_eq!(repo.next_looter(gid), Some(session(1)));
    }

    #[test]
    fn disconnect_clears_outgoing_invites() {
        let mut repo = GroupRepo::new();
        repo.invite(0, session(1), session(2), TTL, MAX).unwrap();
        repo.on_disconnect(session(1));
        assert!(repo.pending_invite(session(2)).is_none());
    }
}
