// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{RoomId, SessionId, TemplateKey};
use core_protocol::UnixTime;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Clone, Debug, PartialEq)]
pub enum ActionKind {
    RespawnMob {
        template: TemplateKey,
        room: RoomId,
    },
    /// Eager eviction of a pending group invite.
    ExpireInvite {
        invitee: SessionId,
    },
    /// Delayed one-shot text, used by content scripts.
    Announce {
        room: RoomId,
        text: String,
    },
}

#[derive(Clone, Debug)]
pub struct ScheduledAction {
    pub run_at: UnixTime,
    pub kind: ActionKind,
}

struct HeapEntry {
    run_at: UnixTime,
    /// Insertion order, so equal deadlines drain FIFO.
    seq: u64,
    kind: ActionKind,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.run_at.cmp(&other.run_at).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

/// Min-heap of delayed actions with a bounded per-tick drain. Overload
/// detection is plain counters; a backlog must never cost a scan to notice.
pub struct Scheduler {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    next_seq: u64,
    /// Actions drained well past their deadline; a growing value means the
    /// queue is starving.
    pub late_drains: u64,
    /// Deadline slack before a drain counts as late.
    late_threshold_ms: u64,
}

impl Scheduler {
    pub fn new(late_threshold_ms: u64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            late_drains: 0,
            late_threshold_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn schedule(&mut self, run_at: UnixTime, kind: ActionKind) {
        let entry = HeapEntry {
            run_at,
            seq: self.next_seq,
            kind,
        };
        self.next_seq += 1;
        self.heap.push(Reverse(entry));
    }

    /// Up to `max` due actions in (run_at, insertion) order. The rest stay
    /// queued for later ticks.
    pub fn drain_due(&mut self, now: UnixTime, max: usize) -> Vec<ScheduledAction> {
        let mut due = Vec::new();
        while due.len() < max {
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.run_at <= now => {
                    let Reverse(entry) = self.heap.pop().unwrap();
                    if now.saturating_sub(entry.run_at) > self.late_threshold_ms {
                        self.late_drains += 1;
                    }
                    due.push(ScheduledAction {
                        run_at: entry.run_at,
                        kind: entry.kind,
                    });
                }
                _ => break,
            }
        }
        due
    }

    /// O(1) overload signal: queue depth alone, no scan.
    pub fn is_overloaded(&self, depth_limit: usize) -> bool {
        self.heap.len() > depth_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::session;

    fn announce(n: u64) -> ActionKind {
        ActionKind::Announce {
            room: RoomId::new("hub", "plaza"),
            text: format!("event {}", n),
        }
    }

    #[test]
    fn drains_in_deadline_then_insertion_order() {
        let mut scheduler = Scheduler::new(1_000);
        scheduler.schedule(200, announce(1));
        scheduler.schedule(100, announce(2));
        scheduler.schedule(200, announce(3));

        let due = scheduler.drain_due(250, 10);
        let texts: Vec<&str> = due
            .iter()
            .map(|a| match &a.kind {
                ActionKind::Announce { text, .. } => text.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, ["event 2", "event 1", "event 3"]);
    }

    #[test]
    fn drain_is_bounded_and_keeps_remainder() {
        let mut scheduler = Scheduler::new(1_000);
        for i in 0..10 {
            scheduler.schedule(100, announce(i));
        }
        assert_eq!(scheduler.drain_due(100, 4).len(), 4);
        assert_eq!(scheduler.len(), 6);
        assert_eq!(scheduler.drain_due(100, 100).len(), 6);
    }

    #[test]
    fn future_actions_stay() {
        let mut scheduler = Scheduler::new(1_000);
        scheduler.schedule(
            5_000,
            ActionKind::ExpireInvite {
                invitee: session(1),
            },
        );
        assert!(scheduler.drain_due(4_999, 10).is_empty());
        assert_eq!(scheduler.drain_due(5_000, 10).len(), 1);
    }

    #[test]
    fn late_drains_counted_without_scanning() {
        let mut scheduler = Scheduler::new(1_000);
        scheduler.schedule(100, announce(1));
        scheduler.schedule(100, announce(2));
        scheduler.drain_due(5_000, 10);
        assert_eq!(scheduler.late_drains, 2);
        assert!(!scheduler.is_overloaded(16));
    }
}
