// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::event::ScaleAction;
use core_protocol::id::{EngineId, InstanceId, ZoneId};
use core_protocol::UnixTime;
use server_util::broker::KvStore;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct InstanceState {
    pub id: InstanceId,
    pub player_count: u32,
    pub capacity: u32,
}

#[derive(Clone, Debug)]
pub struct ZoneAssignment {
    pub owner: EngineId,
    pub instances: Vec<InstanceState>,
}

/// How the router picks an instance for an arriving player.
#[derive(Clone, Copy, Debug)]
pub enum InstancePolicy {
    LeastLoaded,
    /// Keep a returning player on their previous instance if it has room.
    Sticky(InstanceId),
    /// Avoid the given instance (e.g. the party leader's, for pvp modes).
    AntiAffinity(InstanceId),
}

#[derive(Default)]
struct ScaleTracker {
    above_since: Option<UnixTime>,
    below_since: Option<UnixTime>,
}

/// Zone -> owning engine and instance bookkeeping, optionally mirrored to
/// the coordinator store under `zone/<zone>/...` keys.
pub struct ZoneRepo {
    assignments: HashMap<ZoneId, ZoneAssignment>,
    trackers: HashMap<ZoneId, ScaleTracker>,
    store: Option<Arc<dyn KvStore>>,
    high_water: u32,
    low_water: u32,
    sustain_ms: u64,
    cooldown_ms: u64,
}

impl ZoneRepo {
    pub fn new(
        store: Option<Arc<dyn KvStore>>,
        high_water: u32,
        low_water: u32,
        sustain_ms: u64,
        cooldown_ms: u64,
    ) -> Self {
        Self {
            assignments: HashMap::new(),
            trackers: HashMap::new(),
            store,
            high_water,
            low_water,
            sustain_ms,
            cooldown_ms,
        }
    }

    /// Declares ownership with one initial instance. Exactly one engine owns
    /// a loaded zone; last write wins in the store, so deployments hand out
    /// static non-overlapping assignments.
    pub fn assign(&mut self, zone: ZoneId, owner: EngineId, capacity: u32) {
        debug_assert!(capacity >= 1);
        if let Some(store) = &self.store {
            store.put(&format!("zone/{}/owner", zone), owner.to_string());
            store.put(&format!("zone/{}/instance/1/count", zone), "0".to_owned());
        }
        self.assignments.insert(
            zone,
            ZoneAssignment {
                owner,
                instances: vec![InstanceState {
                    id: InstanceId(NonZeroU32::new(1).unwrap()),
                    player_count: 0,
                    capacity,
                }],
            },
        );
    }

    /// Records that another engine owns a zone, for routing decisions.
    /// Instance bookkeeping stays with the owner.
    pub fn declare_remote(&mut self, zone: ZoneId, owner: EngineId) {
        self.assignments.entry(zone).or_insert(ZoneAssignment {
            owner,
            instances: Vec::new(),
        });
    }

    pub fn owner(&self, zone: &ZoneId) -> Option<EngineId> {
        if let Some(assignment) = self.assignments.get(zone) {
            return Some(assignment.owner);
        }
        self.store
            .as_ref()
            .and_then(|store| store.get(&format!("zone/{}/owner", zone)))
            .and_then(|value| value.parse().ok())
    }

    pub fn owns(&self, engine: EngineId, zone: &ZoneId) -> bool {
        self.owner(zone) == Some(engine)
    }

    pub fn instances(&self, zone: &ZoneId) -> &[InstanceState] {
        self.assignments
            .get(zone)
            .map(|a| a.instances.as_slice())
            .unwrap_or(&[])
    }

    pub fn select_instance(&self, zone: &ZoneId, policy: InstancePolicy) -> Option<InstanceId> {
        let instances = self.instances(zone);
        if instances.is_empty() {
            return None;
        }
        let open = |i: &&InstanceState| i.player_count < i.capacity;
        match policy {
            InstancePolicy::Sticky(previous) => instances
                .iter()
                .find(|i| i.id == previous)
                .filter(open)
                .map(|i| i.id)
                .or_else(|| self.select_instance(zone, InstancePolicy::LeastLoaded)),
            InstancePolicy::AntiAffinity(avoid) => instances
                .iter()
                .filter(|i| i.id != avoid)
                .filter(open)
                .min_by_key(|i| i.player_count)
                .map(|i| i.id)
                .or_else(|| self.select_instance(zone, InstancePolicy::LeastLoaded)),
            InstancePolicy::LeastLoaded => instances
                .iter()
                .filter(open)
                .min_by_key(|i| i.player_count)
                .or_else(|| instances.iter().min_by_key(|i| i.player_count))
                .map(|i| i.id),
        }
    }

    /// Reports an instance's population and applies threshold hysteresis.
    /// Returns a decision when the sustained load crosses a watermark.
    pub fn record_count(
        &mut self,
        now: UnixTime,
        zone: &ZoneId,
        instance: InstanceId,
        count: u32,
    ) -> Option<ScaleAction> {
        let assignment = self.assignments.get_mut(zone)?;
        let entry = assignment.instances.iter_mut().find(|i| i.id == instance)?;
        entry.player_count = count;
        if let Some(store) = &self.store {
            store.put(
                &format!("zone/{}/instance/{}/count", zone, instance.0),
                count.to_string(),
            );
        }

        let instances = assignment.instances.len() as u32;
        let total: u32 = assignment.instances.iter().map(|i| i.player_count).sum();
        let average = total / instances;

        let tracker = self.trackers.entry(zone.clone()).or_default();
        if average > self.high_water {
            tracker.below_since = None;
            let since = *tracker.above_since.get_or_insert(now);
            if now.saturating_sub(since) >= self.sustain_ms {
                tracker.above_since = None;
                return Some(ScaleAction::Up);
            }
        } else if average < self.low_water {
            tracker.above_since = None;
            let since = *tracker.below_since.get_or_insert(now);
            // Never drop the last instance.
            if now.saturating_sub(since) >= self.cooldown_ms && instances > 1 {
                tracker.below_since = None;
                return Some(ScaleAction::Down);
            }
        } else {
            tracker.above_since = None;
            tracker.below_since = None;
        }
        None
    }

    pub fn add_instance(&mut self, zone: &ZoneId, capacity: u32) -> Option<InstanceId> {
        let assignment = self.assignments.get_mut(zone)?;
        let next = assignment
            .instances
            .iter()
            .map(|i| i.id.0.get())
            .max()
            .unwrap_or(0)
            + 1;
        let id = InstanceId(NonZeroU32::new(next).unwrap());
        assignment.instances.push(InstanceState {
            id,
            player_count: 0,
            capacity,
        });
        if let Some(store) = &self.store {
            store.put(&format!("zone/{}/instance/{}/count", zone, next), "0".to_owned());
        }
        Some(id)
    }

    pub fn remove_instance(&mut self, zone: &ZoneId, instance: InstanceId) -> bool {
        let Some(assignment) = self.assignments.get_mut(zone) else {
            return false;
        };
        if assignment.instances.len() <= 1 {
            return false;
        }
        let before = assignment.instances.len();
        assignment.instances.retain(|i| i.id != instance);
        let removed = assignment.instances.len() < before;
        if removed {
            if let Some(store) = &self.store {
                store.remove(&format!("zone/{}/instance/{}/count", zone, instance.0));
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneId {
        ZoneId::new("hub")
    }

    fn engine(n: u16) -> EngineId {
        EngineId::new(n).unwrap()
    }

    fn instance(n: u32) -> InstanceId {
        InstanceId(NonZeroU32::new(n).unwrap())
    }

    fn repo() -> ZoneRepo {
        let mut repo = ZoneRepo::new(None, 80, 20, 30_000, 120_000);
        repo.assign(zone(), engine(1), 100);
        repo
    }

    #[test]
    fn owner_resolves_through_store() {
        let store = server_util::broker::MemoryKvStore::new();
        let mut a = ZoneRepo::new(Some(store.clone() as _), 80, 20, 1, 1);
        a.assign(zone(), engine(2), 100);

        let b = ZoneRepo::new(Some(store as _), 80, 20, 1, 1);
        assert_eq!(b.owner(&zone()), Some(engine(2)));
        assert!(b.owns(engine(2), &zone()));
    }

    #[test]
    fn least_loaded_selection() {
        let mut repo = repo();
        repo.add_instance(&zone(), 100).unwrap();
        repo.record_count(0, &zone(), instance(1), 50);
        repo.record_count(0, &zone(), instance(2), 10);
        assert_eq!(
            repo.select_instance(&zone(), InstancePolicy::LeastLoaded),
            Some(instance(2))
        );
    }

    #[test]
    fn sticky_falls_back_when_full() {
        let mut repo = repo();
        let second = repo.add_instance(&zone(), 10).unwrap();
        repo.record_count(0, &zone(), second, 10);
        assert_eq!(
            repo.select_instance(&zone(), InstancePolicy::Sticky(second)),
            Some(instance(1))
        );
    }

    #[test]
    fn anti_affinity_avoids_given_instance() {
        let mut repo = repo();
        let second = repo.add_instance(&zone(), 100).unwrap();
        assert_eq!(
            repo.select_instance(&zone(), InstancePolicy::AntiAffinity(instance(1))),
            Some(second)
        );
    }

    #[test]
    fn scale_up_requires_sustained_load() {
        let mut repo = repo();
        assert_eq!(repo.record_count(0, &zone(), instance(1), 90), None);
        // Not sustained long enough yet.
        assert_eq!(repo.record_count(10_000, &zone(), instance(1), 95), None);
        assert_eq!(
            repo.record_count(30_000, &zone(), instance(1), 95),
            Some(ScaleAction::Up)
        );
        // A dip resets the window.
        assert_eq!(repo.record_count(31_000, &zone(), instance(1), 50), None);
        assert_eq!(repo.record_count(32_000, &zone(), instance(1), 95), None);
    }

    #[test]
    fn never_scales_below_one_instance() {
        let mut repo = repo();
        for t in [0u64, 200_000] {
            assert_eq!(repo.record_count(t, &zone(), instance(1), 0), None);
        }
        assert!(!repo.remove_instance(&zone(), instance(1)));
    }
}
