// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::num::{NonZeroU16, NonZeroU32, NonZeroU64, ParseIntError};
use std::str::FromStr;
use std::sync::Arc;

/// Identifies a live connection for its whole life, including across engine handoff.
///
/// Composed of {timestamp_ms: 41 bits, gateway lease: 10 bits, counter: 12 bits}.
/// Within one lease, ids are strictly monotonic; across leases there is no ordering.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SessionId(pub NonZeroU64);

impl SessionId {
    pub const TIMESTAMP_BITS: u32 = 41;
    pub const LEASE_BITS: u32 = 10;
    pub const COUNTER_BITS: u32 = 12;

    pub const MAX_LEASE: u16 = (1 << Self::LEASE_BITS) - 1;
    pub const MAX_COUNTER: u16 = (1 << Self::COUNTER_BITS) - 1;

    /// Returns [`None`] if the composite would be zero (only possible with an
    /// all-zero timestamp, lease, and counter, which no live allocator produces).
    pub fn compose(timestamp_ms: u64, lease: LeaseId, counter: u16) -> Option<Self> {
        debug_assert!(timestamp_ms < 1 << Self::TIMESTAMP_BITS);
        debug_assert!(counter <= Self::MAX_COUNTER);
        let bits = (timestamp_ms & ((1 << Self::TIMESTAMP_BITS) - 1))
            << (Self::LEASE_BITS + Self::COUNTER_BITS)
            | (lease.0 as u64) << Self::COUNTER_BITS
            | counter as u64;
        NonZeroU64::new(bits).map(Self)
    }

    pub fn timestamp_ms(self) -> u64 {
        self.0.get() >> (Self::LEASE_BITS + Self::COUNTER_BITS)
    }

    pub fn lease(self) -> LeaseId {
        LeaseId(((self.0.get() >> Self::COUNTER_BITS) & Self::MAX_LEASE as u64) as u16)
    }

    pub fn counter(self) -> u16 {
        (self.0.get() & Self::MAX_COUNTER as u64) as u16
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A gateway's allocation lease, granted by the coordinator (lease 0 in
/// single-process mode). Valid values fit in 10 bits.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub u16);

impl LeaseId {
    pub fn new(value: u16) -> Option<Self> {
        (value <= SessionId::MAX_LEASE).then_some(Self(value))
    }
}

/// Identifies a persisted account. Assigned once by the persistence layer.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub NonZeroU64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EngineId(pub NonZeroU16);

impl EngineId {
    pub fn new(value: u16) -> Option<Self> {
        NonZeroU16::new(value).map(Self)
    }
}

impl Display for EngineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

impl FromStr for EngineId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim_start_matches("engine-").parse()?))
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct GatewayId(pub NonZeroU16);

impl GatewayId {
    pub fn new(value: u16) -> Option<Self> {
        NonZeroU16::new(value).map(Self)
    }
}

impl Display for GatewayId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "gateway-{}", self.0)
    }
}

/// A named slice of the world; the atomic unit of engine ownership.
#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ZoneId(Arc<str>);

impl ZoneId {
    pub fn new(name: &str) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ZoneId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rooms are addressed "zone:local". Cross-zone exits reference rooms whose
/// zone may not be loaded on this engine.
#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn new(zone: &str, local: &str) -> Self {
        debug_assert!(!zone.contains(':'));
        Self(format!("{}:{}", zone, local).into())
    }

    /// Parses "zone:local"; rejects ids without a zone prefix.
    pub fn parse(s: &str) -> Option<Self> {
        s.contains(':').then(|| Self(s.into()))
    }

    pub fn zone(&self) -> ZoneId {
        ZoneId::new(self.zone_str())
    }

    pub fn zone_str(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn local(&self) -> &str {
        self.0.split_once(':').map(|(_, l)| l).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mob ids carry the same zone prefix as the room that spawned them, plus a
/// spawn serial, e.g. "hub:rat#3".
#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MobId(Arc<str>);

impl MobId {
    pub fn new(zone: &str, local: &str, serial: u64) -> Self {
        Self(format!("{}:{}#{}", zone, local, serial).into())
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.contains(':').then(|| Self(s.into()))
    }

    pub fn zone_str(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A runtime item instance (not its template).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ItemId(pub NonZeroU64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub NonZeroU32);

/// A parallel copy of a zone, for load distribution.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub NonZeroU32);

/// Content key of a mob/item template.
#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TemplateKey(Arc<str>);

impl TemplateKey {
    pub fn new(key: &str) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AbilityId(Arc<str>);

impl AbilityId {
    pub fn new(key: &str) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Content key of a status-effect definition.
#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EffectId(Arc<str>);

impl EffectId {
    pub fn new(key: &str) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct QuestId(Arc<str>);

impl QuestId {
    pub fn new(key: &str) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AchievementId(Arc<str>);

impl AchievementId {
    pub fn new(key: &str) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use crate::id::{LeaseId, MobId, RoomId, SessionId};

    #[test]
    fn session_id_round_trip() {
        let lease = LeaseId::new(37).unwrap();
        for (ts, counter) in [(1u64, 0u16), (1_650_000_000_000, 4095), ((1 << 41) - 1, 1)] {
            let sid = SessionId::compose(ts, lease, counter).unwrap();
            assert_eq!(sid.timestamp_ms(), ts);
            assert_eq!(sid.lease(), lease);
            assert_eq!(sid.counter(), counter);
        }
    }

    #[test]
    fn session_id_monotonic_within_lease() {
        let lease = LeaseId::default();
        let a = SessionId::compose(1000, lease, 5).unwrap();
        let b = SessionId::compose(1000, lease, 6).unwrap();
        let c = SessionId::compose(1001, lease, 0).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn lease_id_bounds() {
        assert!(LeaseId::new(SessionId::MAX_LEASE).is_some());
        assert!(LeaseId::new(SessionId::MAX_LEASE + 1).is_none());
    }

    #[test]
    fn room_id_parts() {
        let id = RoomId::parse("hub:plaza").unwrap();
        assert_eq!(id.zone_str(), "hub");
        assert_eq!(id.local(), "plaza");
        assert!(RoomId::parse("no-zone").is_none());
    }

    #[test]
    fn mob_id_zone() {
        let id = MobId::new("forest", "wolf", 2);
        assert_eq!(id.as_str(), "forest:wolf#2");
        assert_eq!(id.zone_str(), "forest");
    }
}
