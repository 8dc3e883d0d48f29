// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Boundary to the external persistence collaborator. The engine only ever
//! sees this trait; reads/writes happen on worker threads, never the tick
//! thread. The in-memory implementation backs tests and the default
//! standalone run.

use core_protocol::dto::{PlayerClass, PlayerRecordDto, Race};
use core_protocol::id::{PlayerId, RoomId};
use core_protocol::name::PlayerName;
use core_protocol::UnixTime;
use log::warn;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Mutex;
use world::templates::rules;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PersistError {
    /// Unique-name constraint across live records.
    NameTaken,
    /// Backend unreachable or failed; callers retry or degrade.
    Unavailable,
}

#[derive(Clone, Debug)]
pub struct CreateRecord {
    pub name: PlayerName,
    pub race: Race,
    pub class: PlayerClass,
    pub room_id: RoomId,
}

/// Contract: reads see previously returned writes; `save` is an idempotent
/// whole-record overwrite keyed by id; names are unique case-insensitively.
pub trait PlayerRecordRepo: Send + Sync {
    fn find_by_name(&self, name: &str) -> Result<Option<PlayerRecordDto>, PersistError>;
    fn find_by_id(&self, id: PlayerId) -> Result<Option<PlayerRecordDto>, PersistError>;
    fn create(&self, request: CreateRecord) -> Result<PlayerRecordDto, PersistError>;
    fn save(&self, record: &PlayerRecordDto) -> Result<(), PersistError>;
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<PlayerId, PlayerRecordDto>,
    by_name: HashMap<String, PlayerId>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryRecordRepo {
    inner: Mutex<MemoryInner>,
}

impl MemoryRecordRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlayerRecordRepo for MemoryRecordRepo {
    fn find_by_name(&self, name: &str) -> Result<Option<PlayerRecordDto>, PersistError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_name
            .get(&name.to_ascii_lowercase())
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    fn find_by_id(&self, id: PlayerId) -> Result<Option<PlayerRecordDto>, PersistError> {
        Ok(self.inner.lock().unwrap().records.get(&id).cloned())
    }

    fn create(&self, request: CreateRecord) -> Result<PlayerRecordDto, PersistError> {
        let mut inner = self.inner.lock().unwrap();
        let canonical = request.name.canonical();
        if inner.by_name.contains_key(&canonical) {
            return Err(PersistError::NameTaken);
        }
        inner.next_id += 1;
        let player_id = PlayerId(NonZeroU64::new(inner.next_id).unwrap());
        let record = PlayerRecordDto {
            player_id,
            name: request.name,
            room_id: request.room_id,
            race: request.race,
            class: request.class,
            level: 1,
            xp_total: 0,
            gold: 0,
            base_stats: rules::starting_stats(request.race, request.class),
            is_staff: false,
            completed_quests: vec![],
            unlocked_achievements: vec![],
            active_title: None,
            last_seen: 0,
        };
        inner.by_name.insert(canonical, player_id);
        inner.records.insert(player_id, record.clone());
        Ok(record)
    }

    fn save(&self, record: &PlayerRecordDto) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .by_name
            .insert(record.name.canonical(), record.player_id);
        inner.records.insert(record.player_id, record.clone());
        Ok(())
    }
}

/// Where flushed records go. Production hands them to a worker thread; the
/// tick thread never waits on the backend.
pub trait SaveSink: Send {
    fn save(&self, record: PlayerRecordDto);
}

/// Worker thread draining saves into the repository.
pub struct SaveWorker {
    tx: std::sync::mpsc::Sender<PlayerRecordDto>,
}

impl SaveWorker {
    pub fn spawn(repo: std::sync::Arc<dyn PlayerRecordRepo>) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<PlayerRecordDto>();
        std::thread::Builder::new()
            .name("save-worker".to_owned())
            .spawn(move || {
                while let Ok(record) = rx.recv() {
                    if let Err(e) = repo.save(&record) {
                        warn!("deferred save failed for {}: {:?}", record.name, e);
                    }
                }
            })
            .expect("failed to spawn save worker");
        Self { tx }
    }
}

impl SaveSink for SaveWorker {
    fn save(&self, record: PlayerRecordDto) {
        if self.tx.send(record).is_err() {
            warn!("save worker is gone");
        }
    }
}

/// Synchronous sink for tests.
pub struct InlineSaves(pub std::sync::Arc<dyn PlayerRecordRepo>);

impl SaveSink for InlineSaves {
    fn save(&self, record: PlayerRecordDto) {
        if let Err(e) = self.0.save(&record) {
            warn!("save failed for {}: {:?}", record.name, e);
        }
    }
}

/// Write-behind wrapper. Progress hooks queue records freely; at most one
/// save per player reaches the sink per flush interval, and the last queued
/// snapshot wins.
pub struct SaveCoalescer {
    pending: HashMap<PlayerId, PlayerRecordDto>,
    sink: Box<dyn SaveSink>,
    flush_interval_ms: u64,
    last_flush: UnixTime,
}

impl SaveCoalescer {
    pub fn new(sink: Box<dyn SaveSink>, flush_interval_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            sink,
            flush_interval_ms,
            last_flush: 0,
        }
    }

    pub fn queue(&mut self, record: PlayerRecordDto) {
        self.pending.insert(record.player_id, record);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushes when the interval elapsed (or `force`), e.g. on shutdown and
    /// on handoff commit.
    pub fn flush(&mut self, now: UnixTime, force: bool) {
        if !force && now.saturating_sub(self.last_flush) < self.flush_interval_ms {
            return;
        }
        self.last_flush = now;
        for record in std::mem::take(&mut self.pending).into_values() {
            self.sink.save(record);
        }
    }

    /// Drops any queued write for a player whose authority moved elsewhere.
    pub fn forget(&mut self, player_id: PlayerId) {
        self.pending.remove(&player_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_req(name: &str) -> CreateRecord {
        CreateRecord {
            name: PlayerName::new(name).unwrap(),
            race: Race::Human,
            class: PlayerClass::Warrior,
            room_id: RoomId::new("hub", "plaza"),
        }
    }

    #[test]
    fn create_then_find_case_insensitive() {
        let repo = MemoryRecordRepo::new();
        let record = repo.create(create_req("Alice")).unwrap();
        let found = repo.find_by_name("ALICE").unwrap().unwrap();
        assert_eq!(found.player_id, record.player_id);
        assert_eq!(repo.create(create_req("aLiCe")), Err(PersistError::NameTaken));
    }

    #[test]
    fn save_is_idempotent() {
        let repo = MemoryRecordRepo::new();
        let mut record = repo.create(create_req("Alice")).unwrap();
        record.gold = 42;
        repo.save(&record).unwrap();
        repo.save(&record).unwrap();
        let found = repo.find_by_id(record.player_id).unwrap().unwrap();
        assert_eq!(found.gold, 42);
    }

    #[test]
    fn coalescer_keeps_last_snapshot_only() {
        let repo = std::sync::Arc::new(MemoryRecordRepo::new());
        let mut record = repo.create(create_req("Alice")).unwrap();
        let mut saves = SaveCoalescer::new(Box::new(InlineSaves(repo.clone())), 1_000);

        record.gold = 1;
        saves.queue(record.clone());
        record.gold = 7;
        saves.queue(record.clone());
        assert_eq!(saves.pending_len(), 1);

        // Not yet due.
        saves.flush(500, false);
        assert_eq!(saves.pending_len(), 1);

        saves.flush(1_500, false);
        assert_eq!(saves.pending_len(), 0);
        assert_eq!(repo.find_by_id(record.player_id).unwrap().unwrap().gold, 7);
    }
}
