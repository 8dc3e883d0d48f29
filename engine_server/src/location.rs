// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::EngineId;
use server_util::broker::KvStore;
use std::collections::HashMap;
use std::sync::Arc;

/// O(1) "which engine has this player" index, keyed by lower-cased name.
/// Updated on login, logout, and handoff commit; the coordinator store makes
/// it visible across processes. Used to route cross-engine tells.
pub struct LocationIndex {
    local: HashMap<String, EngineId>,
    store: Option<Arc<dyn KvStore>>,
}

fn key(name: &str) -> String {
    format!("player/{}/engine", name.to_ascii_lowercase())
}

impl LocationIndex {
    pub fn new(store: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            local: HashMap::new(),
            store,
        }
    }

    pub fn set(&mut self, name: &str, engine: EngineId) {
        self.local.insert(name.to_ascii_lowercase(), engine);
        if let Some(store) = &self.store {
            store.put(&key(name), engine.to_string());
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.local.remove(&name.to_ascii_lowercase());
        if let Some(store) = &self.store {
            store.remove(&key(name));
        }
    }

    /// Drops only the local cache entry; used by the sending side of a
    /// handoff, where the receiver's coordinator write must win.
    pub fn evict_local(&mut self, name: &str) {
        self.local.remove(&name.to_ascii_lowercase());
    }

    pub fn lookup(&self, name: &str) -> Option<EngineId> {
        if let Some(engine) = self.local.get(&name.to_ascii_lowercase()) {
            return Some(*engine);
        }
        self.store
            .as_ref()
            .and_then(|store| store.get(&key(name)))
            .and_then(|value| value.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use server_util::broker::MemoryKvStore;

    fn engine(n: u16) -> EngineId {
        EngineId::new(n).unwrap()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut index = LocationIndex::new(None);
        index.set("Alice", engine(1));
        assert_eq!(index.lookup("ALICE"), Some(engine(1)));
        index.remove("alice");
        assert_eq!(index.lookup("Alice"), None);
    }

    #[test]
    fn store_backed_lookup_crosses_instances() {
        let store = MemoryKvStore::new();
        let mut a = LocationIndex::new(Some(store.clone() as Arc<dyn KvStore>));
        let b = LocationIndex::new(Some(store as Arc<dyn KvStore>));

        a.set("Alice", engine(2));
        // b has no local entry but resolves through the coordinator.
        assert_eq!(b.lookup("alice"), Some(engine(2)));
    }
}
