// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Minimal coordinator abstractions: a topic broker for pub/sub fan-out and
//! a key-value store for shared assignments (zone ownership, player
//! locations). The in-memory implementations serve the single-process mode
//! and tests; multi-process deployments provide clients for an external
//! broker behind these same traits.

use std::collections::btree_map::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Subscriber = Box<dyn Fn(Arc<[u8]>) + Send + Sync>;

/// Fire-and-forget fan-out of opaque bytes to every subscriber of a topic.
/// Delivery runs on the publisher's thread; subscribers must only enqueue.
pub trait TopicBroker: Send + Sync {
    fn publish(&self, topic: &str, bytes: Arc<[u8]>);
    fn subscribe(&self, topic: &str, subscriber: Subscriber);
}

/// Acknowledged key-value writes; `put` has been applied (and is visible to
/// every reader) when it returns.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
    fn remove(&self, key: &str);
    /// Key/value pairs under a prefix, in key order.
    fn list_prefix(&self, prefix: &str) -> Vec<(String, String)>;
}

#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl TopicBroker for MemoryBroker {
    fn publish(&self, topic: &str, bytes: Arc<[u8]>) {
        let topics = self.topics.lock().unwrap();
        if let Some(subscribers) = topics.get(topic) {
            for subscriber in subscribers {
                subscriber(Arc::clone(&bytes));
            }
        }
    }

    fn subscribe(&self, topic: &str, subscriber: Subscriber) {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(subscriber);
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn list_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .lock()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::{KvStore, MemoryBroker, MemoryKvStore, TopicBroker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            broker.subscribe(
                "events",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        broker.publish("events", Arc::from(&b"x"[..]));
        broker.publish("other", Arc::from(&b"x"[..]));
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn kv_prefix_listing() {
        let store = MemoryKvStore::new();
        store.put("zone/hub/owner", "engine-1".to_owned());
        store.put("zone/hub/instance/1/count", "4".to_owned());
        store.put("player/alice/engine", "engine-1".to_owned());

        let zone_keys = store.list_prefix("zone/hub/");
        assert_eq!(zone_keys.len(), 2);
        store.remove("zone/hub/owner");
        assert!(store.get("zone/hub/owner").is_none());
    }
}
