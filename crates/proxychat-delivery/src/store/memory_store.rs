//! In-process implementation of [`KeyValueStore`].
//!
//! Keys live in a `DashMap` with optional expiry deadlines measured on the
//! tokio clock, so tests can pause and advance time. Pub/sub goes through a
//! broadcast channel; only subscribers within this process see publishes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{pattern_matches, KeyValueStore, PublishedMessage, PublishedStream};
use crate::{DeliveryError, Result};

const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> DeliveryError {
    DeliveryError::store(format!(
        "WRONGTYPE key {} holds a {}, expected a {}",
        key,
        found.type_name(),
        expected
    ))
}

/// In-memory durable store.
///
/// Cloning is cheap and clones share the same data, which lets several
/// simulated "processes" in a test talk through one store.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
    bus: broadcast::Sender<PublishedMessage>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            entries: Arc::new(DashMap::new()),
            bus,
        }
    }

    /// Whether a live (non-expired) key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.entries.contains_key(key)
    }

    /// Remaining time-to-live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.purge_if_expired(key);
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Read a hash field.
    pub fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        self.purge_if_expired(key);
        self.entries.get(key).and_then(|entry| match &entry.value {
            Value::Hash(map) => map.get(field).cloned(),
            _ => None,
        })
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        if self.entries.remove_if(key, |_, v| v.is_expired(now)).is_some() {
            debug!(key = %key, "Key expired");
        }
    }

    /// Run `f` against the live entry for `key`, creating it with `init` if needed.
    fn with_entry<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T>,
    ) -> Result<T> {
        self.purge_if_expired(key);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => f(&mut occupied.get_mut().value),
            Entry::Vacant(vacant) => {
                let mut stored = StoredValue::new(init());
                let out = f(&mut stored.value)?;
                vacant.insert(stored);
                Ok(out)
            }
        }
    }

    /// Read the live entry for `key` without creating it.
    fn read_entry<T>(&self, key: &str, f: impl FnOnce(&Value) -> Result<T>) -> Result<Option<T>> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => f(&entry.value).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("key_count", &self.entries.len())
            .field("subscribers", &self.bus.receiver_count())
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn list_push_head(&self, key: &str, value: &str) -> Result<()> {
        self.with_entry(
            key,
            || Value::List(VecDeque::new()),
            |v| match v {
                Value::List(list) => {
                    list.push_front(value.to_string());
                    Ok(())
                }
                other => Err(wrong_type(key, "list", other)),
            },
        )
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let items = self.read_entry(key, |v| match v {
            Value::List(list) => Ok(list.iter().cloned().collect()),
            other => Err(wrong_type(key, "list", other)),
        })?;
        Ok(items.unwrap_or_default())
    }

    async fn list_take_all(&self, key: &str) -> Result<Vec<String>> {
        self.purge_if_expired(key);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                if !matches!(occupied.get().value, Value::List(_)) {
                    return Err(wrong_type(key, "list", &occupied.get().value));
                }
                match occupied.remove().value {
                    Value::List(list) => Ok(list.into_iter().collect()),
                    _ => Ok(Vec::new()),
                }
            }
            Entry::Vacant(_) => Ok(Vec::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.purge_if_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.with_entry(
            key,
            || Value::Set(BTreeSet::new()),
            |v| match v {
                Value::Set(set) => Ok(set.insert(member.to_string())),
                other => Err(wrong_type(key, "set", other)),
            },
        )
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let members = self.read_entry(key, |v| match v {
            Value::Set(set) => Ok(set.iter().cloned().collect()),
            other => Err(wrong_type(key, "set", other)),
        })?;
        Ok(members.unwrap_or_default())
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let found = self.read_entry(key, |v| match v {
            Value::Set(set) => Ok(set.contains(member)),
            other => Err(wrong_type(key, "set", other)),
        })?;
        Ok(found.unwrap_or(false))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_entry(
            key,
            || Value::Hash(HashMap::new()),
            |v| match v {
                Value::Hash(map) => {
                    map.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                other => Err(wrong_type(key, "hash", other)),
            },
        )
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        self.purge_if_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Value::Hash(map) => {
                    map.remove(field);
                }
                other => return Err(wrong_type(key, "hash", other)),
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let message = PublishedMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // No subscribers is not an error, same as PUBLISH returning 0.
        let receivers = self.bus.send(message).unwrap_or(0);
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<PublishedStream> {
        let rx = self.bus.subscribe();
        let pattern = pattern.to_string();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Subscriber lagged, dropped published messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| futures::future::ready(pattern_matches(&pattern, &message.channel)));

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_push_head_orders_newest_first() {
        let store = MemoryStore::new();
        store.list_push_head("l", "a").await.unwrap();
        store.list_push_head("l", "b").await.unwrap();

        assert_eq!(store.list_range("l").await.unwrap(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_list_take_all_removes_key() {
        let store = MemoryStore::new();
        store.list_push_head("l", "a").await.unwrap();

        assert_eq!(store.list_take_all("l").await.unwrap(), vec!["a"]);
        assert!(!store.contains_key("l"));
        assert!(store.list_take_all("l").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_is_store_error() {
        let store = MemoryStore::new();
        store.set_add("k", "1").await.unwrap();

        let err = store.list_push_head("k", "x").await.unwrap_err();
        assert!(err.is_store());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_removes_key_after_ttl() {
        let store = MemoryStore::new();
        store.list_push_head("l", "a").await.unwrap();
        store.expire("l", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.contains_key("l"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.contains_key("l"));
        assert!(store.list_range("l").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_expiry_starts_fresh_list() {
        let store = MemoryStore::new();
        store.list_push_head("l", "old").await.unwrap();
        store.expire("l", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        store.list_push_head("l", "new").await.unwrap();
        assert_eq!(store.list_range("l").await.unwrap(), vec!["new"]);
        assert_eq!(store.ttl("l"), None);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        assert!(store.set_add("group:1", "10").await.unwrap());
        assert!(!store.set_add("group:1", "10").await.unwrap());
        assert!(store.set_add("group:1", "11").await.unwrap());

        assert!(store.set_is_member("group:1", "11").await.unwrap());
        assert!(!store.set_is_member("group:1", "12").await.unwrap());
        assert_eq!(store.set_members("group:1").await.unwrap(), vec!["10", "11"]);
        assert!(store.set_members("group:2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_set_and_delete() {
        let store = MemoryStore::new();
        store.hash_set("active_users", "1", "addr").await.unwrap();
        assert_eq!(store.hash_get("active_users", "1").as_deref(), Some("addr"));

        store.hash_delete("active_users", "1").await.unwrap();
        assert_eq!(store.hash_get("active_users", "1"), None);
    }

    #[tokio::test]
    async fn test_psubscribe_filters_by_pattern() {
        let store = MemoryStore::new();
        let mut stream = store.psubscribe("ws:*").await.unwrap();

        store.publish("other:1", "ignored").await.unwrap();
        store.publish("ws:7", "hello").await.unwrap();

        let received = stream.next().await.unwrap();
        assert_eq!(received.channel, "ws:7");
        assert_eq!(received.payload, "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        assert!(store.publish("ws:1", "x").await.is_ok());
    }
}
