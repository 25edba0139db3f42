use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::fanout::Fanout;
use crate::lock_table::LockTable;
use crate::{
    Cache, CacheError, CacheResult, LockGuard, Subscription, SubscriptionId, SESSION_SIZE_FIELD,
};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

// Delivery is close to a rendezvous: publishers wait on slow subscribers.
const SUBSCRIBER_BUFFER: usize = 1;

/// Single-process [`Cache`]. Data sits behind one reader/writer lock; named
/// locks and pub/sub live in their own tables.
#[derive(Default)]
pub struct MemoryCache {
    data: RwLock<Data>,
    fanout: Fanout,
    locks: Arc<LockTable>,
}

#[derive(Default)]
struct Data {
    entries: HashMap<String, Entry>,
    expirations: BTreeSet<(Instant, String)>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Sorted(SortedSet),
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(score) = self.scores.remove(member) {
            self.ordered.remove(&(score, member.to_string()));
        }
    }

    fn pop_range(&mut self, min: i64, max: i64) -> Vec<String> {
        if min > max {
            return Vec::new();
        }
        let popped: Vec<(i64, String)> = self
            .ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .cloned()
            .collect();
        for item in &popped {
            self.ordered.remove(item);
            self.scores.remove(&item.1);
        }
        popped.into_iter().map(|(_, member)| member).collect()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

impl Data {
    fn read(&self, key: &str, now: Instant) -> Option<&Value> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| &entry.value)
    }

    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if matches!(self.entries.get(key), Some(entry) if !entry.is_live(now)) {
            self.delete(key);
        }
    }

    fn insert(&mut self, key: &str, value: Value, expires_at: Option<Instant>) {
        self.delete(key);
        if let Some(at) = expires_at {
            self.expirations.insert((at, key.to_string()));
        }
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                if let Some(at) = entry.expires_at {
                    self.expirations.remove(&(at, key.to_string()));
                }
                true
            }
            None => false,
        }
    }

    fn set_expiration(&mut self, key: &str, at: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            if let Some(previous) = entry.expires_at.replace(at) {
                self.expirations.remove(&(previous, key.to_string()));
            }
            self.expirations.insert((at, key.to_string()));
        }
    }

    fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((at, _)) = self.expirations.first() {
            if *at > now {
                break;
            }
            let Some((at, key)) = self.expirations.pop_first() else {
                break;
            };
            let current = self.entries.get(&key).and_then(|entry| entry.expires_at);
            if current == Some(at) {
                self.entries.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }

    fn value_mut(&mut self, key: &str, now: Instant, empty: fn() -> Value) -> &mut Value {
        self.purge_if_expired(key, now);
        &mut self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: empty(),
                expires_at: None,
            })
            .value
    }

    fn hash_mut(&mut self, key: &str, now: Instant) -> CacheResult<&mut HashMap<String, String>> {
        match self.value_mut(key, now, || Value::Hash(HashMap::new())) {
            Value::Hash(fields) => Ok(fields),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str, now: Instant) -> CacheResult<&mut HashSet<String>> {
        match self.value_mut(key, now, || Value::Set(HashSet::new())) {
            Value::Set(members) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_mut(&mut self, key: &str, now: Instant) -> CacheResult<&mut SortedSet> {
        match self.value_mut(key, now, || Value::Sorted(SortedSet::default())) {
            Value::Sorted(set) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    /// Deletes `key` if the container stored there became empty.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|entry| &entry.value) {
            Some(Value::Hash(fields)) => fields.is_empty(),
            Some(Value::Set(members)) => members.is_empty(),
            Some(Value::Sorted(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.delete(key);
        }
    }

    fn hash_field(&self, key: &str, field: &str, now: Instant) -> CacheResult<Option<&String>> {
        match self.read(key, now) {
            Some(Value::Hash(fields)) => Ok(fields.get(field)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::WrongType {
        key: key.to_string(),
    }
}

fn parse_counter(key: &str, raw: Option<&String>) -> CacheResult<i64> {
    match raw {
        Some(raw) => raw.parse().map_err(|_| CacheError::NotAnInteger {
            key: key.to_string(),
        }),
        None => Ok(0),
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evicts entries past their deadline and returns how many went away.
    pub fn evict_expired(&self) -> usize {
        self.data.write().evict_expired(Instant::now())
    }

    /// Runs [`MemoryCache::evict_expired`] every `period` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let evicted = cache.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "evicted expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.data.read().read(key, Instant::now()).is_some())
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        match self.data.read().read(key, Instant::now()) {
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        expires: Option<Duration>,
    ) -> CacheResult<()> {
        let now = Instant::now();
        self.data
            .write()
            .insert(key, Value::Str(value.to_string()), expires.map(|ttl| now + ttl));
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, expires: Option<Duration>) -> CacheResult<i64> {
        let now = Instant::now();
        let mut data = self.data.write();
        data.purge_if_expired(key, now);
        let next = match data.entries.get_mut(key) {
            Some(Entry {
                value: Value::Str(raw),
                ..
            }) => {
                let next = parse_counter(key, Some(&*raw))? + by;
                *raw = next.to_string();
                next
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                data.insert(key, Value::Str(by.to_string()), None);
                by
            }
        };
        if let Some(ttl) = expires {
            data.set_expiration(key, now + ttl);
        }
        Ok(next)
    }

    async fn remove(&self, keys: &[String]) -> CacheResult<()> {
        let mut data = self.data.write();
        for key in keys {
            data.delete(key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, expires: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut data = self.data.write();
        data.purge_if_expired(key, now);
        data.set_expiration(key, now + expires);
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> CacheResult<()> {
        let mut data = self.data.write();
        let hash = data.hash_mut(key, Instant::now())?;
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
        data.drop_if_empty(key);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let data = self.data.read();
        Ok(data.hash_field(key, field, Instant::now())?.cloned())
    }

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        match self.data.read().read(key, Instant::now()) {
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_increment(&self, key: &str, field: &str, by: i64) -> CacheResult<i64> {
        let mut data = self.data.write();
        let hash = data.hash_mut(key, Instant::now())?;
        let next = parse_counter(key, hash.get(field))? + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_remove(&self, key: &str, fields: &[&str]) -> CacheResult<()> {
        let mut data = self.data.write();
        let hash = data.hash_mut(key, Instant::now())?;
        for field in fields {
            hash.remove(*field);
        }
        data.drop_if_empty(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut data = self.data.write();
        data.set_mut(key, Instant::now())?.insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut data = self.data.write();
        let removed = data.set_mut(key, Instant::now())?.remove(member);
        data.drop_if_empty(key);
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        match self.data.read().read(key, Instant::now()) {
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> CacheResult<()> {
        let mut data = self.data.write();
        data.sorted_mut(key, Instant::now())?.insert(member, score);
        Ok(())
    }

    async fn sorted_set_pop_range(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> CacheResult<Vec<String>> {
        let mut data = self.data.write();
        let popped = data.sorted_mut(key, Instant::now())?.pop_range(min, max);
        data.drop_if_empty(key);
        Ok(popped)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut data = self.data.write();
        data.sorted_mut(key, Instant::now())?.remove(member);
        data.drop_if_empty(key);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<Subscription> {
        let (subscription, _) = self.fanout.add(channel, SUBSCRIBER_BUFFER);
        trace!(channel, id = ?subscription.id, "subscribed");
        Ok(subscription)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> CacheResult<()> {
        if let Some((channel, _)) = self.fanout.remove(id) {
            trace!(channel = %channel, ?id, "unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Bytes) -> CacheResult<()> {
        for sender in self.fanout.senders(channel) {
            if sender.send(message.clone()).await.is_err() {
                trace!(channel, "subscriber went away before delivery");
            }
        }
        Ok(())
    }

    async fn lock(&self, key: &str) -> CacheResult<LockGuard> {
        let held = self.locks.acquire(key).await;
        Ok(LockGuard::new(key, Box::new(held)))
    }

    async fn set_session_control(
        &self,
        session_key: &str,
        controls_key: &str,
        control_id: &str,
        control_json: &str,
        max_size: usize,
    ) -> CacheResult<bool> {
        let now = Instant::now();
        let mut data = self.data.write();
        let current_size =
            parse_counter(session_key, data.hash_field(session_key, SESSION_SIZE_FIELD, now)?)?;
        let previous_len = data
            .hash_field(controls_key, control_id, now)?
            .map_or(0, |json| json.len() as i64);
        let next_size = current_size - previous_len + control_json.len() as i64;
        if max_size > 0 && next_size > max_size as i64 {
            return Ok(false);
        }
        data.hash_mut(controls_key, now)?
            .insert(control_id.to_string(), control_json.to_string());
        data.hash_mut(session_key, now)?
            .insert(SESSION_SIZE_FIELD.to_string(), next_size.to_string());
        Ok(true)
    }

    async fn remove_session_control(
        &self,
        session_key: &str,
        controls_key: &str,
        control_id: &str,
    ) -> CacheResult<()> {
        let now = Instant::now();
        let mut data = self.data.write();
        let Some(removed) = data
            .hash_field(controls_key, control_id, now)?
            .map(|json| json.len() as i64)
        else {
            return Ok(());
        };
        data.hash_mut(controls_key, now)?.remove(control_id);
        data.drop_if_empty(controls_key);
        let session = data.hash_mut(session_key, now)?;
        let size = parse_counter(session_key, session.get(SESSION_SIZE_FIELD))? - removed;
        session.insert(SESSION_SIZE_FIELD.to_string(), size.to_string());
        Ok(())
    }
}
