use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::time::timeout_at;

use super::Batch;
use super::Keyspace;
use super::Reply;
use super::SetOptions;
use super::Store;
use crate::clock;
use crate::clock::Clock;
use crate::error::CoordError;
use crate::error::Result;
use crate::script::Script;

#[derive(Debug, Clone)]
enum Value {
    Data(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Unix milliseconds
    expires_at: Option<i64>,
}

/// A keyspace held entirely in memory.
///
/// Expiry is lazy: a key past its deadline is dropped the next time it is
/// touched. The current time is supplied by the owner through
/// [`MemoryKeyspace::at`] before each use.
#[derive(Debug, Default)]
pub struct MemoryKeyspace {
    entries: HashMap<String, Entry>,
    now: i64,
}

impl MemoryKeyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the keyspace to `now_millis`, expiring anything due.
    pub fn at(&mut self, now_millis: i64) -> &mut Self {
        self.now = now_millis;
        self
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now;
        if self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now)
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list_mut(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(Some(hash)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Empty aggregates cease to exist.
    fn prune(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|entry| &entry.value) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn deadline(&self, ttl: Duration) -> i64 {
        self.now.saturating_add(ttl.as_millis() as i64)
    }
}

fn wrong_type(key: &str) -> CoordError {
    CoordError::WrongType {
        key: key.to_string(),
    }
}

impl Keyspace for MemoryKeyspace {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Data(data),
                ..
            }) => Ok(Some(data.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        if options.only_if_absent && self.live(key).is_some() {
            return Ok(false);
        }
        let expires_at = options.ttl.map(|ttl| self.deadline(ttl));
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Data(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    fn getset(&mut self, key: &str, value: &str) -> Result<Option<String>> {
        let previous = self.get(key)?;
        self.set(key, value, SetOptions::default())?;
        Ok(previous)
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        match self.live(key) {
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Data(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
            Some(Entry {
                value: Value::Data(data),
                ..
            }) => {
                let current: i64 = data.parse().map_err(|_| CoordError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| CoordError::NotAnInteger {
                        key: key.to_string(),
                    })?;
                *data = next.to_string();
                Ok(next)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn pexpire(&mut self, key: &str, ttl: Duration) -> bool {
        let deadline = self.deadline(ttl);
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(deadline);
                true
            }
            None => false,
        }
    }

    fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now;
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => *at - now,
        }
    }

    fn del(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn lpush(&mut self, key: &str, value: &str) -> Result<usize> {
        if let Some(list) = self.list_mut(key)? {
            list.push_front(value.to_string());
            return Ok(list.len());
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::List(VecDeque::from([value.to_string()])),
                expires_at: None,
            },
        );
        Ok(1)
    }

    fn rpop(&mut self, key: &str) -> Result<Option<String>> {
        let popped = self.list_mut(key)?.and_then(|list| list.pop_back());
        self.prune(key);
        Ok(popped)
    }

    fn llen(&mut self, key: &str) -> Result<usize> {
        Ok(self.list_mut(key)?.map_or(0, |list| list.len()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool> {
        if let Some(hash) = self.hash_mut(key)? {
            return Ok(hash
                .insert(field.to_string(), value.to_string())
                .is_none());
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(HashMap::from([(field.to_string(), value.to_string())])),
                expires_at: None,
            },
        );
        Ok(true)
    }

    fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        let removed = self
            .hash_mut(key)?
            .is_some_and(|hash| hash.remove(field).is_some());
        self.prune(key);
        Ok(removed)
    }

    fn hgetall(&mut self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self.hash_mut(key)?.map_or_else(Vec::new, |hash| {
            hash.iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect()
        }))
    }
}

/// An in-process [`Store`].
///
/// Every command, batch and script runs while holding a single lock, so all
/// of them are serializable with respect to each other. Clones share the
/// same keys, which lets tests stand several "processes" on one store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    keys: Arc<Mutex<MemoryKeyspace>>,
    pushed: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Expiry is judged against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Arc::new(Mutex::new(MemoryKeyspace::new())),
            pushed: Arc::new(Notify::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryKeyspace> {
        let mut guard = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        guard.at(self.clock.now_millis());
        guard
    }

    /// Runs `f` with exclusive access to the keys.
    ///
    /// Writes made here are visible to blocked [`Store::brpop`] callers.
    pub fn with_keys<T>(&self, f: impl FnOnce(&mut MemoryKeyspace) -> T) -> T {
        let result = f(&mut self.lock());
        self.pushed.notify_waiters();
        result
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exec(&self, batch: &Batch) -> Result<Vec<Reply>> {
        // Both kinds of batch are applied under one lock; a failing command
        // aborts the remainder, matching an EXEC that was never sent.
        self.with_keys(|keys| {
            batch
                .commands()
                .iter()
                .map(|command| command.apply(keys))
                .collect()
        })
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before looking so a push between the check and the
            // wait is not missed.
            notified.as_mut().enable();

            let popped = self.lock().rpop(key)?;
            if popped.is_some() {
                return Ok(popped);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[i64]) -> Result<i64> {
        self.with_keys(|keyspace| script.run(keyspace, keys, args))
    }
}
