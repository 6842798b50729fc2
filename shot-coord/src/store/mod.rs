//! The shared atomic store every primitive coordinates through.
//!
//! Primitives never talk to a particular backend. They issue [`Command`]s,
//! grouped into [`Batch`]es, against anything implementing [`Store`], and run
//! their multi-key transitions as [`Script`]s. Redis semantics are the
//! reference: empty lists and hashes cease to exist, `SET NX` replies nil when
//! it does not write, and an expired key is indistinguishable from one that
//! never existed.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordError;
use crate::error::Result;
use crate::script::Script;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryKeyspace;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Options for [`Command::Set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Only write if the key does not exist.
    pub only_if_absent: bool,
    /// Expire the key after this long.
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn if_absent() -> Self {
        Self {
            only_if_absent: true,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String, options: SetOptions },
    GetSet { key: String, value: String },
    IncrBy { key: String, delta: i64 },
    PExpire { key: String, ttl: Duration },
    Del { keys: Vec<String> },
    Exists { key: String },
    LPush { key: String, value: String },
    RPop { key: String },
    LLen { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    HGetAll { key: String },
}

impl Command {
    /// Runs this command against a keyspace, producing the reply Redis would.
    pub fn apply(&self, keyspace: &mut dyn Keyspace) -> Result<Reply> {
        let reply = match self {
            Command::Get { key } => Reply::from(keyspace.get(key)?),
            Command::Set {
                key,
                value,
                options,
            } => {
                if keyspace.set(key, value, *options)? {
                    Reply::Ok
                } else {
                    Reply::Nil
                }
            }
            Command::GetSet { key, value } => Reply::from(keyspace.getset(key, value)?),
            Command::IncrBy { key, delta } => Reply::Int(keyspace.incr_by(key, *delta)?),
            Command::PExpire { key, ttl } => Reply::from(keyspace.pexpire(key, *ttl)),
            Command::Del { keys } => {
                let removed = keys.iter().filter(|key| keyspace.del(key)).count();
                Reply::Int(removed as i64)
            }
            Command::Exists { key } => Reply::from(keyspace.exists(key)),
            Command::LPush { key, value } => Reply::Int(keyspace.lpush(key, value)? as i64),
            Command::RPop { key } => Reply::from(keyspace.rpop(key)?),
            Command::LLen { key } => Reply::Int(keyspace.llen(key)? as i64),
            Command::HSet { key, field, value } => Reply::from(keyspace.hset(key, field, value)?),
            Command::HDel { key, field } => Reply::from(keyspace.hdel(key, field)?),
            Command::HGetAll { key } => Reply::Pairs(keyspace.hgetall(key)?),
        };
        Ok(reply)
    }
}

/// A store reply, shaped after the Redis protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Data(String),
    Pairs(Vec<(String, String)>),
}

impl Reply {
    pub fn into_int(self) -> Result<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            Reply::Data(s) => s
                .parse()
                .map_err(|_| CoordError::UnexpectedReply(format!("expected integer, got {s:?}"))),
            other => Err(CoordError::UnexpectedReply(format!(
                "expected integer, got {other:?}"
            ))),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Reply::Nil => Ok(false),
            Reply::Ok => Ok(true),
            Reply::Int(n) => Ok(n != 0),
            other => Err(CoordError::UnexpectedReply(format!(
                "expected flag, got {other:?}"
            ))),
        }
    }

    pub fn into_string(self) -> Result<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Data(s) => Ok(Some(s)),
            Reply::Int(n) => Ok(Some(n.to_string())),
            other => Err(CoordError::UnexpectedReply(format!(
                "expected string, got {other:?}"
            ))),
        }
    }

    pub fn into_pairs(self) -> Result<Vec<(String, String)>> {
        match self {
            Reply::Nil => Ok(Vec::new()),
            Reply::Pairs(pairs) => Ok(pairs),
            other => Err(CoordError::UnexpectedReply(format!(
                "expected field/value pairs, got {other:?}"
            ))),
        }
    }
}

impl From<Option<String>> for Reply {
    fn from(value: Option<String>) -> Self {
        value.map_or(Reply::Nil, Reply::Data)
    }
}

impl From<bool> for Reply {
    fn from(value: bool) -> Self {
        Reply::Int(value as i64)
    }
}

/// An ordered group of commands sent in one round trip.
///
/// A [`Batch::transaction`] is applied atomically: no other client observes
/// or interleaves with a partial application. A [`Batch::pipeline`] only
/// saves round trips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    atomic: bool,
    commands: Vec<Command>,
}

impl Batch {
    pub fn pipeline() -> Self {
        Self::default()
    }

    pub fn transaction() -> Self {
        Self {
            atomic: true,
            commands: Vec::new(),
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn add(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn get(self, key: impl Into<String>) -> Self {
        self.add(Command::Get { key: key.into() })
    }

    pub fn getset(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(Command::GetSet {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn incr_by(self, key: impl Into<String>, delta: i64) -> Self {
        self.add(Command::IncrBy {
            key: key.into(),
            delta,
        })
    }

    pub fn pexpire(self, key: impl Into<String>, ttl: Duration) -> Self {
        self.add(Command::PExpire {
            key: key.into(),
            ttl,
        })
    }

    pub fn exists(self, key: impl Into<String>) -> Self {
        self.add(Command::Exists { key: key.into() })
    }

    pub fn llen(self, key: impl Into<String>) -> Self {
        self.add(Command::LLen { key: key.into() })
    }

    pub fn hset(
        self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.add(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }
}

/// The operation set the primitives require from a shared store.
///
/// Backends implement [`exec`](Store::exec), [`brpop`](Store::brpop) and
/// [`eval`](Store::eval); the single-command helpers are provided on top of
/// `exec`.
#[async_trait]
pub trait Store: Debug + Send + Sync {
    /// Applies a batch in order and returns one reply per command.
    async fn exec(&self, batch: &Batch) -> Result<Vec<Reply>>;

    /// Pops from the tail of a list, waiting up to `timeout` for an element.
    ///
    /// A zero `timeout` does not block.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Runs a script atomically over an explicit key list and argument list.
    async fn eval(&self, script: &Script, keys: &[String], args: &[i64]) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        single(self, Batch::pipeline().get(key)).await?.into_string()
    }

    /// Returns whether the value was written.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        let batch = Batch::pipeline().add(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            options,
        });
        single(self, batch).await?.into_bool()
    }

    async fn getset(&self, key: &str, value: &str) -> Result<Option<String>> {
        single(self, Batch::pipeline().getset(key, value))
            .await?
            .into_string()
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        single(self, Batch::pipeline().incr_by(key, delta))
            .await?
            .into_int()
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool> {
        single(self, Batch::pipeline().pexpire(key, ttl))
            .await?
            .into_bool()
    }

    /// Returns how many of the keys existed.
    async fn del(&self, keys: &[&str]) -> Result<usize> {
        let batch = Batch::pipeline().add(Command::Del {
            keys: keys.iter().map(|key| key.to_string()).collect(),
        });
        Ok(single(self, batch).await?.into_int()? as usize)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        single(self, Batch::pipeline().exists(key))
            .await?
            .into_bool()
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        let batch = Batch::pipeline().add(Command::LPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(single(self, batch).await?.into_int()? as usize)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let batch = Batch::pipeline().add(Command::RPop {
            key: key.to_string(),
        });
        single(self, batch).await?.into_string()
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(single(self, Batch::pipeline().llen(key)).await?.into_int()? as usize)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        single(self, Batch::pipeline().hset(key, field, value))
            .await?
            .into_bool()
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let batch = Batch::pipeline().add(Command::HDel {
            key: key.to_string(),
            field: field.to_string(),
        });
        single(self, batch).await?.into_bool()
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let batch = Batch::pipeline().add(Command::HGetAll {
            key: key.to_string(),
        });
        single(self, batch).await?.into_pairs()
    }
}

async fn single<S>(store: &S, batch: Batch) -> Result<Reply>
where
    S: Store + ?Sized,
{
    store
        .exec(&batch)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CoordError::UnexpectedReply("empty reply to single command".to_string()))
}

/// Synchronous view of a store's keys, used while it is exclusively held.
///
/// Scripts are written against this trait so that their transitions can be
/// applied (and tested) in-process, while scripting stores run the
/// equivalent Lua instead.
pub trait Keyspace {
    fn get(&mut self, key: &str) -> Result<Option<String>>;
    /// Returns whether the value was written.
    fn set(&mut self, key: &str, value: &str, options: SetOptions) -> Result<bool>;
    fn getset(&mut self, key: &str, value: &str) -> Result<Option<String>>;
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64>;
    fn pexpire(&mut self, key: &str, ttl: Duration) -> bool;
    /// Remaining time to live in milliseconds; -1 without a ttl, -2 when absent.
    fn pttl(&mut self, key: &str) -> i64;
    fn del(&mut self, key: &str) -> bool;
    fn exists(&mut self, key: &str) -> bool;
    /// Returns the length of the list after the push.
    fn lpush(&mut self, key: &str, value: &str) -> Result<usize>;
    fn rpop(&mut self, key: &str) -> Result<Option<String>>;
    fn llen(&mut self, key: &str) -> Result<usize>;
    /// Returns whether the field is new.
    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool>;
    /// Returns whether the field existed.
    fn hdel(&mut self, key: &str, field: &str) -> Result<bool>;
    fn hgetall(&mut self, key: &str) -> Result<Vec<(String, String)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_conversions() {
        assert_eq!(Reply::Int(3).into_int(), Ok(3));
        assert_eq!(Reply::Data("42".to_string()).into_int(), Ok(42));
        assert!(Reply::Nil.into_int().is_err());

        assert_eq!(Reply::Ok.into_bool(), Ok(true));
        assert_eq!(Reply::Nil.into_bool(), Ok(false));
        assert_eq!(Reply::Int(0).into_bool(), Ok(false));

        assert_eq!(Reply::Nil.into_string(), Ok(None));
        assert_eq!(Reply::Nil.into_pairs(), Ok(Vec::new()));
        assert!(Reply::Ok.into_pairs().is_err());
    }

    #[test]
    fn batch_preserves_order_and_kind() {
        let batch = Batch::transaction()
            .incr_by("counter", 1)
            .pexpire("counter", Duration::from_secs(60));

        assert!(batch.is_atomic());
        assert!(!Batch::pipeline().is_atomic());
        assert_eq!(
            batch.commands(),
            &[
                Command::IncrBy {
                    key: "counter".to_string(),
                    delta: 1
                },
                Command::PExpire {
                    key: "counter".to_string(),
                    ttl: Duration::from_secs(60)
                },
            ]
        );
    }
}
