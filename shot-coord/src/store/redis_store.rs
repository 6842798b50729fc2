use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use redis::Pipeline;
use redis::Value;
use redis::aio::ConnectionManager;

use super::Batch;
use super::Command;
use super::Reply;
use super::Store;
use crate::error::CoordError;
use crate::error::Result;
use crate::script::Script;

/// A [`Store`] backed by a Redis server.
///
/// Commands share one multiplexed, auto-reconnecting connection. Blocking
/// pops use a connection of their own so that they never stall it.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("server", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Connects to the server at `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, connection })
    }
}

fn add_command(pipe: &mut Pipeline, command: &Command) {
    match command {
        Command::Get { key } => {
            pipe.cmd("GET").arg(key);
        }
        Command::Set {
            key,
            value,
            options,
        } => {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if options.only_if_absent {
                cmd.arg("NX");
            }
            if let Some(ttl) = options.ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
        }
        Command::GetSet { key, value } => {
            pipe.cmd("GETSET").arg(key).arg(value);
        }
        Command::IncrBy { key, delta } => {
            pipe.cmd("INCRBY").arg(key).arg(*delta);
        }
        Command::PExpire { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
        }
        Command::Del { keys } => {
            pipe.cmd("DEL").arg(keys);
        }
        Command::Exists { key } => {
            pipe.cmd("EXISTS").arg(key);
        }
        Command::LPush { key, value } => {
            pipe.cmd("LPUSH").arg(key).arg(value);
        }
        Command::RPop { key } => {
            pipe.cmd("RPOP").arg(key);
        }
        Command::LLen { key } => {
            pipe.cmd("LLEN").arg(key);
        }
        Command::HSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value);
        }
        Command::HDel { key, field } => {
            pipe.cmd("HDEL").arg(key).arg(field);
        }
        Command::HGetAll { key } => {
            pipe.cmd("HGETALL").arg(key);
        }
    }
}

fn text(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|err| CoordError::UnexpectedReply(format!("non utf-8 data: {err}")))
}

fn pairs(entries: Vec<(Value, Value)>) -> Result<Vec<(String, String)>> {
    entries
        .into_iter()
        .map(|(field, value)| {
            let field = into_reply(field)?.into_string()?.unwrap_or_default();
            let value = into_reply(value)?.into_string()?.unwrap_or_default();
            Ok((field, value))
        })
        .collect()
}

fn into_reply(value: Value) -> Result<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Ok),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::BulkString(bytes) => text(bytes).map(Reply::Data),
        Value::SimpleString(s) => Ok(Reply::Data(s)),
        Value::Boolean(flag) => Ok(Reply::from(flag)),
        Value::Map(entries) => pairs(entries).map(Reply::Pairs),
        // RESP2 answers HGETALL with a flat field/value array
        Value::Array(items) => {
            let mut items = items.into_iter();
            let mut entries = Vec::new();
            while let (Some(field), Some(value)) = (items.next(), items.next()) {
                entries.push((field, value));
            }
            pairs(entries).map(Reply::Pairs)
        }
        Value::ServerError(err) => Err(CoordError::Transport(format!("{err:?}"))),
        other => Err(CoordError::UnexpectedReply(format!("{other:?}"))),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn exec(&self, batch: &Batch) -> Result<Vec<Reply>> {
        let mut pipe = redis::pipe();
        if batch.is_atomic() {
            pipe.atomic();
        }
        for command in batch.commands() {
            add_command(&mut pipe, command);
        }

        let mut connection = self.connection.clone();
        let values: Vec<Value> = pipe.query_async(&mut connection).await?;
        values.into_iter().map(into_reply).collect()
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        if timeout.is_zero() {
            // BRPOP treats zero as "wait forever"
            let popped: Option<String> = redis::cmd("RPOP")
                .arg(key)
                .query_async(&mut connection)
                .await?;
            return Ok(popped);
        }

        let mut dedicated = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut dedicated)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[i64]) -> Result<i64> {
        let lua = redis::Script::new(script.lua());
        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        let mut connection = self.connection.clone();
        let value: Value = invocation.invoke_async(&mut connection).await?;
        into_reply(value)?.into_int()
    }
}
