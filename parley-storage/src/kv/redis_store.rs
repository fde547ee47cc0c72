//! Redis adapter for [`KeyValueStore`].

use std::time::Duration;

use async_trait::async_trait;
use parley_core::{KvError, ParleyResult};
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, RedisError, Value};
use tracing::debug;

use super::{KeyValueStore, KvCommand, Pipeline, PipelineReply};

/// Key-value store backed by a multiplexed Redis connection.
///
/// The connection is cheap to clone; each call works on its own handle so
/// concurrent callers never wait on a lock.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

fn map_err(e: RedisError) -> KvError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
        KvError::Unavailable {
            reason: e.to_string(),
        }
    } else {
        KvError::Command {
            reason: e.to_string(),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

fn decode<T: FromRedisValue>(key: &str, value: &Value) -> Result<T, KvError> {
    redis::from_redis_value(value).map_err(|e| KvError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl RedisKvStore {
    /// Open a client for `url` and establish the multiplexed connection.
    pub async fn connect(url: &str) -> ParleyResult<Self> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_err)?;
        debug!(url = %url, "Connected to Redis");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn set_cmd(key: &str, value: &str, ttl: Option<Duration>) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        cmd
    }
}

#[async_trait]
impl KeyValueStore for RedisKvStore {
    async fn get(&self, key: &str) -> ParleyResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ParleyResult<()> {
        let mut conn = self.conn.clone();
        Self::set_cmd(key, value, ttl)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> ParleyResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed = redis::cmd("DEL")
            .arg(keys)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed)
    }

    async fn mget(&self, keys: &[String]) -> ParleyResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // A single-key MGET still replies with an array.
        let values = redis::cmd("MGET")
            .arg(keys)
            .query_async::<_, Vec<Option<String>>>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(values)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ParleyResult<bool> {
        let mut conn = self.conn.clone();
        let applied = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async::<_, bool>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(applied)
    }

    async fn exec(&self, pipeline: Pipeline) -> ParleyResult<Vec<PipelineReply>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        if pipeline.is_atomic() {
            pipe.atomic();
        }
        for command in pipeline.commands() {
            match command {
                KvCommand::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                KvCommand::Exists { key } => {
                    pipe.cmd("EXISTS").arg(key);
                }
                KvCommand::Set { key, value, ttl } => {
                    pipe.add_command(Self::set_cmd(key, value, *ttl));
                }
                KvCommand::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                KvCommand::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl));
                }
            }
        }

        let mut conn = self.conn.clone();
        let raw = pipe
            .query_async::<_, Vec<Value>>(&mut conn)
            .await
            .map_err(map_err)?;
        if raw.len() != pipeline.len() {
            return Err(KvError::Command {
                reason: format!(
                    "pipeline returned {} replies for {} commands",
                    raw.len(),
                    pipeline.len()
                ),
            }
            .into());
        }

        let mut replies = Vec::with_capacity(raw.len());
        for (command, value) in pipeline.commands().iter().zip(raw.iter()) {
            let reply = match command {
                KvCommand::Get { key } => PipelineReply::Value(decode(key, value)?),
                KvCommand::Exists { key } | KvCommand::Del { key } | KvCommand::Expire { key, .. } => {
                    PipelineReply::Flag(decode::<i64>(key, value)? > 0)
                }
                KvCommand::Set { .. } => PipelineReply::Ok,
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn ping(&self) -> ParleyResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
