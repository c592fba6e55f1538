//! Redis backend.
//!
//! A queue named `orders` with prefix `rq` owns four keys sharing the hash
//! tag `{rq:orders}` so they land on one cluster slot:
//!
//! - `{rq:orders}:messages`: hash of id to encoded message (Queued and Taken)
//! - `{rq:orders}:queue`: list of Queued ids, head first
//! - `{rq:orders}:ephemeral`: sorted set of Taken ids scored by claim time (ms)
//! - `{rq:orders}:seq`: id counter
//!
//! Every state transition is one Lua script, so a message is never visible
//! in both the list and the sorted set. Without ephemeral tracking the claim
//! script drops the entry in the same step. Stored bodies never carry the id;
//! the hash field is authoritative.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{FromRedisValue, Script, ScriptInvocation};

use crate::redis::pool::{RedisPool, RedisPoolExt};

use super::codec;
use super::error::QueueError;
use super::message::Message;
use super::models::QueueConfig;
use super::storage::{QueueStorage, RequeueMode};

/// KEYS: messages, queue, seq. ARGV: id (empty to assign), body, capacity (0 = unbounded).
const INSERT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[3])
if capacity > 0 and redis.call('LLEN', KEYS[2]) >= capacity then
    return {'full'}
end
local id = ARGV[1]
if id == '' then
    repeat
        id = tostring(redis.call('INCR', KEYS[3]))
    until redis.call('HEXISTS', KEYS[1], id) == 0
elseif redis.call('HEXISTS', KEYS[1], id) == 1 then
    return {'duplicate'}
end
redis.call('HSET', KEYS[1], id, ARGV[2])
redis.call('RPUSH', KEYS[2], id)
return {'ok', id}
"#;

/// KEYS: messages, queue, ephemeral. ARGV: claim time ms, ephemeral capacity
/// (0 = unbounded), tracked ('1' moves the id to the sorted set, '0' drops it).
const CLAIM_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[2])
if capacity > 0 and redis.call('LLEN', KEYS[2]) > 0
    and redis.call('ZCARD', KEYS[3]) >= capacity then
    return {'full'}
end
while true do
    local id = redis.call('LPOP', KEYS[2])
    if not id then
        return {}
    end
    local body = redis.call('HGET', KEYS[1], id)
    if body then
        if ARGV[3] == '1' then
            redis.call('ZADD', KEYS[3], ARGV[1], id)
        else
            redis.call('HDEL', KEYS[1], id)
        end
        return {'ok', id, body}
    end
end
"#;

/// KEYS: messages, ephemeral. ARGV: id, raw body, claim time ms.
const PARK_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// KEYS: messages, ephemeral. ARGV: id.
const FINISH_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[2], ARGV[1])
if removed == 1 then
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return removed
"#;

/// KEYS: messages, queue, ephemeral. ARGV: id, replacement body (empty keeps the stored one).
const RELEASE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[3], ARGV[1]) == 0 then
    return 0
end
if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
end
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// Key names of one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    messages: String,
    queue: String,
    ephemeral: String,
    seq: String,
}

impl QueueKeys {
    fn new(prefix: &str, name: &str) -> Self {
        let tag = format!("{{{}:{}}}", prefix, name);
        Self {
            messages: format!("{}:messages", tag),
            queue: format!("{}:queue", tag),
            ephemeral: format!("{}:ephemeral", tag),
            seq: format!("{}:seq", tag),
        }
    }

    fn all(&self) -> Vec<String> {
        vec![
            self.messages.clone(),
            self.queue.clone(),
            self.ephemeral.clone(),
            self.seq.clone(),
        ]
    }
}

struct Scripts {
    insert: Script,
    claim: Script,
    finish: Script,
    release: Script,
    park: Script,
}

/// Redis-backed queue storage with `i64` identities.
///
/// Requeued messages go to the tail of the list. The `fifo` flag has no
/// effect: the list is always consumed head first.
pub struct RedisQueueBackend {
    pool: Arc<RedisPool>,
    config: QueueConfig,
    keys: QueueKeys,
    scripts: Scripts,
}

impl RedisQueueBackend {
    pub fn new(config: QueueConfig, pool: Arc<RedisPool>, prefix: &str) -> Result<Self, QueueError> {
        if prefix.is_empty() || prefix.contains(['{', '}']) {
            return Err(QueueError::InvalidConfig(format!(
                "invalid redis key prefix: {:?}",
                prefix
            )));
        }
        if config.name.contains(['{', '}']) {
            return Err(QueueError::InvalidConfig(format!(
                "queue name {:?} cannot be used in a redis hash tag",
                config.name
            )));
        }
        if !config.fifo {
            tracing::debug!(queue = %config.name, "Redis backend always consumes in FIFO order");
        }

        Ok(Self {
            keys: QueueKeys::new(prefix, &config.name),
            pool,
            config,
            scripts: Scripts {
                insert: Script::new(INSERT_SCRIPT),
                claim: Script::new(CLAIM_SCRIPT),
                finish: Script::new(FINISH_SCRIPT),
                release: Script::new(RELEASE_SCRIPT),
                park: Script::new(PARK_SCRIPT),
            },
        })
    }

    /// Remove every key of this queue.
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.pool.del(&self.keys.all()).await?;
        tracing::info!(queue = %self.config.name, "Redis queue purged");
        Ok(())
    }

    async fn run<T: FromRedisValue + Send>(
        &self,
        invocation: ScriptInvocation<'_>,
    ) -> Result<T, QueueError> {
        let result = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(result)
    }

    /// Encode `msg` for storage, without its id.
    fn encode_body(msg: &Message<i64>) -> Result<String, QueueError> {
        let mut body = msg.clone();
        body.id = None;
        codec::serialize(&body)
    }

    fn decode_body(id: &str, body: &str) -> Result<Message<i64>, QueueError> {
        let parsed: i64 = id.parse().map_err(|_| QueueError::Deserialization {
            id: id.to_string(),
            reason: "non-numeric id".to_string(),
        })?;

        let mut msg: Message<i64> =
            codec::deserialize(body).map_err(|err| match err {
                QueueError::Deserialization { reason, .. } => QueueError::Deserialization {
                    id: id.to_string(),
                    reason,
                },
                other => other,
            })?;
        msg.id = Some(parsed);
        Ok(msg)
    }

    async fn finish_raw(&self, id: &str) -> Result<bool, QueueError> {
        let mut invocation = self.scripts.finish.prepare_invoke();
        invocation
            .key(&self.keys.messages)
            .key(&self.keys.ephemeral)
            .arg(id);
        let removed: i64 = self.run(invocation).await?;
        Ok(removed == 1)
    }

    async fn park(&self, id: &str, body: &str, claimed_at: i64) -> Result<(), QueueError> {
        let mut invocation = self.scripts.park.prepare_invoke();
        invocation
            .key(&self.keys.messages)
            .key(&self.keys.ephemeral)
            .arg(id)
            .arg(body)
            .arg(claimed_at);
        let _: i64 = self.run(invocation).await.inspect_err(|e| {
            tracing::error!(
                queue = %self.config.name,
                message_id = %id,
                body = %body,
                error = %e,
                "Failed to park undecodable message"
            );
        })?;
        tracing::warn!(queue = %self.config.name, message_id = %id, "Undecodable message parked as Taken");
        Ok(())
    }

    /// Orphans among the Taken entries, oldest first.
    ///
    /// An undecodable entry fails the scan with `Deserialization` naming its
    /// id; it stays Taken until finished by id.
    fn collect_orphans(
        &self,
        ids: &[String],
        bodies: Vec<Option<String>>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Message<i64>>, QueueError> {
        let mut orphans = Vec::new();
        let mut undecodable = None;

        for (id, body) in ids.iter().zip(bodies) {
            // Finished between the two reads
            let Some(body) = body else { continue };

            match Self::decode_body(id, &body) {
                Ok(msg) if msg.is_orphaned(cutoff) => orphans.push(msg),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        queue = %self.config.name,
                        message_id = %id,
                        error = %e,
                        "Undecodable Taken message found during orphan scan"
                    );
                    undecodable.get_or_insert(e);
                }
            }
        }

        if let Some(e) = undecodable {
            return Err(e);
        }
        orphans.sort_by_key(|msg| msg.queue_timestamp);
        Ok(orphans)
    }

    fn ephemeral_capacity(&self) -> usize {
        if self.config.ephemeral_enabled {
            self.config.ephemeral_max_size.unwrap_or(0)
        } else {
            0
        }
    }
}

#[async_trait]
impl QueueStorage<i64> for RedisQueueBackend {
    fn backend_type(&self) -> &'static str {
        "redis"
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn insert(&self, msg: &Message<i64>) -> Result<i64, QueueError> {
        let body = Self::encode_body(msg)?;
        let id_arg = msg.id.map(|id| id.to_string()).unwrap_or_default();

        let mut invocation = self.scripts.insert.prepare_invoke();
        invocation
            .key(&self.keys.messages)
            .key(&self.keys.queue)
            .key(&self.keys.seq)
            .arg(&id_arg)
            .arg(body)
            .arg(self.config.max_size.unwrap_or(0));
        let reply: Vec<String> = self.run(invocation).await?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                let raw = reply.get(1).map(String::as_str).unwrap_or_default();
                raw.parse::<i64>()
                    .map_err(|_| QueueError::Storage(format!("insert returned id {:?}", raw)))
            }
            Some("full") => Err(QueueError::QueueFull {
                queue: self.config.name.clone(),
                capacity: self.config.max_size.unwrap_or(0),
            }),
            Some("duplicate") => Err(QueueError::DuplicateKey(id_arg)),
            _ => Err(QueueError::Storage(format!(
                "unexpected insert reply: {:?}",
                reply
            ))),
        }
    }

    async fn claim_one(&self) -> Result<Option<Message<i64>>, QueueError> {
        let capacity = self.ephemeral_capacity();
        let claimed_at = Utc::now().timestamp_millis();

        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(&self.keys.messages)
            .key(&self.keys.queue)
            .key(&self.keys.ephemeral)
            .arg(claimed_at)
            .arg(capacity)
            .arg(if self.config.ephemeral_enabled { "1" } else { "0" });
        let reply: Vec<String> = self.run(invocation).await?;

        let (id, body) = match reply.as_slice() {
            [] => return Ok(None),
            [status] if status == "full" => {
                return Err(QueueError::EphemeralFull {
                    queue: self.config.name.clone(),
                    capacity,
                })
            }
            [status, id, body] if status == "ok" => (id, body),
            _ => {
                return Err(QueueError::Storage(format!(
                    "unexpected claim reply of {} elements",
                    reply.len()
                )))
            }
        };

        match Self::decode_body(id, body) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                // Tracked entries are already Taken; untracked ones were
                // dropped by the claim and go back as Taken for inspection.
                if !self.config.ephemeral_enabled {
                    self.park(id, body, claimed_at).await?;
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, id: &i64) -> Result<bool, QueueError> {
        self.finish_raw(&id.to_string()).await
    }

    async fn release(
        &self,
        msg: &Message<i64>,
        mode: RequeueMode,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let id = msg.id.ok_or(QueueError::MissingId)?.to_string();

        let replacement = match mode {
            RequeueMode::Silent => String::new(),
            RequeueMode::Loud => {
                let Some(stored) = self.pool.hget(&self.keys.messages, &id).await? else {
                    return Ok(false);
                };
                let current = Self::decode_body(&id, &stored)?;
                Self::encode_body(&current.requeued_at(now))?
            }
        };

        let mut invocation = self.scripts.release.prepare_invoke();
        invocation
            .key(&self.keys.messages)
            .key(&self.keys.queue)
            .key(&self.keys.ephemeral)
            .arg(&id)
            .arg(replacement);
        let released: i64 = self.run(invocation).await?;
        Ok(released == 1)
    }

    async fn scan_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message<i64>>, QueueError> {
        let ids = self.pool.zrange_all(&self.keys.ephemeral).await?;
        let bodies = self.pool.hmget(&self.keys.messages, &ids).await?;
        self.collect_orphans(&ids, bodies, cutoff)
    }

    async fn queue_size(&self) -> Result<Option<usize>, QueueError> {
        Ok(Some(self.pool.llen(&self.keys.queue).await?))
    }

    async fn ephemeral_size(&self) -> Result<Option<usize>, QueueError> {
        Ok(Some(self.pool.zcard(&self.keys.ephemeral).await?))
    }
}
