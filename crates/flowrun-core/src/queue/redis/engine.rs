// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable priority queue stored in Redis.
//!
//! Key layout for queue `q` under prefix `p`:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `p:q:jobs` | HASH | job id → serialized [`QueuedJob`] |
//! | `p:q:prio` | HASH | job id → native priority value |
//! | `p:q:wait` | ZSET | ready job ids, score `priority * 1e13 + enqueue_ms` |
//! | `p:q:delayed` | ZSET | future job ids, score `fire_ms` |
//! | `p:q:added` | ZSET | job ids, score `created_ms` |
//! | `p:q:repeat` | HASH | repeat key → serialized repeat template |
//!
//! Enqueue and dequeue run as Lua scripts so each is atomic. Dequeue first
//! promotes delayed jobs whose fire time has passed, then pops the lowest
//! score from the wait set. An enqueue may be guarded by a repeat key, in
//! which case it only inserts while that template is stored.

use std::collections::HashMap;

use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;

use crate::error::Result;
use crate::job::{QueueName, QueuedJob};

/// Multiplier separating priority bands in the wait set score.
const PRIORITY_BAND: f64 = 1e13;

/// Maximum delayed jobs promoted per dequeue.
const PROMOTE_BATCH: usize = 100;

const ENQUEUE_SCRIPT: &str = r#"
if ARGV[8] ~= '' and redis.call('HEXISTS', KEYS[6], ARGV[8]) == 0 then
  return 0
end
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('HSET', KEYS[5], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
if tonumber(ARGV[5]) > tonumber(ARGV[6]) then
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
else
  redis.call('ZADD', KEYS[2], ARGV[7], ARGV[1])
end
return 1
"#;

const DEQUEUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[3], id)
  local prio = tonumber(redis.call('HGET', KEYS[5], id) or '4')
  redis.call('ZADD', KEYS[2], string.format('%.0f', prio * tonumber(ARGV[3]) + tonumber(ARGV[1])), id)
end
local popped = redis.call('ZPOPMIN', KEYS[2], 1)
if #popped == 0 then
  return false
end
local id = popped[1]
local data = redis.call('HGET', KEYS[1], id)
redis.call('HDEL', KEYS[1], id)
redis.call('HDEL', KEYS[5], id)
redis.call('ZREM', KEYS[4], id)
return data
"#;

/// Keys of one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    jobs: String,
    prio: String,
    wait: String,
    delayed: String,
    added: String,
    repeat: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: QueueName) -> Self {
        let base = format!("{}:{}", prefix, queue.as_str());
        Self {
            jobs: format!("{}:jobs", base),
            prio: format!("{}:prio", base),
            wait: format!("{}:wait", base),
            delayed: format!("{}:delayed", base),
            added: format!("{}:added", base),
            repeat: format!("{}:repeat", base),
        }
    }
}

/// Wait set score for a job of `priority` made ready at `ready_ms`.
pub fn wait_score(priority: u8, ready_ms: i64) -> f64 {
    f64::from(priority) * PRIORITY_BAND + ready_ms as f64
}

/// Raw queue operations over one Redis connection.
#[derive(Clone)]
pub struct RedisQueueEngine {
    conn: ConnectionManager,
    prefix: String,
    enqueue: Script,
    dequeue: Script,
}

impl RedisQueueEngine {
    /// Create an engine that namespaces every key under `prefix`.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            enqueue: Script::new(ENQUEUE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
        }
    }

    fn keys(&self, queue: QueueName) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    /// Key outside any single queue, under the same prefix.
    pub fn global_key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    /// Connection handle for commands outside the queue layout.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Whether a job with `id` is stored in `queue`.
    pub async fn exists(&self, queue: QueueName, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists(self.keys(queue).jobs, id).await?;
        Ok(exists)
    }

    /// Store a job and make it ready at `fire_ms`.
    ///
    /// Returns `false` without touching anything if the id is already stored.
    pub async fn enqueue(&self, job: &QueuedJob, fire_ms: i64, now_ms: i64) -> Result<bool> {
        self.enqueue_guarded(job, None, fire_ms, now_ms).await
    }

    /// [`enqueue`](Self::enqueue) an instance of the repeating job stored
    /// under `repeat_key`.
    ///
    /// Returns `false` if the template is gone, so a concurrent removal never
    /// leaves an orphaned instance behind.
    pub async fn enqueue_repeat_instance(
        &self,
        job: &QueuedJob,
        repeat_key: &str,
        fire_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        self.enqueue_guarded(job, Some(repeat_key), fire_ms, now_ms)
            .await
    }

    async fn enqueue_guarded(
        &self,
        job: &QueuedJob,
        repeat_key: Option<&str>,
        fire_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let keys = self.keys(job.queue);
        let priority = job.priority.engine_value();
        let body = serde_json::to_string(job)?;
        let created_ms = job.created_at.timestamp_millis();
        let ready_ms = fire_ms.max(now_ms);

        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .enqueue
            .key(&keys.jobs)
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.added)
            .key(&keys.prio)
            .key(&keys.repeat)
            .arg(&job.id)
            .arg(body)
            .arg(priority)
            .arg(created_ms)
            .arg(fire_ms)
            .arg(now_ms)
            .arg(format!("{:.0}", wait_score(priority, ready_ms)))
            .arg(repeat_key.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    /// Pop the highest-priority ready job, promoting due delayed jobs first.
    pub async fn dequeue(&self, queue: QueueName, now_ms: i64) -> Result<Option<QueuedJob>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let body: Option<String> = self
            .dequeue
            .key(&keys.jobs)
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.added)
            .key(&keys.prio)
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .arg(format!("{:.0}", PRIORITY_BAND))
            .invoke_async(&mut conn)
            .await?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    /// Delete a job from every structure of `queue`.
    pub async fn remove(&self, queue: QueueName, id: &str) -> Result<bool> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let (deleted,): (i64,) = redis::pipe()
            .atomic()
            .hdel(&keys.jobs, id)
            .hdel(&keys.prio, id)
            .ignore()
            .zrem(&keys.wait, id)
            .ignore()
            .zrem(&keys.delayed, id)
            .ignore()
            .zrem(&keys.added, id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    /// Ids of jobs whose creation time is strictly before `before_ms`.
    pub async fn ids_added_before(&self, queue: QueueName, before_ms: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys(queue).added, "-inf", format!("({}", before_ms))
            .await?;
        Ok(ids)
    }

    /// Ids of stored jobs starting with `prefix`.
    pub async fn ids_with_prefix(&self, queue: QueueName, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.hkeys(self.keys(queue).jobs).await?;
        Ok(ids.into_iter().filter(|id| id.starts_with(prefix)).collect())
    }

    /// Store or replace the template of a repeating job.
    pub async fn put_repeat(&self, queue: QueueName, key: &str, template: &QueuedJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(template)?;
        let _: () = conn.hset(self.keys(queue).repeat, key, body).await?;
        Ok(())
    }

    /// Template of a repeating job.
    pub async fn get_repeat(&self, queue: QueueName, key: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.hget(self.keys(queue).repeat, key).await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    /// Delete a repeating job template. Returns whether it existed.
    pub async fn delete_repeat(&self, queue: QueueName, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.hdel(self.keys(queue).repeat, key).await?;
        Ok(deleted > 0)
    }

    /// Every repeating job template of `queue` with its repeat key.
    pub async fn list_repeats(&self, queue: QueueName) -> Result<Vec<(String, QueuedJob)>> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(self.keys(queue).repeat).await?;
        entries
            .into_iter()
            .map(|(key, body)| Ok((key, serde_json::from_str(&body)?)))
            .collect()
    }

    /// Number of jobs stored in `queue`.
    pub async fn job_count(&self, queue: QueueName) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(self.keys(queue).jobs).await?;
        Ok(len)
    }
}
