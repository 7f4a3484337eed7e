//! Redis broker implementation.
//!
//! Each task is a hash at `{prefix}:t:{id}` holding the encoded message and
//! its record fields. Per queue the broker keeps:
//!
//! - `{prefix}:{queue}:pending`: list, pushed left and popped right (FIFO)
//! - `{prefix}:{queue}:active`: set of leased IDs
//! - `{prefix}:{queue}:delayed`: sorted set of scheduled and requeued IDs
//! - `{prefix}:{queue}:retry`: sorted set of IDs waiting for a retry
//! - `{prefix}:{queue}:completed` and `:archived`: sorted sets scored by expiry
//!
//! Every state transition is a Lua script, so a record and the lanes that
//! reference it never disagree.

use super::{Broker, Lease};
use crate::config::RedisConfig;
use crate::error::{RelayError, RelayResult};
use crate::task::{Queue, TaskId, TaskInfo, TaskMessage, TaskState, add_duration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};

/// Lua helper that moves due members of a sorted set onto a pending list.
const PROMOTE_FN: &str = r#"
local function promote(src, pending, task_prefix, now)
    local ids = redis.call('ZRANGEBYSCORE', src, '-inf', now, 'LIMIT', 0, 100)
    for i = 1, #ids do
        local id = ids[i]
        redis.call('ZREM', src, id)
        local key = task_prefix .. id
        if redis.call('EXISTS', key) == 1 then
            redis.call('HSET', key, 'state', 'pending')
            redis.call('HDEL', key, 'next_process_at')
            redis.call('LPUSH', pending, id)
        end
    end
    return #ids
end
"#;

const ENQUEUE: &str = r#"
local task_key = KEYS[1]
local pending_key = KEYS[2]
local delayed_key = KEYS[3]
local msg = ARGV[1]
local queue = ARGV[2]
local id = ARGV[3]
local now = tonumber(ARGV[4])
local process_at = tonumber(ARGV[5])

if redis.call('EXISTS', task_key) == 1 then
    return 0
end

redis.call('HSET', task_key, 'msg', msg, 'queue', queue, 'retried', 0, 'enqueued_at', now)
if process_at > now then
    redis.call('HSET', task_key, 'state', 'scheduled', 'next_process_at', process_at)
    redis.call('ZADD', delayed_key, process_at, id)
else
    redis.call('HSET', task_key, 'state', 'pending')
    redis.call('LPUSH', pending_key, id)
end
return 1
"#;

const LEASE_BODY: &str = r#"
local pending_key = KEYS[1]
local active_key = KEYS[2]
local delayed_key = KEYS[3]
local retry_key = KEYS[4]
local task_prefix = ARGV[1]
local now = tonumber(ARGV[2])

promote(delayed_key, pending_key, task_prefix, now)
promote(retry_key, pending_key, task_prefix, now)

while true do
    local id = redis.call('RPOP', pending_key)
    if not id then
        return nil
    end
    local key = task_prefix .. id
    local msg = redis.call('HGET', key, 'msg')
    if msg then
        redis.call('HSET', key, 'state', 'active')
        redis.call('SADD', active_key, id)
        return {msg, tonumber(redis.call('HGET', key, 'retried') or '0')}
    end
end
"#;

const COMPLETE: &str = r#"
local active_key = KEYS[1]
local completed_key = KEYS[2]
local task_key = KEYS[3]
local id = ARGV[1]
local now = tonumber(ARGV[2])
local expires_at = tonumber(ARGV[3])

if redis.call('SREM', active_key, id) == 0 then
    return 0
end
redis.call('HSET', task_key, 'state', 'completed', 'completed_at', now, 'expires_at', expires_at)
redis.call('ZADD', completed_key, expires_at, id)
return 1
"#;

const REQUEUE: &str = r#"
local active_key = KEYS[1]
local pending_key = KEYS[2]
local delayed_key = KEYS[3]
local task_key = KEYS[4]
local id = ARGV[1]
local until_at = tonumber(ARGV[2])

if redis.call('SREM', active_key, id) == 0 then
    return 0
end
redis.call('HSET', task_key, 'state', 'pending')
if until_at > 0 then
    redis.call('HSET', task_key, 'next_process_at', until_at)
    redis.call('ZADD', delayed_key, until_at, id)
else
    redis.call('HDEL', task_key, 'next_process_at')
    redis.call('LPUSH', pending_key, id)
end
return 1
"#;

const RETRY: &str = r#"
local active_key = KEYS[1]
local retry_key = KEYS[2]
local task_key = KEYS[3]
local id = ARGV[1]
local err = ARGV[2]
local now = tonumber(ARGV[3])
local retry_at = tonumber(ARGV[4])

if redis.call('SREM', active_key, id) == 0 then
    return 0
end
redis.call('HINCRBY', task_key, 'retried', 1)
redis.call('HSET', task_key, 'state', 'retry', 'last_error', err, 'last_failed_at', now, 'next_process_at', retry_at)
redis.call('ZADD', retry_key, retry_at, id)
return 1
"#;

const ARCHIVE: &str = r#"
local active_key = KEYS[1]
local archived_key = KEYS[2]
local task_key = KEYS[3]
local id = ARGV[1]
local err = ARGV[2]
local now = tonumber(ARGV[3])
local expires_at = tonumber(ARGV[4])

if redis.call('SREM', active_key, id) == 0 then
    return 0
end
redis.call('HINCRBY', task_key, 'retried', 1)
redis.call('HSET', task_key, 'state', 'archived', 'last_error', err, 'last_failed_at', now, 'expires_at', expires_at)
redis.call('HDEL', task_key, 'next_process_at')
redis.call('ZADD', archived_key, expires_at, id)
return 1
"#;

const FORWARD_BODY: &str = r#"
local pending_key = KEYS[1]
local delayed_key = KEYS[2]
local retry_key = KEYS[3]
local task_prefix = ARGV[1]
local now = tonumber(ARGV[2])

return promote(delayed_key, pending_key, task_prefix, now) + promote(retry_key, pending_key, task_prefix, now)
"#;

const DELETE_EXPIRED: &str = r#"
local task_prefix = ARGV[1]
local now = tonumber(ARGV[2])
local deleted = 0

for i = 1, #KEYS do
    local ids = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', now, 'LIMIT', 0, 100)
    for j = 1, #ids do
        redis.call('DEL', task_prefix .. ids[j])
        redis.call('ZREM', KEYS[i], ids[j])
        deleted = deleted + 1
    end
end
return deleted
"#;

/// Pre-compiled Lua scripts for atomic Redis operations
#[derive(Debug)]
struct RedisScripts {
    enqueue: Script,
    lease: Script,
    complete: Script,
    requeue: Script,
    retry: Script,
    archive: Script,
    forward: Script,
    delete_expired: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            lease: Script::new(&format!("{}{}", PROMOTE_FN, LEASE_BODY)),
            complete: Script::new(COMPLETE),
            requeue: Script::new(REQUEUE),
            retry: Script::new(RETRY),
            archive: Script::new(ARCHIVE),
            forward: Script::new(&format!("{}{}", PROMOTE_FN, FORWARD_BODY)),
            delete_expired: Script::new(DELETE_EXPIRED),
        }
    }
}

/// Redis broker backend
pub struct RedisBroker {
    pool: RwLock<Vec<ConnectionManager>>,
    next: AtomicUsize,
    config: RedisConfig,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("address", &self.config.address)
            .field("database", &self.config.database)
            .field("pool_size", &self.config.pool_size)
            .field("key_prefix", &self.config.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Open `pool_size` managed connections to the configured server.
    pub async fn connect(config: RedisConfig) -> RelayResult<Self> {
        let client = Client::open(connection_info(&config)?)?;

        let dial_timeout = Duration::from_secs(config.dial_timeout_secs);
        // The manager has a single round-trip deadline covering write and read.
        let response_timeout =
            Duration::from_secs(config.read_timeout_secs + config.write_timeout_secs);
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(dial_timeout)
            .set_response_timeout(response_timeout);

        let mut pool = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size.max(1) {
            let conn = timeout(
                dial_timeout,
                client.get_connection_manager_with_config(manager_config.clone()),
            )
            .await
            .map_err(|e| RelayError::broker("Timed out connecting to Redis", e))?
            .map_err(|e| RelayError::broker("Failed to create Redis connection manager", e))?;
            pool.push(conn);
        }

        info!(
            address = %config.address,
            database = config.database,
            pool_size = pool.len(),
            "Connected to Redis broker"
        );

        Ok(Self {
            pool: RwLock::new(pool),
            next: AtomicUsize::new(0),
            config,
            scripts: RedisScripts::new(),
        })
    }

    async fn conn(&self) -> RelayResult<ConnectionManager> {
        let pool = self.pool.read().await;
        if pool.is_empty() {
            return Err(RelayError::broker_msg("Redis broker is closed"));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[index].clone())
    }

    fn task_prefix(&self) -> String {
        format!("{}:t:", self.config.key_prefix)
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:t:{}", self.config.key_prefix, id)
    }

    fn lane_key(&self, queue: Queue, lane: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, queue, lane)
    }

    fn decode_message(data: &str) -> RelayResult<TaskMessage> {
        serde_json::from_str(data).map_err(|e| RelayError::broker("Corrupt task message", e))
    }

    fn ensure_applied(applied: i32, message: &TaskMessage) -> RelayResult<()> {
        if applied == 0 {
            return Err(RelayError::TaskNotFound {
                queue: message.queue.to_string(),
                id: message.id.clone(),
            });
        }
        Ok(())
    }
}

fn connection_info(config: &RedisConfig) -> RelayResult<ConnectionInfo> {
    let (host, port) = match config.address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                RelayError::config(format!("Invalid Redis address '{}'", config.address))
            })?;
            (host.to_string(), port)
        }
        None => (config.address.clone(), 6379),
    };

    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(host, port),
        redis: RedisConnectionInfo {
            db: config.database,
            username: config.username.clone(),
            password: config.password.clone(),
            ..Default::default()
        },
    })
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        message: TaskMessage,
        process_at: Option<DateTime<Utc>>,
    ) -> RelayResult<TaskInfo> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let encoded = serde_json::to_string(&message).map_err(RelayError::PayloadMarshal)?;
        let process_at = process_at.filter(|at| *at > now);

        let created: i32 = self
            .scripts
            .enqueue
            .key(self.task_key(&message.id))
            .key(self.lane_key(message.queue, "pending"))
            .key(self.lane_key(message.queue, "delayed"))
            .arg(encoded)
            .arg(message.queue.as_str())
            .arg(&message.id)
            .arg(millis(now))
            .arg(process_at.map_or(0, millis))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Failed to enqueue task", e))?;

        if created == 0 {
            return Err(RelayError::broker_msg(format!(
                "Task ID '{}' already exists",
                message.id
            )));
        }

        let mut info = TaskInfo::new(
            &message,
            if process_at.is_some() {
                TaskState::Scheduled
            } else {
                TaskState::Pending
            },
        );
        info.next_process_at = process_at;

        debug!(task_id = %message.id, queue = %message.queue, state = %info.state, "Enqueued task");
        Ok(info)
    }

    async fn lease(&self, queues: &[Queue]) -> RelayResult<Option<Lease>> {
        let mut conn = self.conn().await?;
        let now = millis(Utc::now());
        let task_prefix = self.task_prefix();

        for &queue in queues {
            let leased: Option<(String, u32)> = self
                .scripts
                .lease
                .key(self.lane_key(queue, "pending"))
                .key(self.lane_key(queue, "active"))
                .key(self.lane_key(queue, "delayed"))
                .key(self.lane_key(queue, "retry"))
                .arg(&task_prefix)
                .arg(now)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| RelayError::broker("Failed to lease task", e))?;

            if let Some((data, retried)) = leased {
                let message = Self::decode_message(&data)?;
                debug!(task_id = %message.id, queue = %queue, retried, "Leased task");
                return Ok(Some(Lease { message, retried }));
            }
        }

        Ok(None)
    }

    async fn complete(&self, message: &TaskMessage) -> RelayResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let expires_at = add_duration(now, message.retention());

        let applied: i32 = self
            .scripts
            .complete
            .key(self.lane_key(message.queue, "active"))
            .key(self.lane_key(message.queue, "completed"))
            .key(self.task_key(&message.id))
            .arg(&message.id)
            .arg(millis(now))
            .arg(millis(expires_at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Failed to complete task", e))?;

        Self::ensure_applied(applied, message)
    }

    async fn requeue(&self, message: &TaskMessage, delay: Duration) -> RelayResult<()> {
        let mut conn = self.conn().await?;
        let until = if delay.is_zero() {
            0
        } else {
            millis(add_duration(Utc::now(), delay))
        };

        let applied: i32 = self
            .scripts
            .requeue
            .key(self.lane_key(message.queue, "active"))
            .key(self.lane_key(message.queue, "pending"))
            .key(self.lane_key(message.queue, "delayed"))
            .key(self.task_key(&message.id))
            .arg(&message.id)
            .arg(until)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Failed to requeue task", e))?;

        Self::ensure_applied(applied, message)
    }

    async fn retry(
        &self,
        message: &TaskMessage,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> RelayResult<()> {
        let mut conn = self.conn().await?;

        let applied: i32 = self
            .scripts
            .retry
            .key(self.lane_key(message.queue, "active"))
            .key(self.lane_key(message.queue, "retry"))
            .key(self.task_key(&message.id))
            .arg(&message.id)
            .arg(error)
            .arg(millis(Utc::now()))
            .arg(millis(retry_at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Failed to schedule retry", e))?;

        Self::ensure_applied(applied, message)
    }

    async fn archive(&self, message: &TaskMessage, error: &str) -> RelayResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let expires_at = add_duration(now, message.retention());

        let applied: i32 = self
            .scripts
            .archive
            .key(self.lane_key(message.queue, "active"))
            .key(self.lane_key(message.queue, "archived"))
            .key(self.task_key(&message.id))
            .arg(&message.id)
            .arg(error)
            .arg(millis(now))
            .arg(millis(expires_at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Failed to archive task", e))?;

        Self::ensure_applied(applied, message)
    }

    async fn forward_due(&self) -> RelayResult<u64> {
        let mut conn = self.conn().await?;
        let now = millis(Utc::now());
        let task_prefix = self.task_prefix();
        let mut moved = 0u64;

        for queue in Queue::ALL {
            let count: u64 = self
                .scripts
                .forward
                .key(self.lane_key(queue, "pending"))
                .key(self.lane_key(queue, "delayed"))
                .key(self.lane_key(queue, "retry"))
                .arg(&task_prefix)
                .arg(now)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| RelayError::broker("Failed to forward due tasks", e))?;
            moved += count;
        }

        if moved > 0 {
            debug!(count = moved, "Forwarded due tasks");
        }
        Ok(moved)
    }

    async fn delete_expired(&self) -> RelayResult<u64> {
        let mut conn = self.conn().await?;
        let mut invocation = self.scripts.delete_expired.prepare_invoke();
        for queue in Queue::ALL {
            invocation
                .key(self.lane_key(queue, "completed"))
                .key(self.lane_key(queue, "archived"));
        }

        let deleted: u64 = invocation
            .arg(self.task_prefix())
            .arg(millis(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Failed to delete expired tasks", e))?;

        Ok(deleted)
    }

    async fn get_task_info(&self, queue: Queue, id: &TaskId) -> RelayResult<TaskInfo> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(self.task_key(id))
            .await
            .map_err(|e| RelayError::broker("Failed to read task", e))?;

        let not_found = || RelayError::TaskNotFound {
            queue: queue.to_string(),
            id: id.clone(),
        };
        if fields.get("queue").map(String::as_str) != Some(queue.as_str()) {
            return Err(not_found());
        }

        let message = Self::decode_message(fields.get("msg").ok_or_else(not_found)?)?;
        let state = fields
            .get("state")
            .ok_or_else(|| RelayError::broker_msg("Task record has no state"))?
            .parse::<TaskState>()?;

        let mut info = TaskInfo::new(&message, state);
        info.retried = fields
            .get("retried")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        info.last_error = fields.get("last_error").cloned();
        info.last_failed_at = parse_time(&fields, "last_failed_at");
        info.completed_at = parse_time(&fields, "completed_at");
        info.next_process_at = parse_time(&fields, "next_process_at");
        info.expires_at = parse_time(&fields, "expires_at");
        Ok(info)
    }

    async fn ping(&self) -> RelayResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("Redis ping failed", e))?;
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        let mut pool = self.pool.write().await;
        pool.clear();
        info!(address = %self.config.address, "Closed Redis broker");
        Ok(())
    }
}
