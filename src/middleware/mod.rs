//! Middleware processor: bridges the RCON stream into Redis.
//!
//! Every inbound message is fanned out into capped Redis lists (static queues
//! plus a dynamically-membered set of queues), periodic interval callbacks
//! store the latest result of a command under a named key, and a
//! callback-request list lets external actors enqueue one-shot commands and
//! pick the results up by id.

pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use redis::RedisResult;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::webrcon::{CommandSender, MessageCallback, Response, ResponseCallback};
use pool::RedisPool;

/// Replaces the `{tag}` token in configured queue and key templates.
pub fn apply_tag(template: &str, tag: &str) -> String {
    template.replace("{tag}", tag)
}

/// Tick predicate shared by the periodic loops. Jobs with a non-positive
/// interval never fire from a tick.
pub(crate) fn interval_due(ticks: i64, interval: i64) -> bool {
    interval > 0 && ticks % interval == 0
}

/// One-shot command request drained from the callback queue.
#[derive(Debug, Deserialize)]
struct CallbackRequest {
    id: i64,
    command: String,
}

struct IntervalCallback {
    command: String,
    interval: i64,
    storage_key: String,
}

pub struct Processor {
    tag: String,
    rcon: Arc<dyn CommandSender>,
    pool: Arc<RedisPool>,
    callback_queue_key: Option<String>,
    callback_expire: u64,
    interval_callbacks: Vec<IntervalCallback>,
}

impl Processor {
    pub fn new(
        tag: &str,
        rcon: Arc<dyn CommandSender>,
        pool: Arc<RedisPool>,
        callback_queue_key: Option<&str>,
        callback_expire: u64,
    ) -> Self {
        Self {
            tag: tag.to_string(),
            rcon,
            pool,
            callback_queue_key: callback_queue_key.map(|key| apply_tag(key, tag)),
            callback_expire,
            interval_callbacks: Vec::new(),
        }
    }

    /// Startup connectivity check. Failures are reported, not fatal.
    pub async fn ping(&self) -> RedisResult<()> {
        self.pool.ping().await
    }

    /// Registers a command to run every `interval` ticks, storing the latest
    /// response under `storage_key`.
    pub fn add_interval_callback(&mut self, command: &str, interval: i64, storage_key: &str) {
        log::info!(
            "Registering interval callback {} every {}s into {}",
            command,
            interval,
            storage_key
        );
        self.interval_callbacks.push(IntervalCallback {
            command: command.to_string(),
            interval,
            storage_key: apply_tag(storage_key, &self.tag),
        });
    }

    /// Response handler that stores the response message under the given key.
    /// Also used for `run_on_connect` interval callbacks.
    pub fn storage_callback(&self, storage_key: &str) -> Arc<dyn ResponseCallback> {
        Arc::new(StorageKeyWriter {
            key: apply_tag(storage_key, &self.tag),
            pool: self.pool.clone(),
        })
    }

    fn run_interval_callback(&self, callback: &IntervalCallback) {
        log::debug!(
            "Time to run {}, interval {}",
            callback.command,
            callback.interval
        );
        let writer = Arc::new(StorageKeyWriter {
            key: callback.storage_key.clone(),
            pool: self.pool.clone(),
        });
        let cache_for = (callback.interval - 1).max(0) as u64;
        self.rcon
            .send_with_callback(&callback.command, cache_for, writer);
    }

    /// Atomically drains the callback-request list and issues each requested
    /// command; results land under `<queue>:results:<id>`.
    async fn process_callback_requests(&self) {
        let Some(queue_key) = &self.callback_queue_key else {
            return;
        };

        let requests = match drain_list(&self.pool, queue_key).await {
            Ok(requests) => requests,
            Err(e) => {
                log::error!("Error draining callback requests: {}", e);
                return;
            }
        };

        for raw in requests {
            let request: CallbackRequest = match serde_json::from_str(&raw) {
                Ok(request) => request,
                Err(e) => {
                    log::error!("Error decoding callback request: {}", e);
                    continue;
                }
            };

            let writer = Arc::new(ResultWriter {
                key: format!("{}:results:{}", queue_key, request.id),
                expire: self.callback_expire,
                pool: self.pool.clone(),
            });
            self.rcon.send_with_callback(&request.command, 0, writer);
        }
    }

    /// Tick loop. Runs until the shutdown channel closes.
    pub async fn process(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        log::info!("Starting up middleware processor");
        let mut ticks: i64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(Duration::from_secs(1)) => {}
            }

            ticks += 1;
            self.process_callback_requests().await;

            for callback in &self.interval_callbacks {
                if interval_due(ticks, callback.interval) {
                    self.run_interval_callback(callback);
                }
            }
        }

        log::info!("Shutting down middleware processor");
    }
}

/// LRANGE + DEL under one MULTI/EXEC so requests are claimed exactly once.
async fn drain_list(pool: &RedisPool, key: &str) -> RedisResult<Vec<String>> {
    let mut connection = pool.get().await?;
    let (requests, _removed): (Vec<String>, i64) = redis::pipe()
        .atomic()
        .cmd("LRANGE")
        .arg(key)
        .arg(0)
        .arg(-1)
        .cmd("DEL")
        .arg(key)
        .query_async(&mut connection)
        .await?;
    pool.put(connection).await;
    Ok(requests)
}

async fn set_value(pool: &RedisPool, key: &str, value: &str, expire: u64) -> RedisResult<()> {
    let mut connection = pool.get().await?;
    if expire > 0 {
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(expire)
            .arg(value)
            .query_async(&mut connection)
            .await?;
    } else {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut connection)
            .await?;
    }
    pool.put(connection).await;
    Ok(())
}

/// LTRIM to the cap, then LPUSH, inside one transaction, so a queue holds at
/// most `max_queue_size` entries with the newest at the head.
async fn push_capped(
    pool: &RedisPool,
    queue: &str,
    max_queue_size: i64,
    payload: Vec<u8>,
) -> RedisResult<()> {
    let mut connection = pool.get().await?;
    let _: () = redis::pipe()
        .atomic()
        .cmd("LTRIM")
        .arg(queue)
        .arg(0)
        .arg(max_queue_size - 2)
        .ignore()
        .cmd("LPUSH")
        .arg(queue)
        .arg(payload)
        .ignore()
        .query_async(&mut connection)
        .await?;
    pool.put(connection).await;
    Ok(())
}

/// Stores a response message under a fixed key.
struct StorageKeyWriter {
    key: String,
    pool: Arc<RedisPool>,
}

impl ResponseCallback for StorageKeyWriter {
    fn on_response(&self, response: &Response) {
        let pool = self.pool.clone();
        let key = self.key.clone();
        let value = response.message.clone();
        tokio::spawn(async move {
            if let Err(e) = set_value(&pool, &key, &value, 0).await {
                log::error!("Error writing {} to Redis: {}", key, e);
            }
        });
    }
}

/// Stores a callback-request result, optionally with an expiry.
struct ResultWriter {
    key: String,
    expire: u64,
    pool: Arc<RedisPool>,
}

impl ResponseCallback for ResultWriter {
    fn on_response(&self, response: &Response) {
        let pool = self.pool.clone();
        let key = self.key.clone();
        let expire = self.expire;
        let value = response.message.clone();
        tokio::spawn(async move {
            if let Err(e) = set_value(&pool, &key, &value, expire).await {
                log::error!("Error writing callback result {}: {}", key, e);
            }
        });
    }
}

/// Mirrors every inbound RCON message into one capped static queue.
pub struct QueueFanout {
    queue: String,
    max_queue_size: i64,
    pool: Arc<RedisPool>,
}

impl QueueFanout {
    pub fn new(
        queues_prefix: &str,
        suffix: &str,
        tag: &str,
        max_queue_size: i64,
        pool: Arc<RedisPool>,
    ) -> Self {
        Self {
            queue: apply_tag(&format!("{}:{}", queues_prefix, suffix), tag),
            max_queue_size,
            pool,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

impl MessageCallback for QueueFanout {
    fn on_message(&self, raw: &[u8]) {
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let max_queue_size = self.max_queue_size;
        let payload = raw.to_vec();
        tokio::spawn(async move {
            if let Err(e) = push_capped(&pool, &queue, max_queue_size, payload).await {
                log::error!("Error pushing to queue {}: {}", queue, e);
            }
        });
    }
}

/// Mirrors every inbound RCON message into each queue currently listed in a
/// Redis set. Membership is re-read per message, never cached.
pub struct DynamicQueueFanout {
    membership_key: String,
    queues_prefix: String,
    tag: String,
    max_queue_size: i64,
    pool: Arc<RedisPool>,
}

impl DynamicQueueFanout {
    pub fn new(
        membership_key: &str,
        queues_prefix: &str,
        tag: &str,
        max_queue_size: i64,
        pool: Arc<RedisPool>,
    ) -> Self {
        Self {
            membership_key: apply_tag(membership_key, tag),
            queues_prefix: queues_prefix.to_string(),
            tag: tag.to_string(),
            max_queue_size,
            pool,
        }
    }
}

async fn dynamic_fan_out(
    pool: Arc<RedisPool>,
    membership_key: String,
    queues_prefix: String,
    tag: String,
    max_queue_size: i64,
    payload: Vec<u8>,
) {
    let members = match read_members(&pool, &membership_key).await {
        Ok(members) => members,
        Err(e) => {
            log::error!("Error reading dynamic queue membership: {}", e);
            return;
        }
    };

    for suffix in members {
        let queue = apply_tag(&format!("{}:{}", queues_prefix, suffix), &tag);
        if let Err(e) = push_capped(&pool, &queue, max_queue_size, payload.clone()).await {
            log::error!("Error pushing to dynamic queue {}: {}", queue, e);
        }
    }
}

async fn read_members(pool: &RedisPool, key: &str) -> RedisResult<Vec<String>> {
    let mut connection = pool.get().await?;
    let members: Vec<String> = redis::cmd("SMEMBERS")
        .arg(key)
        .query_async(&mut connection)
        .await?;
    pool.put(connection).await;
    Ok(members)
}

impl MessageCallback for DynamicQueueFanout {
    fn on_message(&self, raw: &[u8]) {
        tokio::spawn(dynamic_fan_out(
            self.pool.clone(),
            self.membership_key.clone(),
            self.queues_prefix.clone(),
            self.tag.clone(),
            self.max_queue_size,
            raw.to_vec(),
        ));
    }
}
