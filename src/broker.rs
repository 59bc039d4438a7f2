//! Typed wrapper over the subset of redis-streams primitives this crate
//! needs: XADD/XREADGROUP/XREAD/XPENDING/XCLAIM/XACK/XINFO/XREVRANGE plus
//! the key/sorted-set primitives backing locks, bookmarks and the
//! transaction store. No `redis::RedisError` crosses this boundary —
//! everything is translated into [`BrokerError`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Script, Value};
use tracing::{debug, info};

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub values: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: i64,
    pub delivery_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub consumers: i64,
    pub pending: i64,
    pub last_delivered_id: String,
}

/// The broker adapter (C1). Implemented once over `redis::aio::ConnectionManager`
/// for production use and once as an in-memory fake for tests that must not
/// reach a live Redis instance.
pub trait Broker: Send + Sync + 'static {
    fn append(
        &self,
        stream: &str,
        values: &HashMap<String, String>,
    ) -> impl Future<Output = Result<String, BrokerError>> + Send;

    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: i64,
        block: Option<Duration>,
    ) -> impl Future<Output = Result<Vec<StreamEntry>, BrokerError>> + Send;

    fn read(
        &self,
        stream: &str,
        start_id: &str,
        max: i64,
        block: Option<Duration>,
    ) -> impl Future<Output = Result<Vec<StreamEntry>, BrokerError>> + Send;

    fn pending_ext(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        max: i64,
    ) -> impl Future<Output = Result<Vec<PendingEntry>, BrokerError>> + Send;

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<StreamEntry>, BrokerError>> + Send;

    fn ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn group_info(
        &self,
        stream: &str,
        group: &str,
    ) -> impl Future<Output = Result<GroupInfo, BrokerError>> + Send;

    fn last_entry(
        &self,
        stream: &str,
    ) -> impl Future<Output = Result<Option<StreamEntry>, BrokerError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, BrokerError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Returns `true` if the key was newly set (it was absent).
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool, BrokerError>> + Send;

    /// Returns `true` if the member was newly added.
    fn zadd_only_new(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> impl Future<Output = Result<bool, BrokerError>> + Send;

    fn zcard(&self, key: &str) -> impl Future<Output = Result<i64, BrokerError>> + Send;

    fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> impl Future<Output = Result<Vec<String>, BrokerError>> + Send;

    /// `SET key value NX PX ttl`. Returns `true` if acquired.
    fn acquire_lock(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, BrokerError>> + Send;

    /// Atomic compare-value-and-delete. Returns `Ok(())` if released,
    /// `Err(BrokerError::LockValueMismatch)` if the value didn't match
    /// (someone else now owns the key, or it already expired).
    fn release_lock(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// `if GET(K)==V then DEL(K) else 0` — a single round-trip, so release can
/// never race with another worker's acquire between the GET and the DEL.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

pub struct RedisBroker {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            conn,
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn map_err(e: RedisError) -> BrokerError {
        let msg = e.to_string();
        if msg.contains("no such key") {
            BrokerError::KeyDoesNotExist
        } else if msg.contains("NOGROUP") {
            BrokerError::GroupNotFound
        } else {
            BrokerError::Transport(msg)
        }
    }

    fn value_to_string(v: &Value) -> Option<String> {
        match v {
            Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
            Value::SimpleString(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    /// Parses the `[[id, [k, v, k, v, ...]], ...]` shape shared by
    /// XCLAIM / XAUTOCLAIM's claimed-entries element.
    fn parse_raw_entries(value: &Value) -> Vec<StreamEntry> {
        let mut out = Vec::new();
        if let Value::Array(entries) = value {
            for entry in entries {
                if let Value::Array(pair) = entry {
                    if pair.len() != 2 {
                        continue;
                    }
                    let Some(id) = Self::value_to_string(&pair[0]) else {
                        continue;
                    };
                    let mut values = HashMap::new();
                    if let Value::Array(fields) = &pair[1] {
                        let mut it = fields.iter();
                        while let (Some(k), Some(v)) = (it.next(), it.next()) {
                            if let (Some(k), Some(v)) = (Self::value_to_string(k), Self::value_to_string(v)) {
                                values.insert(k, v);
                            }
                        }
                    }
                    out.push(StreamEntry { id, values });
                }
            }
        }
        out
    }
}

impl Broker for RedisBroker {
    async fn append(&self, stream: &str, values: &HashMap<String, String>) -> Result<String, BrokerError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in values {
            cmd.arg(k).arg(v);
        }
        cmd.query_async(&mut conn).await.map_err(Self::map_err)
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => {
                info!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: i64,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(max as usize);
        if let Some(block) = block {
            opts = opts.block(block_millis(block));
        }
        let result: Result<StreamReadReply, RedisError> =
            conn.xread_options(&[stream], &[">"], &opts).await;
        match result {
            Ok(reply) => Ok(Self::flatten_reply(reply)),
            Err(e) if is_timeout(&e) => Ok(Vec::new()),
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn read(
        &self,
        stream: &str,
        start_id: &str,
        max: i64,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn();
        let mut opts = StreamReadOptions::default().count(max as usize);
        if let Some(block) = block {
            opts = opts.block(block_millis(block));
        }
        let result: Result<StreamReadReply, RedisError> =
            conn.xread_options(&[stream], &[start_id], &opts).await;
        match result {
            Ok(reply) => Ok(Self::flatten_reply(reply)),
            Err(e) if is_timeout(&e) => Ok(Vec::new()),
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn pending_ext(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        max: i64,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.conn();
        let value: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as i64)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let mut out = Vec::new();
        if let Value::Array(rows) = value {
            for row in rows {
                if let Value::Array(fields) = row {
                    if fields.len() != 4 {
                        continue;
                    }
                    let id = Self::value_to_string(&fields[0]).unwrap_or_default();
                    let consumer = Self::value_to_string(&fields[1]).unwrap_or_default();
                    let idle_ms = Self::value_to_string(&fields[2])
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let delivery_count = Self::value_to_string(&fields[3])
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    out.push(PendingEntry {
                        id,
                        consumer,
                        idle_ms,
                        delivery_count,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle.as_millis() as i64);
        for id in ids {
            cmd.arg(id);
        }
        let value: Value = cmd.query_async(&mut conn).await.map_err(Self::map_err)?;
        Ok(Self::parse_raw_entries(&value))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: i64 = conn.xack(stream, group, ids).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn group_info(&self, stream: &str, group: &str) -> Result<GroupInfo, BrokerError> {
        let mut conn = self.conn();
        let value: Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let Value::Array(groups) = value else {
            return Err(BrokerError::GroupNotFound);
        };
        for g in groups {
            let Value::Array(fields) = g else { continue };
            let mut map = HashMap::new();
            let mut it = fields.into_iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                if let Some(k) = Self::value_to_string(&k) {
                    map.insert(k, v);
                }
            }
            let name = map.get("name").and_then(Self::value_to_string);
            if name.as_deref() != Some(group) {
                continue;
            }
            let consumers = map
                .get("consumers")
                .and_then(Self::value_to_string)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let pending = map
                .get("pending")
                .and_then(Self::value_to_string)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let last_delivered_id = map
                .get("last-delivered-id")
                .and_then(Self::value_to_string)
                .unwrap_or_else(|| "0-0".to_string());
            return Ok(GroupInfo {
                consumers,
                pending,
                last_delivered_id,
            });
        }
        Err(BrokerError::GroupNotFound)
    }

    async fn last_entry(&self, stream: &str) -> Result<Option<StreamEntry>, BrokerError> {
        let mut conn = self.conn();
        let value: Value = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(Self::parse_raw_entries(&value).into_iter().next())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.exec_async(&mut conn).await.map_err(Self::map_err)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(Self::map_err)?;
        Ok(result.is_some())
    }

    async fn zadd_only_new(&self, key: &str, score: f64, member: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(added > 0)
    }

    async fn zcard(&self, key: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn();
        conn.zcard(key).await.map_err(Self::map_err)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        conn.zrange(key, start as isize, stop as isize).await.map_err(Self::map_err)
    }

    async fn acquire_lock(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(result.is_some())
    }

    async fn release_lock(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let released: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        if released == 1 {
            Ok(())
        } else {
            Err(BrokerError::LockValueMismatch)
        }
    }
}

impl RedisBroker {
    fn flatten_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
        let mut out = Vec::new();
        for stream_key in reply.keys {
            for message in stream_key.ids {
                let mut values = HashMap::new();
                for (k, v) in message.map {
                    if let Some(v) = Self::value_to_string(&v) {
                        values.insert(k, v);
                    }
                }
                out.push(StreamEntry { id: message.id, values });
            }
        }
        out
    }
}

/// `Duration::MAX` is this crate's "block forever" sentinel (used by the
/// payout-config client's blocking read); Redis spells that as `BLOCK 0`.
fn block_millis(d: Duration) -> usize {
    if d == Duration::MAX {
        0
    } else {
        d.as_millis() as usize
    }
}

fn is_timeout(e: &RedisError) -> bool {
    let s = e.to_string().to_lowercase();
    s.contains("timeout") || s.contains("timed out") || s.contains("response was of incompatible type")
}
