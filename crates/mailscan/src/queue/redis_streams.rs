//! Redis Streams backend (XGROUP / XREADGROUP / XAUTOCLAIM / XACK).
//!
//! A read serves, in order:
//! 1. this consumer's own pending entries (left unacked by an earlier
//!    failed dispatch, or by a previous life of the same consumer name),
//! 2. idle entries of other consumers, when reclaiming is enabled,
//! 3. new entries, blocking up to the requested duration.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::{Delivery, DeliveryId, GroupStatus, QueueConsumer, QueueError};
use crate::jobs::model::JobPayload;

const CURSOR_START: &str = "0-0";

// Upper bound on XAUTOCLAIM calls within one read.
const MAX_RECLAIM_PASSES: usize = 8;

#[derive(Clone)]
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    reclaim_idle: Option<Duration>,
    // Where the next XAUTOCLAIM scan resumes in the pending list.
    reclaim_cursor: Arc<Mutex<String>>,
}

impl RedisStreamQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            reclaim_idle: None,
            reclaim_cursor: Arc::new(Mutex::new(CURSOR_START.to_string())),
        })
    }

    /// Claim deliveries other consumers have held for longer than `idle`.
    pub fn with_reclaim_idle(mut self, idle: Option<Duration>) -> Self {
        self.reclaim_idle = idle;
        self
    }

    /// Append a job payload to `stream`.
    pub async fn publish(
        &self,
        stream: &str,
        payload: &JobPayload,
    ) -> Result<DeliveryId, QueueError> {
        let fields = payload.to_fields()?;
        self.publish_fields(stream, &fields).await
    }

    /// Append a raw entry. Producers other than [`Self::publish`] are not
    /// validated here.
    pub async fn publish_fields(
        &self,
        stream: &str,
        fields: &[(&str, String)],
    ) -> Result<DeliveryId, QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(DeliveryId(id))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
        from_id: &str,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(from_id);

        let reply: Value = cmd.query_async(&mut conn).await?;
        parse_read_reply(reply)
    }

    /// Claim up to `count` entries idle for at least `idle`.
    ///
    /// Redis inspects a bounded slice of the pending list per call, so the
    /// scan resumes from the cursor the previous call returned and keeps
    /// going until something is claimed or the list wraps around.
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        idle: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let mut wrapped = false;

        for _ in 0..MAX_RECLAIM_PASSES {
            let cursor = self.cursor();
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(stream)
                .arg(group)
                .arg(consumer)
                .arg(idle.as_millis() as u64)
                .arg(&cursor)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;

            let (next, claimed) = parse_autoclaim_reply(reply)?;
            let at_end = next == CURSOR_START;
            self.set_cursor(next);

            if !claimed.is_empty() {
                return Ok(claimed);
            }
            if at_end {
                if wrapped || cursor == CURSOR_START {
                    break;
                }
                wrapped = true;
            }
        }
        Ok(Vec::new())
    }

    fn cursor(&self) -> String {
        match self.reclaim_cursor.lock() {
            Ok(cursor) => cursor.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cursor(&self, next: String) {
        match self.reclaim_cursor.lock() {
            Ok(mut cursor) => *cursor = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[async_trait]
impl QueueConsumer for RedisStreamQueue {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, QueueError> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match res {
            Ok(()) => Ok(GroupStatus::Created),
            Err(e) if is_busy_group(&e) => Ok(GroupStatus::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let count = max_count.max(1);

        let pending = self
            .read_group(stream, group, consumer, count, None, "0")
            .await?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        if let Some(idle) = self.reclaim_idle {
            let claimed = self.reclaim(stream, group, consumer, count, idle).await?;
            if !claimed.is_empty() {
                debug!(stream, group, consumer, claimed = claimed.len(), "reclaimed idle deliveries");
                return Ok(claimed);
            }
        }

        self.read_group(stream, group, consumer, count, Some(block), ">")
            .await
    }

    async fn ack(&self, stream: &str, group: &str, id: &DeliveryId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(&id.0)
            .query_async(&mut conn)
            .await?;

        if acked == 0 {
            debug!(stream, group, delivery_id = %id, "delivery was not pending, ack was a no-op");
        }
        Ok(())
    }
}

fn is_busy_group(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
}

// XREADGROUP: nil on timeout, else [[stream, [entry, ...]], ...]
fn parse_read_reply(reply: Value) -> Result<Vec<Delivery>, QueueError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => {
            return Err(QueueError::Protocol(format!(
                "XREADGROUP returned {other:?}"
            )))
        }
    };

    let mut out = Vec::new();
    for stream in streams {
        let Value::Bulk(mut parts) = stream else {
            return Err(QueueError::Protocol("stream element is not an array".into()));
        };
        if parts.len() != 2 {
            return Err(QueueError::Protocol(format!(
                "stream element has {} parts",
                parts.len()
            )));
        }
        if let Some(entries) = parts.pop() {
            parse_entries(entries, &mut out)?;
        }
    }
    Ok(out)
}

// XAUTOCLAIM: [next-cursor, [entry, ...]] plus deleted ids on Redis 7.
fn parse_autoclaim_reply(reply: Value) -> Result<(String, Vec<Delivery>), QueueError> {
    let Value::Bulk(parts) = reply else {
        return Err(QueueError::Protocol(format!("XAUTOCLAIM returned {reply:?}")));
    };
    let mut parts = parts.into_iter();

    let next: String = match parts.next() {
        Some(v) => redis::from_redis_value(&v)?,
        None => return Err(QueueError::Protocol("XAUTOCLAIM reply without cursor".into())),
    };

    let mut out = Vec::new();
    if let Some(entries) = parts.next() {
        parse_entries(entries, &mut out)?;
    }
    Ok((next, out))
}

fn parse_entries(entries: Value, out: &mut Vec<Delivery>) -> Result<(), QueueError> {
    match entries {
        Value::Nil => Ok(()),
        Value::Bulk(entries) => {
            for entry in entries {
                if let Some(delivery) = parse_entry(entry)? {
                    out.push(delivery);
                }
            }
            Ok(())
        }
        other => Err(QueueError::Protocol(format!("entry list is {other:?}"))),
    }
}

// [id, [field, value, ...]]; the field list is nil when the entry was
// deleted from the stream while still pending.
fn parse_entry(entry: Value) -> Result<Option<Delivery>, QueueError> {
    let Value::Bulk(parts) = entry else {
        return Ok(None);
    };
    let mut parts = parts.into_iter();

    let id: String = match parts.next() {
        Some(v) => redis::from_redis_value(&v)?,
        None => return Err(QueueError::Protocol("stream entry without id".into())),
    };

    let mut fields = HashMap::new();
    if let Some(Value::Bulk(kv)) = parts.next() {
        for pair in kv.chunks(2) {
            if let [k, v] = pair {
                fields.insert(redis::from_redis_value(k)?, redis::from_redis_value(v)?);
            }
        }
    }

    Ok(Some(Delivery {
        id: DeliveryId(id),
        fields,
    }))
}
