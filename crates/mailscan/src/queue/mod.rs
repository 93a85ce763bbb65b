//! Consumer-group access to the durable job stream.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub mod redis_streams;

pub use redis_streams::RedisStreamQueue;

/// Backend acknowledgment handle of one delivery (the stream entry id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeliveryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One unit of queued work. The raw field map is kept as-is so that shape
/// validation happens in the worker, not in the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub fields: HashMap<String, String>,
}

/// Where a worker reads from and who it reads as.
///
/// `group` is shared by every process of the worker family, `consumer` is
/// unique per process and owns the deliveries it has read but not acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroup {
    pub stream: String,
    pub group: String,
    pub consumer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected reply from queue backend: {0}")]
    Protocol(String),

    #[error("payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Create `group` on `stream`, positioned at the start of the stream.
    /// An existing group is left untouched and reported as
    /// [`GroupStatus::AlreadyExists`].
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, QueueError>;

    /// Wait up to `block` for deliveries addressed to `consumer`. A timeout
    /// yields an empty batch.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Mark a delivery done. Call once per delivery; acking the same handle
    /// twice is a caller bug and backends may treat it as a no-op or an
    /// error.
    async fn ack(&self, stream: &str, group: &str, id: &DeliveryId) -> Result<(), QueueError>;
}
