//! Hand-off of fired entries to the execution backend.
//!
//! Dispatch is fire-and-forget from the engine's point of view: a failed
//! dispatch is logged and the entry still counts as run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Everything the execution backend needs to run one fired entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Name of the schedule entry that fired.
    pub entry: String,
    /// Task identifier the backend routes on.
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Opaque routing hints (`queue`, `exchange`, `routing_key`, `priority`).
    pub routing_hints: BTreeMap<String, String>,
    /// Do not start the job after this instant.
    pub expires: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hand a fired entry to the backend. Must not fail because the task is
    /// unknown to the backend.
    async fn dispatch(&self, request: DispatchRequest) -> Result<()>;
}

/// Forwards fired entries into an in-process channel.
///
/// Uses `try_send` so a slow consumer never stalls the tick loop; a full or
/// closed channel is reported as a dispatch error.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<DispatchRequest>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        let entry = request.entry.clone();
        self.tx.try_send(request).map_err(|e| {
            warn!(entry = %entry, "dispatch channel full or closed");
            SchedulerError::Dispatch(e.to_string())
        })
    }
}

/// Message pushed onto a Redis list for workers to pop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique per dispatch, lets workers deduplicate at-least-once deliveries.
    pub id: String,
    #[serde(flatten)]
    pub request: DispatchRequest,
}

/// Pushes fired entries onto `queue:<name>` in Redis with `LPUSH`.
///
/// The queue name comes from the entry's `queue` routing hint, falling back
/// to the configured default queue.
pub struct RedisQueueDispatcher {
    conn: redis::aio::ConnectionManager,
    default_queue: String,
}

impl RedisQueueDispatcher {
    pub async fn connect(url: &str, default_queue: impl Into<String>) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| SchedulerError::Dispatch(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| SchedulerError::Dispatch(e.to_string()))?;
        Ok(Self {
            conn,
            default_queue: default_queue.into(),
        })
    }

    pub fn queue_key(&self, request: &DispatchRequest) -> String {
        let queue = request
            .routing_hints
            .get("queue")
            .map(String::as_str)
            .unwrap_or(&self.default_queue);
        format!("queue:{queue}")
    }
}

#[async_trait]
impl Dispatcher for RedisQueueDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        let key = self.queue_key(&request);
        let message = QueueMessage {
            id: Uuid::new_v4().to_string(),
            request,
        };
        let body =
            serde_json::to_string(&message).map_err(|e| SchedulerError::Dispatch(e.to_string()))?;

        let mut conn = self.conn.clone();
        redis::AsyncCommands::lpush::<_, _, ()>(&mut conn, &key, body)
            .await
            .map_err(|e| SchedulerError::Dispatch(e.to_string()))?;
        debug!(queue = %key, message_id = %message.id, "entry pushed to queue");
        Ok(())
    }
}
