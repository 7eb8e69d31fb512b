use crate::models::PendingUpload;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Pending image per sender. Backends must expire entries after the TTL
/// given to `put` and must make `take` atomic.
#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    async fn put(
        &self,
        sender_id: &str,
        media_ref: &str,
        workflow_id: Uuid,
        ttl: Duration,
    ) -> Result<PendingUpload, StoreError>;

    async fn get(&self, sender_id: &str) -> Result<Option<PendingUpload>, StoreError>;

    async fn delete(&self, sender_id: &str) -> Result<(), StoreError>;

    /// Removes the entry only if it still belongs to `workflow_id`.
    /// Returns whether this caller consumed it.
    async fn take(&self, sender_id: &str, workflow_id: Uuid) -> Result<bool, StoreError>;
}

fn pending_upload(
    sender_id: &str,
    media_ref: &str,
    workflow_id: Uuid,
    ttl: Duration,
) -> PendingUpload {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
    PendingUpload {
        sender_id: sender_id.to_string(),
        media_ref: media_ref.to_string(),
        workflow_id,
        expires_at: Utc::now() + ttl,
    }
}

struct Entry {
    upload: PendingUpload,
    deadline: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Single-instance backend. Expiry is checked on read and by a periodic sweep.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = store.sweep().await;
                if removed > 0 {
                    debug!(target = "intake.store", removed, "expired pending uploads swept");
                }
            }
        })
    }

    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        let before = guard.len();
        guard.retain(|_, entry| !entry.expired(now));
        before - guard.len()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl ConversationStateStore for InMemoryStateStore {
    async fn put(
        &self,
        sender_id: &str,
        media_ref: &str,
        workflow_id: Uuid,
        ttl: Duration,
    ) -> Result<PendingUpload, StoreError> {
        let upload = pending_upload(sender_id, media_ref, workflow_id, ttl);
        let entry = Entry {
            upload: upload.clone(),
            deadline: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .await
            .insert(sender_id.to_string(), entry);
        Ok(upload)
    }

    async fn get(&self, sender_id: &str) -> Result<Option<PendingUpload>, StoreError> {
        let mut guard = self.entries.lock().await;
        match guard.get(sender_id) {
            Some(entry) if entry.expired(Instant::now()) => {
                guard.remove(sender_id);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.upload.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, sender_id: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(sender_id);
        Ok(())
    }

    async fn take(&self, sender_id: &str, workflow_id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.entries.lock().await;
        let owned = guard.get(sender_id).is_some_and(|entry| {
            entry.upload.workflow_id == workflow_id && !entry.expired(Instant::now())
        });
        if owned {
            guard.remove(sender_id);
        }
        Ok(owned)
    }
}

const KEY_PREFIX: &str = "intake:pending:";

// Compare-and-delete on the JSON payload's workflow id.
const TAKE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, entry = pcall(cjson.decode, raw)
if ok and entry['workflow_id'] == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Shared backend for multi-instance deployments.
#[derive(Clone)]
pub struct RedisStateStore {
    client: redis::Client,
}

impl RedisStateStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    fn key(sender_id: &str) -> String {
        format!("{KEY_PREFIX}{sender_id}")
    }
}

#[async_trait]
impl ConversationStateStore for RedisStateStore {
    async fn put(
        &self,
        sender_id: &str,
        media_ref: &str,
        workflow_id: Uuid,
        ttl: Duration,
    ) -> Result<PendingUpload, StoreError> {
        let upload = pending_upload(sender_id, media_ref, workflow_id, ttl);
        let json =
            serde_json::to_string(&upload).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(Self::key(sender_id), json, seconds)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(upload)
    }

    async fn get(&self, sender_id: &str) -> Result<Option<PendingUpload>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(Self::key(sender_id))
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<PendingUpload>(&raw) {
            Ok(upload) => Ok(Some(upload)),
            Err(err) => {
                warn!(target = "intake.store", sender = %sender_id, error = %err, "dropping unreadable pending upload");
                let _: Result<(), _> = conn.del(Self::key(sender_id)).await;
                Ok(None)
            }
        }
    }

    async fn delete(&self, sender_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(Self::key(sender_id))
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn take(&self, sender_id: &str, workflow_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(TAKE_SCRIPT)
            .key(Self::key(sender_id))
            .arg(workflow_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(removed > 0)
    }
}
