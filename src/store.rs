use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::Killmail;
use crate::tracker::Tracker;
use crate::webhook::Webhook;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Main,
    Error,
}

impl QueueKind {
    fn suffix(&self) -> &'static str {
        match self {
            QueueKind::Main => "main",
            QueueKind::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    expires_at: DateTime<Utc>,
    token: u64,
}

/// Guard for a held TTL lock. Dropping it releases the lock, unless the lock
/// already expired and was re-acquired by someone else in the meantime.
pub struct LockGuard {
    path: PathBuf,
    token: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Ok(content) = fs::read_to_string(&self.path) {
            if let Ok(record) = serde_json::from_str::<LockRecord>(&content) {
                if record.token == self.token {
                    let _ = fs::remove_file(&self.path);
                }
            }
        }
    }
}

/// File-backed storage for everything that must survive a restart: tracker
/// and webhook configuration, the per-webhook FIFO queues, rate-limit blocks,
/// TTL locks and the optional killmail archive. All mutation happens under a
/// per-file lock and files are replaced atomically (write + rename).
pub struct Storage {
    root: PathBuf,
    file_locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["queues", "blocks", "locks", "killmails"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Storage {
            root,
            file_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    // --- Tracker / webhook repositories ---

    async fn load_map<T: DeserializeOwned>(&self, file: &str) -> Result<HashMap<u64, T>, StoreError> {
        let path = self.root.join(file);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        Ok(Self::read_json(&path)?.unwrap_or_default())
    }

    async fn update_map<T, F>(&self, file: &str, mutate: F) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut HashMap<u64, T>),
    {
        let path = self.root.join(file);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        let mut map: HashMap<u64, T> = Self::read_json(&path)?.unwrap_or_default();
        mutate(&mut map);
        Self::write_json(&path, &map)
    }

    pub async fn tracker(&self, id: u64) -> Result<Option<Tracker>, StoreError> {
        Ok(self.load_map::<Tracker>("trackers.json").await?.remove(&id))
    }

    pub async fn trackers(&self) -> Result<Vec<Tracker>, StoreError> {
        let mut trackers: Vec<Tracker> = self
            .load_map::<Tracker>("trackers.json")
            .await?
            .into_values()
            .collect();
        trackers.sort_by_key(|t| t.id);
        Ok(trackers)
    }

    pub async fn save_tracker(&self, tracker: &Tracker) -> Result<(), StoreError> {
        tracker
            .validate()
            .map_err(|e| StoreError::Config(e.to_string()))?;
        let tracker = tracker.clone();
        self.update_map("trackers.json", move |map: &mut HashMap<u64, Tracker>| {
            map.insert(tracker.id, tracker);
        })
        .await
    }

    pub async fn delete_tracker(&self, id: u64) -> Result<(), StoreError> {
        self.update_map("trackers.json", move |map: &mut HashMap<u64, Tracker>| {
            map.remove(&id);
        })
        .await
    }

    pub async fn webhook(&self, id: u64) -> Result<Option<Webhook>, StoreError> {
        Ok(self.load_map::<Webhook>("webhooks.json").await?.remove(&id))
    }

    pub async fn webhooks(&self) -> Result<Vec<Webhook>, StoreError> {
        let mut webhooks: Vec<Webhook> = self
            .load_map::<Webhook>("webhooks.json")
            .await?
            .into_values()
            .collect();
        webhooks.sort_by_key(|w| w.id);
        Ok(webhooks)
    }

    pub async fn save_webhook(&self, webhook: &Webhook) -> Result<(), StoreError> {
        webhook
            .validate()
            .map_err(|e| StoreError::Config(e.to_string()))?;
        let webhook = webhook.clone();
        self.update_map("webhooks.json", move |map: &mut HashMap<u64, Webhook>| {
            map.insert(webhook.id, webhook);
        })
        .await
    }

    /// Chat-group id to Discord role id map used for group pings.
    pub async fn group_roles(&self) -> Result<HashMap<u64, u64>, StoreError> {
        self.load_map::<u64>("group_roles.json").await
    }

    pub async fn save_group_roles(&self, roles: &HashMap<u64, u64>) -> Result<(), StoreError> {
        let roles = roles.clone();
        self.update_map("group_roles.json", move |map: &mut HashMap<u64, u64>| {
            *map = roles;
        })
        .await
    }

    /// Character id to auth-state id map backing the state clauses.
    pub async fn user_states(&self) -> Result<HashMap<u64, u64>, StoreError> {
        self.load_map::<u64>("user_states.json").await
    }

    pub async fn save_user_states(&self, states: &HashMap<u64, u64>) -> Result<(), StoreError> {
        let states = states.clone();
        self.update_map("user_states.json", move |map: &mut HashMap<u64, u64>| {
            *map = states;
        })
        .await
    }

    // --- Per-webhook FIFO queues ---

    fn queue_path(&self, webhook_id: u64, kind: QueueKind) -> PathBuf {
        self.root
            .join("queues")
            .join(format!("{}-{}.json", webhook_id, kind.suffix()))
    }

    async fn with_queue<R, F>(&self, path: PathBuf, mutate: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<String>) -> R,
    {
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        let mut queue: Vec<String> = Self::read_json(&path)?.unwrap_or_default();
        let result = mutate(&mut queue);
        Self::write_json(&path, &queue)?;
        Ok(result)
    }

    pub async fn enqueue(
        &self,
        webhook_id: u64,
        kind: QueueKind,
        payload: String,
    ) -> Result<(), StoreError> {
        self.with_queue(self.queue_path(webhook_id, kind), |queue| {
            queue.push(payload);
        })
        .await
    }

    /// Puts a payload back at the head of the queue so delivery order is
    /// preserved across retries.
    pub async fn requeue_front(
        &self,
        webhook_id: u64,
        kind: QueueKind,
        payload: String,
    ) -> Result<(), StoreError> {
        self.with_queue(self.queue_path(webhook_id, kind), |queue| {
            queue.insert(0, payload);
        })
        .await
    }

    pub async fn dequeue(
        &self,
        webhook_id: u64,
        kind: QueueKind,
    ) -> Result<Option<String>, StoreError> {
        self.with_queue(self.queue_path(webhook_id, kind), |queue| {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        })
        .await
    }

    pub async fn queue_size(&self, webhook_id: u64, kind: QueueKind) -> Result<usize, StoreError> {
        let path = self.queue_path(webhook_id, kind);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        let queue: Vec<String> = Self::read_json(&path)?.unwrap_or_default();
        Ok(queue.len())
    }

    pub async fn clear_queue(&self, webhook_id: u64, kind: QueueKind) -> Result<usize, StoreError> {
        self.with_queue(self.queue_path(webhook_id, kind), |queue| {
            let count = queue.len();
            queue.clear();
            count
        })
        .await
    }

    /// Moves all error-queue items to the tail of the main queue so transient
    /// failures get another try. Returns the number of moved messages.
    pub async fn reset_failed_messages(&self, webhook_id: u64) -> Result<usize, StoreError> {
        let failed = {
            let path = self.queue_path(webhook_id, QueueKind::Error);
            let lock = self.file_lock(&path);
            let _guard = lock.lock().await;
            let queue: Vec<String> = Self::read_json(&path)?.unwrap_or_default();
            Self::write_json(&path, &Vec::<String>::new())?;
            queue
        };
        let count = failed.len();
        if count > 0 {
            self.with_queue(self.queue_path(webhook_id, QueueKind::Main), |queue| {
                queue.extend(failed);
            })
            .await?;
        }
        Ok(count)
    }

    // --- Rate-limit blocks ---

    fn block_path(&self, webhook_id: u64) -> PathBuf {
        self.root.join("blocks").join(format!("{}.json", webhook_id))
    }

    pub async fn blocked_until(&self, webhook_id: u64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.block_path(webhook_id);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        Self::read_json(&path)
    }

    pub async fn set_blocked_until(
        &self,
        webhook_id: u64,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let path = self.block_path(webhook_id);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        Self::write_json(&path, &until)
    }

    pub async fn clear_blocked_until(&self, webhook_id: u64) -> Result<(), StoreError> {
        let path = self.block_path(webhook_id);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    // --- TTL locks ---

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.json", name.replace(':', "-")))
    }

    /// Tries to acquire the named lock. Fails immediately when another holder
    /// has it and its TTL has not expired yet; an expired lock is reclaimed.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> Option<LockGuard> {
        let path = self.lock_path(name);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;

        match Self::read_json::<LockRecord>(&path) {
            Ok(Some(record)) if record.expires_at > Utc::now() => return None,
            Ok(_) => {}
            Err(e) => {
                warn!("Unreadable lock file {:?}, reclaiming: {}", path, e);
            }
        }

        let record = LockRecord {
            expires_at: Utc::now() + ttl,
            token: rand::random(),
        };
        if let Err(e) = Self::write_json(&path, &record) {
            warn!("Failed to write lock file {:?}: {}", path, e);
            return None;
        }
        Some(LockGuard {
            path,
            token: record.token,
        })
    }

    // --- Killmail archive ---

    fn killmail_path(&self, killmail_id: i64) -> PathBuf {
        self.root
            .join("killmails")
            .join(format!("{}.json", killmail_id))
    }

    /// Persists a killmail. Returns false when the id is already archived;
    /// duplicates from the feed are expected and not an error.
    pub async fn archive_killmail(&self, killmail: &Killmail) -> Result<bool, StoreError> {
        let path = self.killmail_path(killmail.id);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        if path.exists() {
            info!("Killmail {} is already archived", killmail.id);
            return Ok(false);
        }
        Self::write_json(&path, killmail)?;
        Ok(true)
    }

    pub async fn archived_killmail(&self, killmail_id: i64) -> Result<Option<Killmail>, StoreError> {
        let path = self.killmail_path(killmail_id);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;
        Self::read_json(&path)
    }

    /// Deletes archived killmails whose event time is older than the cutoff.
    pub async fn purge_killmails_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let dir = self.root.join("killmails");
        let mut purged = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let killmail: Option<Killmail> = match Self::read_json(&path) {
                Ok(k) => k,
                Err(e) => {
                    warn!("Skipping unreadable archive file {:?}: {}", path, e);
                    continue;
                }
            };
            if let Some(killmail) = killmail {
                if killmail.time.with_timezone(&Utc) < cutoff {
                    fs::remove_file(&path)?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}
