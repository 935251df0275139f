//! The session store: a single JSON document mapping `sessionKey` to the
//! agent session it currently resumes, shared (and lock-guarded) across the
//! dispatcher, channel adapter, and approval hook processes.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{AgentId, SessionId, SessionKey},
    errors::Error,
    Result,
};

const STALE_LOCK_AGE: Duration = Duration::from_secs(10);
const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(50);
const LOCK_MAX_ATTEMPTS: u32 = 6;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
}

type SessionDocument = HashMap<String, SessionEntry>;

/// Lock-guarded accessor over `thread-sessions.json`. Every mutator acquires
/// an advisory exclusive lock on a sibling `.lock` file before its
/// read-modify-write; reads go straight to disk with no lock and no
/// in-process cache, since other processes may have just written.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    pub async fn get(&self, key: &SessionKey) -> Result<Option<SessionEntry>> {
        let path = self.path.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || {
            let doc = read_document(&path)?;
            Ok(doc.get(&key.0).cloned())
        })
        .await
        .map_err(|e| Error::Session(format!("join error: {e}")))?
    }

    /// Generate a fresh session id, overwriting any prior entry at `key`.
    pub async fn create(&self, key: &SessionKey, agent_id: &AgentId) -> Result<SessionId> {
        let session_id = SessionId(Uuid::new_v4().to_string());
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let key = key.clone();
        let agent_id = agent_id.clone();
        let new_id = session_id.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            with_lock(&lock_path, || {
                let mut doc = read_document(&path)?;
                doc.insert(
                    key.0.clone(),
                    SessionEntry {
                        session_id: new_id.clone(),
                        agent_id: agent_id.clone(),
                        created_at: Utc::now(),
                    },
                );
                write_document(&path, &doc)
            })
        })
        .await
        .map_err(|e| Error::Session(format!("join error: {e}")))??;

        Ok(session_id)
    }

    /// Migrate the entry at `old_key` to `new_key`; a no-op if `old_key` is
    /// absent. Used when a channel message becomes a thread.
    pub async fn remap(&self, old_key: &SessionKey, new_key: &SessionKey) -> Result<()> {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let old_key = old_key.clone();
        let new_key = new_key.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            with_lock(&lock_path, || {
                let mut doc = read_document(&path)?;
                if let Some(entry) = doc.remove(&old_key.0) {
                    doc.insert(new_key.0.clone(), entry);
                    write_document(&path, &doc)?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Session(format!("join error: {e}")))?
    }

    pub async fn delete(&self, key: &SessionKey) -> Result<()> {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            with_lock(&lock_path, || {
                let mut doc = read_document(&path)?;
                doc.remove(&key.0);
                write_document(&path, &doc)
            })
        })
        .await
        .map_err(|e| Error::Session(format!("join error: {e}")))?
    }

    /// Delete entries older than `max_age`, returning the count removed.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> Result<usize> {
            with_lock(&lock_path, || {
                let mut doc = read_document(&path)?;
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
                let before = doc.len();
                doc.retain(|_, entry| entry.created_at >= cutoff);
                let removed = before - doc.len();
                write_document(&path, &doc)?;
                Ok(removed)
            })
        })
        .await
        .map_err(|e| Error::Session(format!("join error: {e}")))?
    }
}

fn read_document(path: &Path) -> Result<SessionDocument> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionDocument::new()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn write_document(path: &Path, doc: &SessionDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(doc)?;
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Acquire an exclusive advisory lock on `lock_path`, breaking a stale lock
/// (older than [`STALE_LOCK_AGE`]) left behind by a crashed holder, with
/// exponential backoff between attempts. Runs `f` while held.
fn with_lock<T>(lock_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let file = open_or_break_stale(lock_path)?;

    let mut delay = LOCK_BACKOFF_BASE;
    let mut acquired = false;
    for _ in 0..LOCK_MAX_ATTEMPTS {
        match file.try_lock_exclusive() {
            Ok(()) => {
                acquired = true;
                break;
            }
            Err(_) => {
                std::thread::sleep(delay);
                delay *= 2;
            }
        }
    }
    if !acquired {
        return Err(Error::Session(
            "timed out waiting for session store lock".to_string(),
        ));
    }

    touch(&file);
    let result = f();
    let _ = fs2::FileExt::unlock(&file);
    result
}

fn open_or_break_stale(lock_path: &Path) -> Result<File> {
    if let Ok(meta) = fs::metadata(lock_path) {
        if let Ok(modified) = meta.modified() {
            if SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default()
                > STALE_LOCK_AGE
            {
                let _ = fs::remove_file(lock_path);
            }
        }
    }

    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(Error::Io)
}

fn touch(file: &File) {
    let mut f = file;
    let _ = f.write_all(b"locked\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("thread-sessions.json"))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = SessionKey::dm("U1");
        let agent = AgentId("default".to_string());

        let id = store.create(&key, &agent).await.unwrap();
        let entry = store.get(&key).await.unwrap().expect("entry present");
        assert_eq!(entry.session_id, id);
        assert_eq!(entry.agent_id, agent);
    }

    #[tokio::test]
    async fn successive_creates_yield_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = SessionKey::dm("U1");
        let agent = AgentId("default".to_string());

        let first = store.create(&key, &agent).await.unwrap();
        let second = store.create(&key, &agent).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn remap_moves_entry_and_is_noop_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let old_key = SessionKey("m1".to_string());
        let new_key = SessionKey("thread_T".to_string());
        let agent = AgentId("default".to_string());

        store.create(&old_key, &agent).await.unwrap();
        store.remap(&old_key, &new_key).await.unwrap();

        assert!(store.get(&old_key).await.unwrap().is_none());
        assert!(store.get(&new_key).await.unwrap().is_some());

        // Remapping again (old key now absent) is a no-op, not an error.
        store.remap(&old_key, &new_key).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_stale_removes_old_entries_only() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = SessionKey::dm("U1");
        let agent = AgentId("default".to_string());
        store.create(&key, &agent).await.unwrap();

        let removed = store
            .cleanup_stale(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(store.get(&key).await.unwrap().is_some());

        let removed = store.cleanup_stale(Duration::from_secs(0)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = SessionKey::dm("U1");
        let agent = AgentId("default".to_string());
        store.create(&key, &agent).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
