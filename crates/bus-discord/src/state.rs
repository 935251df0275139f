//! Adapter-local persisted state: bot-owned threads and pending channel
//! messages. Both are simple JSON documents owned exclusively by this
//! process — no advisory locking needed, unlike the shared session store.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bus_core::Result;

/// Threads the bot created or was invited into, keyed by Discord thread id.
/// `None` means "no explicit agent prefix was carried into this thread".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BotThreads(HashMap<String, Option<String>>);

impl BotThreads {
    pub fn load(path: &Path) -> Self {
        read_json(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn owns(&self, thread_id: u64) -> bool {
        self.0.contains_key(&thread_id.to_string())
    }

    pub fn default_agent(&self, thread_id: u64) -> Option<String> {
        self.0.get(&thread_id.to_string()).cloned().flatten()
    }

    pub fn insert(&mut self, thread_id: u64, agent_prefix: Option<String>) {
        self.0.insert(thread_id.to_string(), agent_prefix);
    }
}

/// One channel message still waiting for its response, so a late reply (or
/// one arriving after an adapter restart) can still find its way back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingEntry {
    pub channel_id: u64,
    pub original_message_id: u64,
    /// `Some(thread_id)` once a thread has been created for this message.
    pub thread_id: Option<u64>,
    pub needs_thread: bool,
    pub streaming_message_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingMessages(HashMap<String, PendingEntry>);

impl PendingMessages {
    pub fn load(path: &Path) -> Self {
        read_json(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn insert(&mut self, message_id: String, entry: PendingEntry) {
        self.0.insert(message_id, entry);
    }

    pub fn get(&self, message_id: &str) -> Option<&PendingEntry> {
        self.0.get(message_id)
    }

    pub fn get_mut(&mut self, message_id: &str) -> Option<&mut PendingEntry> {
        self.0.get_mut(message_id)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<PendingEntry> {
        self.0.remove(message_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PendingEntry)> {
        self.0.iter()
    }

    /// Drop entries older than `ttl`, returning how many were removed.
    pub fn prune_expired(&mut self, ttl: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.0.len();
        self.0.retain(|_, e| e.created_at >= cutoff);
        before - self.0.len()
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp: PathBuf = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bot_threads_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bot-threads.json");

        let mut threads = BotThreads::default();
        threads.insert(1, Some("coder".to_string()));
        threads.insert(2, None);
        threads.save(&path).unwrap();

        let loaded = BotThreads::load(&path);
        assert!(loaded.owns(1));
        assert_eq!(loaded.default_agent(1), Some("coder".to_string()));
        assert!(loaded.owns(2));
        assert_eq!(loaded.default_agent(2), None);
        assert!(!loaded.owns(3));
    }

    #[test]
    fn pending_messages_prune_expired_keeps_fresh_entries() {
        let mut pending = PendingMessages::default();
        pending.insert(
            "old".to_string(),
            PendingEntry {
                channel_id: 1,
                original_message_id: 1,
                thread_id: None,
                needs_thread: true,
                streaming_message_id: None,
                created_at: Utc::now() - chrono::Duration::days(10),
            },
        );
        pending.insert(
            "fresh".to_string(),
            PendingEntry {
                channel_id: 1,
                original_message_id: 2,
                thread_id: None,
                needs_thread: false,
                streaming_message_id: None,
                created_at: Utc::now(),
            },
        );

        let removed = pending.prune_expired(Duration::from_secs(3 * 24 * 3600));
        assert_eq!(removed, 1);
        assert!(pending.get("old").is_none());
        assert!(pending.get("fresh").is_some());
    }
}
