//! The file-queue bus: crash-safe, multi-writer/multi-reader message
//! handoff between channel adapters and the dispatcher, built entirely on
//! atomic directory operations (write-then-rename, rename-to-claim,
//! mtime-based staleness).

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    domain::{AgentId, MessageId, SessionKey},
    errors::Error,
    Result,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub channel: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub message: String,
    pub timestamp: String,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<SessionKey>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingResponse {
    pub channel: String,
    pub sender: String,
    pub message: String,
    pub original_message: String,
    pub timestamp: String,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingPartial {
    pub status: String,
    pub channel: String,
    pub sender: String,
    pub message_id: MessageId,
    pub partial: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelable: Option<bool>,
}

impl StreamingPartial {
    pub fn new(channel: &str, sender: &str, message_id: MessageId, partial: String) -> Self {
        Self {
            status: "streaming".to_string(),
            channel: channel.to_string(),
            sender: sender.to_string(),
            message_id,
            partial,
            agent: None,
            timestamp: crate::utils::iso_timestamp_utc(),
            cancelable: Some(true),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSignal {
    pub message_id: MessageId,
    pub timestamp: String,
}

/// Handle onto one bus's queue directories, bound to a single config.
#[derive(Clone, Debug)]
pub struct Queue {
    incoming: PathBuf,
    processing: PathBuf,
    outgoing: PathBuf,
    dead_letter: PathBuf,
    cancel: PathBuf,
    tmp: PathBuf,
    pub max_retry_count: u32,
    pub stuck_processing_threshold: Duration,
}

impl Queue {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            incoming: cfg.incoming_dir(),
            processing: cfg.processing_dir(),
            outgoing: cfg.outgoing_dir(),
            dead_letter: cfg.dead_letter_dir(),
            cancel: cfg.cancel_dir(),
            tmp: cfg.tmp_dir(),
            max_retry_count: cfg.max_retry_count,
            stuck_processing_threshold: cfg.stuck_processing_threshold,
        }
    }

    /// Write `value` to a temp file on the same filesystem as `dest_dir`,
    /// then atomically rename it into place. The sole primitive every other
    /// file write in this module is built on.
    async fn write_atomic(dest_dir: &Path, tmp_dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        tokio::fs::create_dir_all(tmp_dir).await?;
        let staged = tmp_dir.join(format!("{filename}.{}", Uuid::new_v4()));
        tokio::fs::write(&staged, bytes).await?;
        let dest = dest_dir.join(filename);
        tokio::fs::rename(&staged, &dest).await?;
        Ok(dest)
    }

    fn unique_suffix() -> String {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let rand = &Uuid::new_v4().simple().to_string()[..8];
        format!("{epoch}_{rand}")
    }

    /// Enqueue a freshly-produced message. Filename: `<channel>_<unique>.json`.
    pub async fn enqueue_incoming(&self, msg: &IncomingMessage) -> Result<PathBuf> {
        let filename = format!("{}_{}.json", msg.channel, Self::unique_suffix());
        let bytes = serde_json::to_vec_pretty(msg)?;
        Self::write_atomic(&self.incoming, &self.tmp, &filename, &bytes).await
    }

    /// List `incoming/`, oldest-first by mtime, and attempt to claim the
    /// first file whose rename into `processing/` succeeds. Skips (rather
    /// than errors on) files that vanish out from under us — another
    /// dispatcher won the race, or the producer is still writing.
    pub async fn claim_next(&self) -> Result<Option<(PathBuf, IncomingMessage)>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.incoming).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            entries.push((modified, path));
        }
        entries.sort_by_key(|(m, _)| *m);

        for (_, path) in entries {
            let Some(basename) = path.file_name() else {
                continue;
            };
            let dest = self.processing.join(basename);
            tokio::fs::create_dir_all(&self.processing).await?;
            if tokio::fs::rename(&path, &dest).await.is_err() {
                continue; // claimed by someone else, or the file was already moved/deleted
            }
            match Self::read_message(&dest).await {
                Ok(msg) => return Ok(Some((dest, msg))),
                Err(_) => {
                    // Corrupt JSON: treat per the retry/dead-letter rule rather
                    // than crash the claim loop.
                    let mut msg = IncomingMessage {
                        channel: "unknown".to_string(),
                        sender: "unknown".to_string(),
                        sender_id: None,
                        message: String::new(),
                        timestamp: crate::utils::iso_timestamp_utc(),
                        message_id: MessageId(basename.to_string_lossy().to_string()),
                        agent: None,
                        files: Vec::new(),
                        session_key: None,
                        retry_count: self.max_retry_count,
                    };
                    msg.retry_count = self.max_retry_count; // force straight to dead-letter
                    self.fail_processing(&dest, msg).await?;
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn read_message(path: &Path) -> Result<IncomingMessage> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(Error::Json)
    }

    /// Write a final response into `outgoing/` without touching the
    /// processing file — shared by the success path (`complete`, which also
    /// removes it) and the failure path (which routes it through
    /// `fail_processing` instead).
    pub async fn write_response(&self, resp: &OutgoingResponse) -> Result<PathBuf> {
        let filename = format!(
            "{}_{}_{}.json",
            resp.channel,
            resp.message_id,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        );
        let bytes = serde_json::to_vec_pretty(resp)?;
        Self::write_atomic(&self.outgoing, &self.tmp, &filename, &bytes).await
    }

    /// Success path: write the final response, then remove the processing
    /// file.
    pub async fn complete(&self, processing_path: &Path, resp: &OutgoingResponse) -> Result<()> {
        self.write_response(resp).await?;
        let _ = tokio::fs::remove_file(processing_path).await;
        Ok(())
    }

    /// Failure path: increment `retryCount`, then either return the message
    /// to `incoming/` or move it to `dead-letter/`.
    pub async fn fail_processing(&self, processing_path: &Path, mut msg: IncomingMessage) -> Result<()> {
        msg.retry_count += 1;

        if msg.retry_count < self.max_retry_count {
            let filename = format!("{}_{}.json", msg.channel, Self::unique_suffix());
            let bytes = serde_json::to_vec_pretty(&msg)?;
            Self::write_atomic(&self.incoming, &self.tmp, &filename, &bytes).await?;
        } else {
            let Some(basename) = processing_path.file_name() else {
                return Err(Error::Queue("processing file has no basename".to_string()));
            };
            tokio::fs::create_dir_all(&self.dead_letter).await?;
            let bytes = serde_json::to_vec_pretty(&msg)?;
            let staged = self.tmp.join(format!("dl-{}", Uuid::new_v4()));
            tokio::fs::write(&staged, &bytes).await?;
            tokio::fs::rename(&staged, self.dead_letter.join(basename)).await?;
        }

        let _ = tokio::fs::remove_file(processing_path).await;
        Ok(())
    }

    pub async fn write_streaming_partial(&self, partial: &StreamingPartial) -> Result<PathBuf> {
        let filename = format!("{}.streaming", partial.message_id);
        let bytes = serde_json::to_vec_pretty(partial)?;
        // Overwritten in place: write straight to the destination name inside
        // outgoing/, no temp+rename needed since only the dispatcher that
        // owns this message id ever writes it.
        tokio::fs::create_dir_all(&self.outgoing).await?;
        let dest = self.outgoing.join(filename);
        tokio::fs::write(&dest, bytes).await?;
        Ok(dest)
    }

    pub async fn delete_streaming_partial(&self, message_id: &MessageId) -> Result<()> {
        let path = self.outgoing.join(format!("{message_id}.streaming"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Scan `processing/` for files whose mtime is older than
    /// `stuck_processing_threshold` and route them back through the
    /// retry/dead-letter rule, same as a reported failure. Returns the
    /// number of files recovered.
    pub async fn sweep_stuck(&self) -> Result<usize> {
        let mut recovered = 0;
        let mut dir = match tokio::fs::read_dir(&self.processing).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        let now = SystemTime::now();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.stuck_processing_threshold {
                continue;
            }

            let msg = match Self::read_message(&path).await {
                Ok(m) => m,
                Err(_) => IncomingMessage {
                    channel: "unknown".to_string(),
                    sender: "unknown".to_string(),
                    sender_id: None,
                    message: String::new(),
                    timestamp: crate::utils::iso_timestamp_utc(),
                    message_id: MessageId(
                        path.file_name().unwrap_or_default().to_string_lossy().to_string(),
                    ),
                    agent: None,
                    files: Vec::new(),
                    session_key: None,
                    retry_count: self.max_retry_count,
                },
            };
            self.fail_processing(&path, msg).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Drain `cancel/`, returning the message ids whose cancellation was
    /// requested, deleting each signal file as it's read.
    pub async fn poll_cancel(&self) -> Result<Vec<MessageId>> {
        let mut ids = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.cancel).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(signal) = serde_json::from_slice::<CancelSignal>(&bytes) {
                    ids.push(signal.message_id);
                }
            }
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(ids)
    }

    pub async fn publish_cancel(&self, message_id: &MessageId) -> Result<()> {
        let signal = CancelSignal {
            message_id: message_id.clone(),
            timestamp: crate::utils::iso_timestamp_utc(),
        };
        let filename = format!("{message_id}.json");
        let bytes = serde_json::to_vec_pretty(&signal)?;
        Self::write_atomic(&self.cancel, &self.tmp, &filename, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> Queue {
        Queue {
            incoming: dir.path().join("incoming"),
            processing: dir.path().join("processing"),
            outgoing: dir.path().join("outgoing"),
            dead_letter: dir.path().join("dead-letter"),
            cancel: dir.path().join("cancel"),
            tmp: dir.path().join("tmp"),
            max_retry_count: 3,
            stuck_processing_threshold: StdDuration::from_secs(900),
        }
    }

    fn msg(message_id: &str) -> IncomingMessage {
        IncomingMessage {
            channel: "discord".to_string(),
            sender: "alice".to_string(),
            sender_id: None,
            message: "hi".to_string(),
            timestamp: "t".to_string(),
            message_id: MessageId(message_id.to_string()),
            agent: None,
            files: Vec::new(),
            session_key: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trips() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.enqueue_incoming(&msg("m1")).await.unwrap();

        let (path, claimed) = q.claim_next().await.unwrap().expect("claimed a message");
        assert_eq!(claimed.message_id, MessageId("m1".to_string()));
        assert!(path.starts_with(&q.processing));
        assert!(!q.incoming.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false));
    }

    #[tokio::test]
    async fn claim_is_exclusive_across_two_attempts() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.enqueue_incoming(&msg("m1")).await.unwrap();

        let first = q.claim_next().await.unwrap();
        assert!(first.is_some());
        let second = q.claim_next().await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn complete_removes_processing_file_and_writes_response() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.enqueue_incoming(&msg("m1")).await.unwrap();
        let (path, claimed) = q.claim_next().await.unwrap().unwrap();

        let resp = OutgoingResponse {
            channel: "discord".to_string(),
            sender: "alice".to_string(),
            message: "hello".to_string(),
            original_message: claimed.message.clone(),
            timestamp: "t".to_string(),
            message_id: claimed.message_id.clone(),
            agent: None,
            files: Vec::new(),
        };
        q.complete(&path, &resp).await.unwrap();

        assert!(!path.exists());
        let mut out = tokio::fs::read_dir(&q.outgoing).await.unwrap();
        assert!(out.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fail_processing_requeues_until_retry_exhaustion() {
        let dir = TempDir::new().unwrap();
        let mut q = queue(&dir);
        q.max_retry_count = 2;
        q.enqueue_incoming(&msg("m1")).await.unwrap();

        let (path, claimed) = q.claim_next().await.unwrap().unwrap();
        q.fail_processing(&path, claimed).await.unwrap();

        // retryCount is now 1 < 2, so it's back in incoming/.
        let (path2, claimed2) = q.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed2.retry_count, 1);

        q.fail_processing(&path2, claimed2).await.unwrap();
        // retryCount is now 2 >= 2, so it went to dead-letter instead.
        assert!(q.claim_next().await.unwrap().is_none());
        let mut dl = tokio::fs::read_dir(&q.dead_letter).await.unwrap();
        assert!(dl.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_stuck_recovers_old_processing_files() {
        let dir = TempDir::new().unwrap();
        let mut q = queue(&dir);
        q.stuck_processing_threshold = StdDuration::from_secs(0);
        q.enqueue_incoming(&msg("m1")).await.unwrap();
        q.claim_next().await.unwrap();

        let recovered = q.sweep_stuck().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(q.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn streaming_partial_write_then_delete() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let partial = StreamingPartial::new("discord", "alice", MessageId("m1".to_string()), "hel".to_string());
        let path = q.write_streaming_partial(&partial).await.unwrap();
        assert!(path.exists());
        q.delete_streaming_partial(&MessageId("m1".to_string())).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cancel_signal_round_trips_and_is_consumed_once() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.publish_cancel(&MessageId("m1".to_string())).await.unwrap();

        let ids = q.poll_cancel().await.unwrap();
        assert_eq!(ids, vec![MessageId("m1".to_string())]);
        assert!(q.poll_cancel().await.unwrap().is_empty());
    }
}
