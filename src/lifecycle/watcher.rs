use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AgentError, Result};

/// Status-store key of the supervising watcher.
pub const WATCHER_KEY: &str = "watcher";

/// Status-store key of the agent process `pid`.
pub fn agent_key(pid: u32) -> String {
    format!("agent-{}", pid)
}

/// Key/value status entries shared with the watcher, plus one message inbox per key.
#[tonic::async_trait]
pub trait StatusStore: Send + Sync {
    /// The entry for `key`; empty when none was written yet.
    async fn get(&self, key: &str) -> Result<Map<String, Value>>;

    /// Merge `fields` into the entry for `key`.
    async fn put(&self, key: &str, fields: Map<String, Value>) -> Result<()>;

    async fn remove_field(&self, key: &str, field: &str) -> Result<()>;

    /// Append a message to the inbox of `key`.
    async fn send(&self, key: &str, message: &str) -> Result<()>;

    /// Take every pending message from the inbox of `key`.
    async fn drain_inbox(&self, key: &str) -> Result<Vec<String>>;
}

/// Message the watcher leaves in the agent's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherMessage {
    GoAhead,
    Resume,
    StopAcquiring,
    UpgradeInProgress,
    Unknown(String),
}

impl WatcherMessage {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "go-ahead" => WatcherMessage::GoAhead,
            "resume" => WatcherMessage::Resume,
            "stop-acquiring" => WatcherMessage::StopAcquiring,
            "upgrade-in-progress" => WatcherMessage::UpgradeInProgress,
            other => WatcherMessage::Unknown(other.to_string()),
        }
    }
}

/// Signal the agent leaves in the watcher's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    Started,
    /// Scripts were replaced and the agent drained; start the new version
    Respawn,
    Paused,
    Stopped,
}

impl AgentSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSignal::Started => "started",
            AgentSignal::Respawn => "respawn",
            AgentSignal::Paused => "paused",
            AgentSignal::Stopped => "stopped",
        }
    }
}

/// [`StatusStore`] over plain files: `<status_dir>/<key>.json` and `<inbox_dir>/<key>.inbox`.
///
/// Entries are replaced atomically through a rename so the watcher never reads
/// a partial file.
#[derive(Debug)]
pub struct FileStatusStore {
    status_dir: PathBuf,
    inbox_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStatusStore {
    pub async fn open(status_dir: impl Into<PathBuf>, inbox_dir: impl Into<PathBuf>) -> Result<Self> {
        let status_dir = status_dir.into();
        let inbox_dir = inbox_dir.into();
        fs::create_dir_all(&status_dir).await?;
        fs::create_dir_all(&inbox_dir).await?;
        Ok(Self {
            status_dir,
            inbox_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.status_dir.join(format!("{}.json", checked_key(key)?)))
    }

    fn inbox_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.inbox_dir.join(format!("{}.inbox", checked_key(key)?)))
    }

    async fn read_entry(path: &Path) -> Result<Map<String, Value>> {
        match fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entry(path: &Path, entry: &Map<String, Value>) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn checked_key(key: &str) -> Result<&str> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(AgentError::Internal(format!("invalid status key {:?}", key)));
    }
    Ok(key)
}

#[tonic::async_trait]
impl StatusStore for FileStatusStore {
    async fn get(&self, key: &str) -> Result<Map<String, Value>> {
        Self::read_entry(&self.entry_path(key)?).await
    }

    async fn put(&self, key: &str, fields: Map<String, Value>) -> Result<()> {
        let path = self.entry_path(key)?;
        let _guard = self.write_lock.lock().await;
        let mut entry = Self::read_entry(&path).await?;
        entry.extend(fields);
        Self::write_entry(&path, &entry).await
    }

    async fn remove_field(&self, key: &str, field: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        let _guard = self.write_lock.lock().await;
        let mut entry = Self::read_entry(&path).await?;
        if entry.remove(field).is_some() {
            Self::write_entry(&path, &entry).await?;
        }
        Ok(())
    }

    async fn send(&self, key: &str, message: &str) -> Result<()> {
        let path = self.inbox_path(key)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{}\n", message.trim()).as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }

    async fn drain_inbox(&self, key: &str) -> Result<Vec<String>> {
        let path = self.inbox_path(key)?;
        let draining = path.with_extension("inbox.draining");
        match fs::rename(&path, &draining).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        let contents = fs::read_to_string(&draining).await?;
        fs::remove_file(&draining).await?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_put_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::open(dir.path().join("status"), dir.path().join("inbox"))
            .await
            .unwrap();

        assert!(store.get("agent-1").await.unwrap().is_empty());
        store
            .put("agent-1", fields(json!({"version": "1.0.0", "is-new": true})))
            .await
            .unwrap();
        store
            .put("agent-1", fields(json!({"heartbeat": 42})))
            .await
            .unwrap();
        store.remove_field("agent-1", "is-new").await.unwrap();

        let entry = store.get("agent-1").await.unwrap();
        assert_eq!(entry["version"], json!("1.0.0"));
        assert_eq!(entry["heartbeat"], json!(42));
        assert!(!entry.contains_key("is-new"));
    }

    #[tokio::test]
    async fn test_inbox_drains_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::open(dir.path().join("status"), dir.path().join("inbox"))
            .await
            .unwrap();

        store.send("agent-7", "go-ahead").await.unwrap();
        store.send("agent-7", "resume").await.unwrap();
        assert_eq!(
            store.drain_inbox("agent-7").await.unwrap(),
            vec!["go-ahead".to_string(), "resume".to_string()]
        );
        assert!(store.drain_inbox("agent-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::open(dir.path().join("status"), dir.path().join("inbox"))
            .await
            .unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[test]
    fn test_parse_watcher_messages() {
        assert_eq!(WatcherMessage::parse("go-ahead\n"), WatcherMessage::GoAhead);
        assert_eq!(
            WatcherMessage::parse("stop-acquiring"),
            WatcherMessage::StopAcquiring
        );
        assert_eq!(
            WatcherMessage::parse("dance"),
            WatcherMessage::Unknown("dance".into())
        );
        assert_eq!(agent_key(314), "agent-314");
    }
}
