use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::{HistoryStore, InstanceRecord, InstanceUpdate, ProviderError, validate_commit};
use crate::Event;

const RECORD_FILE: &str = "instance.json";
const HISTORY_FILE: &str = "history.jsonl";

/// Filesystem-backed store: one directory per instance holding the
/// instance record and a JSONL history.
///
/// Instances survive process restarts, which is what lets a new runtime
/// resume in-flight work.
pub struct FsHistoryStore {
    root: PathBuf,
    // Serializes writers so record and history never diverge within a process.
    write_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a store rooted at `root`. With `reset_on_create`, existing data is wiped.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&root);
        }
        // best-effort; surfaced on first write otherwise
        let _ = std::fs::create_dir_all(&root);
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(encode_dir_name(instance))
    }

    async fn load_record(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let path = self.inst_root(instance).join(RECORD_FILE);
        match fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| ProviderError::corrupt("instance", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io("instance", e)),
        }
    }

    async fn read_history_file(&self, instance: &str, operation: &str) -> Result<Option<String>, ProviderError> {
        match fs::read_to_string(self.inst_root(instance).join(HISTORY_FILE)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io(operation, e)),
        }
    }

    async fn load_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let Some(data) = self.read_history_file(instance, "read").await? else {
            return Ok(Vec::new());
        };
        let parsed = parse_history(&data).map_err(|e| ProviderError::corrupt("read", e))?;
        if parsed.torn {
            warn!(instance_id = %instance, intact_bytes = parsed.intact, "ignoring torn history tail");
        }
        Ok(parsed.events)
    }

    /// History for a writer. A torn tail left by an interrupted append is cut
    /// off first so the next append starts on a fresh line.
    async fn load_history_for_append(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let Some(data) = self.read_history_file(instance, "commit").await? else {
            return Ok(Vec::new());
        };
        let parsed = parse_history(&data).map_err(|e| ProviderError::corrupt("commit", e))?;
        let mut intact = data[..parsed.intact].to_string();
        let unterminated = !intact.is_empty() && !intact.ends_with('\n');
        if parsed.torn || unterminated {
            warn!(
                instance_id = %instance,
                dropped_bytes = data.len() - parsed.intact,
                "repairing torn history tail"
            );
            if unterminated {
                intact.push('\n');
            }
            let dir = self.inst_root(instance);
            let tmp = dir.join(format!("{HISTORY_FILE}.tmp"));
            fs::write(&tmp, intact)
                .await
                .map_err(|e| ProviderError::io("commit", e))?;
            fs::rename(&tmp, dir.join(HISTORY_FILE))
                .await
                .map_err(|e| ProviderError::io("commit", e))?;
        }
        Ok(parsed.events)
    }

    async fn write_record(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let dir = self.inst_root(&record.instance_id);
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(record).map_err(|e| ProviderError::corrupt("write_record", e))?;
        fs::write(&tmp, body)
            .await
            .map_err(|e| ProviderError::io("write_record", e))?;
        fs::rename(&tmp, dir.join(RECORD_FILE))
            .await
            .map_err(|e| ProviderError::io("write_record", e))
    }

    async fn append_events(&self, instance: &str, events: &[Event]) -> Result<(), ProviderError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for e in events {
            let line = serde_json::to_string(e).map_err(|e| ProviderError::corrupt("append", e))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.inst_root(instance).join(HISTORY_FILE))
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.flush().await.map_err(|e| ProviderError::io("append", e))
    }
}

struct ParsedHistory {
    events: Vec<Event>,
    /// Byte length of the prefix holding `events`.
    intact: usize,
    /// The final line did not parse.
    torn: bool,
}

/// Only the last line may be torn; a bad line followed by others is corruption.
fn parse_history(data: &str) -> Result<ParsedHistory, serde_json::Error> {
    let mut events = Vec::new();
    let mut intact = 0;
    let mut lines = data.split_inclusive('\n').peekable();
    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            intact += line.len();
            continue;
        }
        match serde_json::from_str::<Event>(line.trim()) {
            Ok(event) => {
                events.push(event);
                intact += line.len();
            }
            Err(_) if lines.peek().is_none() => {
                return Ok(ParsedHistory {
                    events,
                    intact,
                    torn: true,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ParsedHistory {
        events,
        intact,
        torn: false,
    })
}

/// Keep instance ids such as `parent::sub::0` portable as directory names.
fn encode_dir_name(instance: &str) -> String {
    let mut out = String::with_capacity(instance.len());
    for b in instance.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<bool, ProviderError> {
        let _guard = self.write_lock.lock().await;
        if self.load_record(&record.instance_id).await?.is_some() {
            return Ok(false);
        }
        fs::create_dir_all(self.inst_root(&record.instance_id))
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        self.append_events(&record.instance_id, &[record.started_event()]).await?;
        self.write_record(&record).await?;
        Ok(true)
    }

    async fn instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.load_record(instance).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.load_history(instance).await
    }

    async fn commit(
        &self,
        instance: &str,
        events: Vec<Event>,
        update: Option<InstanceUpdate>,
    ) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load_record(instance)
            .await?
            .ok_or_else(|| ProviderError::permanent("commit", format!("instance not found: {instance}")))?;
        let history = self.load_history_for_append(instance).await?;
        let accepted = validate_commit(&record, &history, events, update.as_ref())?;
        self.append_events(instance, &accepted).await?;
        record.apply(update);
        self.write_record(&record).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(ProviderError::io("list_instances", e)),
        };
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| ProviderError::io("list_instances", e))?
        {
            let path = entry.path().join(RECORD_FILE);
            let Ok(data) = fs::read_to_string(&path).await else {
                continue;
            };
            let record: InstanceRecord =
                serde_json::from_str(&data).map_err(|e| ProviderError::corrupt("list_instances", e))?;
            ids.push(record.instance_id);
        }
        ids.sort();
        Ok(ids)
    }
}
