use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEventKind {
    BatchStarted,
    QuotaChecked,
    DescriptorStarted,
    DescriptorFinished,
    QuotaRecorded,
    BatchFinished,
}

impl BatchEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchStarted => "batch_started",
            Self::QuotaChecked => "quota_checked",
            Self::DescriptorStarted => "descriptor_started",
            Self::DescriptorFinished => "descriptor_finished",
            Self::QuotaRecorded => "quota_recorded",
            Self::BatchFinished => "batch_finished",
        }
    }
}

/// Append-only `events.jsonl` journal for batch runs.
///
/// - default fields are `type`, `batch_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// Clones share the file lock, so a writer scoped to another batch via
/// [`EventWriter::for_batch`] interleaves whole lines safely.
#[derive(Debug, Clone)]
pub struct EventWriter {
    sink: Arc<EventSink>,
    batch_id: String,
}

#[derive(Debug)]
struct EventSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            sink: Arc::new(EventSink {
                path: path.into(),
                lock: Mutex::new(()),
            }),
            batch_id: batch_id.into(),
        }
    }

    pub fn for_batch(&self, batch_id: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            batch_id: batch_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.sink.path
    }

    pub fn emit(&self, kind: BatchEventKind, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert("batch_id".to_string(), Value::String(self.batch_id.clone()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(payload);

        if let Some(parent) = self.sink.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .sink
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sink.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("user_id".to_string(), json!("alice"));
        let emitted = writer.emit(BatchEventKind::BatchStarted, payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("batch_started"));
        assert_eq!(parsed["batch_id"], json!("batch-123"));
        assert_eq!(parsed["user_id"], json!("alice"));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("batch_id".to_string(), json!("override"));
        let emitted = writer.emit(BatchEventKind::QuotaChecked, payload)?;

        assert_eq!(emitted["batch_id"], json!("override"));
        assert_eq!(emitted["type"], json!("quota_checked"));
        Ok(())
    }

    #[test]
    fn scoped_writers_append_to_the_same_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("runs").join("events.jsonl");
        let first = EventWriter::new(&path, "batch-1");
        let second = first.for_batch("batch-2");

        first.emit(BatchEventKind::BatchStarted, EventPayload::new())?;
        second.emit(BatchEventKind::BatchFinished, EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["batch_id"], json!("batch-1"));
        assert_eq!(lines[1]["batch_id"], json!("batch-2"));
        assert_eq!(lines[1]["type"], json!("batch_finished"));
        assert_eq!(second.path(), path.as_path());
        Ok(())
    }
}
