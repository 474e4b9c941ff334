use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::record::QuotaRecord;
use super::store::{QuotaStore, QuotaStoreError};

/// Quota records in one JSON document keyed by user id.
///
/// Every load re-reads the file, and every persist merges the single
/// user's record into what is currently on disk, so writers for other
/// users sharing the file are not clobbered.
#[derive(Debug)]
pub struct JsonFileQuotaStore {
    path: PathBuf,
    free_limit: u32,
    lock: Mutex<()>,
}

impl JsonFileQuotaStore {
    pub fn new(path: impl Into<PathBuf>, free_limit: u32) -> Self {
        Self {
            path: path.into(),
            free_limit,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn user_ids(&self) -> Result<Vec<String>, QuotaStoreError> {
        let mut ids: Vec<String> = read_json_object(&self.path)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

impl QuotaStore for JsonFileQuotaStore {
    fn load(&self, user_id: &str) -> Result<QuotaRecord, QuotaStoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| QuotaStoreError::unavailable("quota file lock poisoned"))?;
        let payload = read_json_object(&self.path)?;
        let Some(raw) = payload.get(user_id) else {
            return Ok(QuotaRecord::fresh(user_id, self.free_limit));
        };
        serde_json::from_value(raw.clone()).map_err(|err| QuotaStoreError::Corrupt {
            user_id: user_id.to_string(),
            message: err.to_string(),
        })
    }

    fn persist(&self, record: &QuotaRecord) -> Result<(), QuotaStoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| QuotaStoreError::unavailable("quota file lock poisoned"))?;
        let mut on_disk = read_json_object(&self.path)?;
        let snapshot = serde_json::to_value(record)
            .map_err(|err| QuotaStoreError::unavailable(format!("encode failed: {err}")))?;
        on_disk.insert(record.user_id.clone(), snapshot);
        write_json_object(&self.path, &on_disk)
    }
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>, QuotaStoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(QuotaStoreError::unavailable(format!(
                "failed reading {}: {err}",
                path.display()
            )))
        }
    };
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw).map_err(|err| QuotaStoreError::Corrupt {
        user_id: "*".to_string(),
        message: format!("{}: {err}", path.display()),
    })?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(QuotaStoreError::Corrupt {
            user_id: "*".to_string(),
            message: format!("{} is not a JSON object", path.display()),
        }),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> Result<(), QuotaStoreError> {
    let io_err = |err: std::io::Error| {
        QuotaStoreError::unavailable(format!("failed writing {}: {err}", path.display()))
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_string_pretty(&Value::Object(payload.clone()))
        .map_err(|err| QuotaStoreError::unavailable(format!("encode failed: {err}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
