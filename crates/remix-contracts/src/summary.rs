use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::outcomes::{BatchResult, BatchStatus, ErrorKind, GenerationOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub descriptor_id: String,
    /// `succeeded` or `failed`.
    pub status: String,
    pub reason: Option<ErrorKind>,
    pub detail: Option<String>,
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub user_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: BatchStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<SummaryItem>,
}

impl BatchSummary {
    /// `image_paths` maps descriptor ids to where their image was written.
    pub fn from_result(
        result: &BatchResult,
        user_id: &str,
        started_at: String,
        finished_at: String,
        image_paths: &HashMap<String, PathBuf>,
    ) -> Self {
        let items = result
            .outcomes()
            .iter()
            .map(|outcome| {
                let image_path = image_paths
                    .get(outcome.descriptor_id())
                    .map(|path| path.to_string_lossy().to_string());
                match outcome {
                    GenerationOutcome::Success { descriptor_id, .. } => SummaryItem {
                        descriptor_id: descriptor_id.clone(),
                        status: "succeeded".to_string(),
                        reason: None,
                        detail: None,
                        image_path,
                    },
                    GenerationOutcome::Failure {
                        descriptor_id,
                        reason,
                        detail,
                    } => SummaryItem {
                        descriptor_id: descriptor_id.clone(),
                        status: "failed".to_string(),
                        reason: Some(*reason),
                        detail: Some(detail.clone()).filter(|text| !text.is_empty()),
                        image_path: None,
                    },
                }
            })
            .collect();
        Self {
            batch_id: result.batch_id().to_string(),
            user_id: user_id.to_string(),
            started_at,
            finished_at,
            status: result.status(),
            succeeded: result.succeeded_count(),
            failed: result.failed_count(),
            items,
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}
