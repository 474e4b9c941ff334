use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assets::BinaryAsset;

/// Why a single descriptor did not produce an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuotaExceeded,
    TransportError,
    RateLimited,
    InvalidRequest,
    NoImageProduced,
    Aborted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::TransportError => "transport_error",
            Self::RateLimited => "rate_limited",
            Self::InvalidRequest => "invalid_request",
            Self::NoImageProduced => "no_image_produced",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success {
        descriptor_id: String,
        image_asset: BinaryAsset,
    },
    Failure {
        descriptor_id: String,
        reason: ErrorKind,
        detail: String,
    },
}

impl GenerationOutcome {
    pub fn success(descriptor_id: impl Into<String>, image_asset: BinaryAsset) -> Self {
        Self::Success {
            descriptor_id: descriptor_id.into(),
            image_asset,
        }
    }

    pub fn failure(
        descriptor_id: impl Into<String>,
        reason: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::Failure {
            descriptor_id: descriptor_id.into(),
            reason,
            detail: detail.into(),
        }
    }

    pub fn descriptor_id(&self) -> &str {
        match self {
            Self::Success { descriptor_id, .. } | Self::Failure { descriptor_id, .. } => {
                descriptor_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_reason(&self) -> Option<ErrorKind> {
        match self {
            Self::Failure { reason, .. } => Some(*reason),
            Self::Success { .. } => None,
        }
    }

    pub fn image(&self) -> Option<&BinaryAsset> {
        match self {
            Self::Success { image_asset, .. } => Some(image_asset),
            Self::Failure { .. } => None,
        }
    }
}

/// How a batch run ended as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every descriptor was attempted or skipped for exhausted quota mid-batch.
    Completed,
    /// The gate refused the batch before any network call.
    QuotaExceeded,
    Cancelled,
    StorageUnavailable,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Cancelled => "cancelled",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-descriptor outcomes of one batch, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    batch_id: String,
    status: BatchStatus,
    outcomes: Vec<GenerationOutcome>,
    succeeded_count: usize,
    failed_count: usize,
}

impl BatchResult {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn outcomes(&self) -> &[GenerationOutcome] {
        &self.outcomes
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded_count
    }

    pub fn failed_count(&self) -> usize {
        self.failed_count
    }
}

/// Mutable accumulator that seals into a [`BatchResult`].
#[derive(Debug, Clone)]
pub struct BatchRecorder {
    batch_id: String,
    outcomes: Vec<GenerationOutcome>,
    succeeded_count: usize,
    failed_count: usize,
}

impl BatchRecorder {
    pub fn new(batch_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            batch_id: batch_id.into(),
            outcomes: Vec::with_capacity(capacity),
            succeeded_count: 0,
            failed_count: 0,
        }
    }

    pub fn record(&mut self, outcome: GenerationOutcome) {
        if outcome.is_success() {
            self.succeeded_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn recorded(&self) -> usize {
        self.outcomes.len()
    }

    pub fn finish(self, status: BatchStatus) -> BatchResult {
        BatchResult {
            batch_id: self.batch_id,
            status,
            outcomes: self.outcomes,
            succeeded_count: self.succeeded_count,
            failed_count: self.failed_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::assets::BinaryAsset;

    use super::{BatchRecorder, BatchStatus, ErrorKind, GenerationOutcome};

    #[test]
    fn recorder_counts_and_keeps_order() {
        let mut recorder = BatchRecorder::new("batch-1", 3);
        recorder.record(GenerationOutcome::success(
            "a",
            BinaryAsset::new(vec![1], "image/png"),
        ));
        recorder.record(GenerationOutcome::failure(
            "b",
            ErrorKind::NoImageProduced,
            "only text",
        ));
        recorder.record(GenerationOutcome::failure("c", ErrorKind::Aborted, ""));
        let result = recorder.finish(BatchStatus::Cancelled);

        assert_eq!(result.batch_id(), "batch-1");
        assert_eq!(result.status(), BatchStatus::Cancelled);
        assert_eq!(result.succeeded_count(), 1);
        assert_eq!(result.failed_count(), 2);
        let ids: Vec<&str> = result
            .outcomes()
            .iter()
            .map(GenerationOutcome::descriptor_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(
            result.outcomes()[1].failure_reason(),
            Some(ErrorKind::NoImageProduced)
        );
    }

    #[test]
    fn error_kind_serializes_snake_case() -> anyhow::Result<()> {
        assert_eq!(
            serde_json::to_value(ErrorKind::NoImageProduced)?,
            serde_json::json!("no_image_produced")
        );
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate_limited");
        Ok(())
    }
}
