use std::collections::HashSet;

use chrono::Utc;
use remix_contracts::events::{BatchEventKind, EventPayload, EventWriter};
use remix_contracts::quota::{QuotaRecord, QuotaStore, QuotaStoreError};
use remix_contracts::{
    BatchRecorder, BatchResult, BatchStatus, Descriptor, ErrorKind, GenerationOutcome,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::ResponseAssembler;
use crate::cancel::CancellationToken;
use crate::client::GenerationClient;

/// Lifecycle of one `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    QuotaChecking,
    Blocked,
    Running,
    Completed,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("batch must contain at least one descriptor")]
    EmptyBatch,
    #[error("user id must not be empty")]
    InvalidUserId,
    #[error("descriptor at position {0} has an empty id")]
    EmptyDescriptorId(usize),
    #[error("descriptor id '{0}' appears more than once in the batch")]
    DuplicateDescriptorId(String),
    /// Quota could not be read or written. `partial` holds every outcome
    /// reached so far, with the rest marked `Aborted`.
    #[error("batch aborted: {source}")]
    StorageUnavailable {
        partial: Box<BatchResult>,
        source: QuotaStoreError,
    },
}

impl OrchestratorError {
    pub fn partial_result(&self) -> Option<&BatchResult> {
        match self {
            Self::StorageUnavailable { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Drives a batch of descriptors to a [`BatchResult`] under quota control.
///
/// Descriptors run strictly one after another. Quota is re-checked before
/// every call and persisted after every success, so the check-then-act
/// window never spans two generations. Do not parallelise this loop.
pub struct GenerationOrchestrator<'a> {
    store: &'a dyn QuotaStore,
    client: &'a dyn GenerationClient,
    assembler: ResponseAssembler,
    events: Option<EventWriter>,
}

impl<'a> GenerationOrchestrator<'a> {
    pub fn new(store: &'a dyn QuotaStore, client: &'a dyn GenerationClient) -> Self {
        Self {
            store,
            client,
            assembler: ResponseAssembler::default(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn run(&self, user_id: &str, batch: &[Descriptor]) -> Result<BatchResult, OrchestratorError> {
        self.run_with_cancel(user_id, batch, &CancellationToken::new())
    }

    pub fn run_with_cancel(
        &self,
        user_id: &str,
        batch: &[Descriptor],
        cancel: &CancellationToken,
    ) -> Result<BatchResult, OrchestratorError> {
        validate_batch(user_id, batch)?;

        let mut run = BatchRun::new(user_id, self.events.as_ref());
        let mut recorder = BatchRecorder::new(run.batch_id.clone(), batch.len());
        info!(
            batch_id = %run.batch_id,
            user_id,
            descriptors = batch.len(),
            client = self.client.name(),
            "batch started"
        );
        run.emit(
            BatchEventKind::BatchStarted,
            json!({
                "user_id": user_id,
                "descriptors": batch.len(),
                "client": self.client.name(),
            }),
        );

        run.transition(BatchPhase::QuotaChecking);
        let mut record = match self.store.load(user_id) {
            Ok(record) => record,
            Err(source) => return Err(run.abort_on_storage(recorder, batch, source)),
        };
        let allowed = record.can_generate_at(Utc::now());
        run.emit(BatchEventKind::QuotaChecked, quota_payload(&record, allowed));

        if !allowed {
            run.transition(BatchPhase::Blocked);
            let detail = quota_exceeded_detail(&record);
            mark_remaining(&mut recorder, batch, ErrorKind::QuotaExceeded, &detail);
            return Ok(run.finish(recorder, BatchStatus::QuotaExceeded));
        }

        run.transition(BatchPhase::Running);
        let mut status = BatchStatus::Completed;
        for (idx, descriptor) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    batch_id = %run.batch_id,
                    remaining = batch.len() - idx,
                    "batch cancelled between descriptors"
                );
                status = BatchStatus::Cancelled;
                mark_remaining(
                    &mut recorder,
                    &batch[idx..],
                    ErrorKind::Aborted,
                    "batch cancelled before this descriptor started",
                );
                break;
            }

            // An earlier success in this batch may have used the last free slot.
            if !record.can_generate_at(Utc::now()) {
                recorder.record(GenerationOutcome::failure(
                    descriptor.id.clone(),
                    ErrorKind::QuotaExceeded,
                    quota_exceeded_detail(&record),
                ));
                continue;
            }

            run.emit(
                BatchEventKind::DescriptorStarted,
                json!({ "descriptor_id": descriptor.id, "index": idx }),
            );
            let outcome = self.generate_one(descriptor);
            run.emit(BatchEventKind::DescriptorFinished, outcome_payload(&outcome));
            let succeeded = outcome.is_success();
            recorder.record(outcome);
            if !succeeded {
                continue;
            }

            record.record_generation_at(Utc::now());
            if let Err(source) = self.store.persist(&record) {
                return Err(run.abort_on_storage(recorder, &batch[idx + 1..], source));
            }
            run.emit(
                BatchEventKind::QuotaRecorded,
                json!({
                    "descriptor_id": descriptor.id,
                    "free_used": record.free_used,
                    "total_generations": record.total_generations,
                }),
            );
        }

        Ok(run.finish(recorder, status))
    }

    fn generate_one(&self, descriptor: &Descriptor) -> GenerationOutcome {
        debug!(descriptor_id = %descriptor.id, client = self.client.name(), "calling generation client");
        match self.client.call(descriptor) {
            Ok(stream) => self.assembler.reduce(&descriptor.id, stream),
            Err(err) => {
                warn!(descriptor_id = %descriptor.id, error = %err, "generation call failed");
                GenerationOutcome::failure(descriptor.id.clone(), err.kind(), err.to_string())
            }
        }
    }
}

struct BatchRun<'u> {
    batch_id: String,
    user_id: &'u str,
    events: Option<EventWriter>,
    phase: BatchPhase,
}

impl<'u> BatchRun<'u> {
    fn new(user_id: &'u str, events: Option<&EventWriter>) -> Self {
        let batch_id = format!("batch-{}", Uuid::new_v4().simple());
        Self {
            events: events.map(|writer| writer.for_batch(batch_id.clone())),
            batch_id,
            user_id,
            phase: BatchPhase::Idle,
        }
    }

    fn transition(&mut self, next: BatchPhase) {
        debug!(batch_id = %self.batch_id, from = ?self.phase, to = ?next, "batch phase");
        self.phase = next;
    }

    fn emit(&self, kind: BatchEventKind, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = events.emit(kind, payload) {
            warn!(batch_id = %self.batch_id, event = kind.as_str(), error = %err, "event journal write failed");
        }
    }

    fn finish(&mut self, recorder: BatchRecorder, status: BatchStatus) -> BatchResult {
        self.transition(BatchPhase::Completed);
        let result = recorder.finish(status);
        info!(
            batch_id = %self.batch_id,
            user_id = self.user_id,
            status = %status,
            succeeded = result.succeeded_count(),
            failed = result.failed_count(),
            "batch finished"
        );
        self.emit(
            BatchEventKind::BatchFinished,
            json!({
                "status": status.as_str(),
                "succeeded": result.succeeded_count(),
                "failed": result.failed_count(),
            }),
        );
        result
    }

    fn abort_on_storage(
        &mut self,
        mut recorder: BatchRecorder,
        remaining: &[Descriptor],
        source: QuotaStoreError,
    ) -> OrchestratorError {
        warn!(
            batch_id = %self.batch_id,
            user_id = self.user_id,
            error = %source,
            completed = recorder.recorded(),
            "quota storage unavailable; aborting batch"
        );
        let detail = format!("batch aborted: {source}");
        mark_remaining(&mut recorder, remaining, ErrorKind::Aborted, &detail);
        let partial = self.finish(recorder, BatchStatus::StorageUnavailable);
        OrchestratorError::StorageUnavailable {
            partial: Box::new(partial),
            source,
        }
    }
}

fn validate_batch(user_id: &str, batch: &[Descriptor]) -> Result<(), OrchestratorError> {
    if user_id.trim().is_empty() {
        return Err(OrchestratorError::InvalidUserId);
    }
    if batch.is_empty() {
        return Err(OrchestratorError::EmptyBatch);
    }
    let mut seen = HashSet::with_capacity(batch.len());
    for (idx, descriptor) in batch.iter().enumerate() {
        if descriptor.id.trim().is_empty() {
            return Err(OrchestratorError::EmptyDescriptorId(idx));
        }
        if !seen.insert(descriptor.id.as_str()) {
            return Err(OrchestratorError::DuplicateDescriptorId(descriptor.id.clone()));
        }
    }
    Ok(())
}

fn mark_remaining(
    recorder: &mut BatchRecorder,
    remaining: &[Descriptor],
    reason: ErrorKind,
    detail: &str,
) {
    for descriptor in remaining {
        recorder.record(GenerationOutcome::failure(
            descriptor.id.clone(),
            reason,
            detail,
        ));
    }
}

fn quota_exceeded_detail(record: &QuotaRecord) -> String {
    format!(
        "free quota used ({}/{}) and no active subscription",
        record.free_used, record.free_limit
    )
}

fn quota_payload(record: &QuotaRecord, allowed: bool) -> Value {
    json!({
        "allowed": allowed,
        "free_used": record.free_used,
        "free_limit": record.free_limit,
        "subscription_tier": record.subscription_tier.as_str(),
        "subscription_expiry": record.subscription_expiry.map(|expiry| expiry.to_rfc3339()),
    })
}

fn outcome_payload(outcome: &GenerationOutcome) -> Value {
    match outcome {
        GenerationOutcome::Success {
            descriptor_id,
            image_asset,
        } => json!({
            "descriptor_id": descriptor_id,
            "status": "succeeded",
            "mime_type": image_asset.mime_type,
            "bytes": image_asset.len(),
        }),
        GenerationOutcome::Failure {
            descriptor_id,
            reason,
            detail,
        } => json!({
            "descriptor_id": descriptor_id,
            "status": "failed",
            "reason": reason.as_str(),
            "detail": detail,
        }),
    }
}
