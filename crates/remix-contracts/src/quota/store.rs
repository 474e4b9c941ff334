use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::record::{QuotaRecord, SubscriptionTier};

/// Errors surfaced by quota storage adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaStoreError {
    /// The backing store could not be read or written.
    #[error("quota storage unavailable: {message}")]
    Unavailable { message: String },
    /// A stored record exists but cannot be decoded.
    #[error("quota record for '{user_id}' is corrupt: {message}")]
    Corrupt { user_id: String, message: String },
    /// Subscription upgrades need a positive duration.
    #[error("subscription for '{user_id}' needs a duration of at least one day")]
    InvalidDuration { user_id: String },
}

impl QuotaStoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Scoped access to per-user quota records.
///
/// Implementations must give read-your-writes consistency for a single
/// user. A `load` miss synthesizes a fresh record and does not write it.
pub trait QuotaStore: Send + Sync {
    fn load(&self, user_id: &str) -> Result<QuotaRecord, QuotaStoreError>;
    fn persist(&self, record: &QuotaRecord) -> Result<(), QuotaStoreError>;
}

impl<S: QuotaStore + ?Sized> QuotaStore for Box<S> {
    fn load(&self, user_id: &str) -> Result<QuotaRecord, QuotaStoreError> {
        (**self).load(user_id)
    }

    fn persist(&self, record: &QuotaRecord) -> Result<(), QuotaStoreError> {
        (**self).persist(record)
    }
}

impl<S: QuotaStore + ?Sized> QuotaStore for std::sync::Arc<S> {
    fn load(&self, user_id: &str) -> Result<QuotaRecord, QuotaStoreError> {
        (**self).load(user_id)
    }

    fn persist(&self, record: &QuotaRecord) -> Result<(), QuotaStoreError> {
        (**self).persist(record)
    }
}

/// Entry point for billing webhooks; runs outside any batch.
pub fn apply_billing_event(
    store: &dyn QuotaStore,
    user_id: &str,
    tier: SubscriptionTier,
    duration_days: u32,
    now: DateTime<Utc>,
) -> Result<QuotaRecord, QuotaStoreError> {
    let mut record = store.load(user_id)?;
    record.upgrade_subscription_at(tier, duration_days, now)?;
    store.persist(&record)?;
    tracing::info!(
        user_id,
        tier = %tier,
        duration_days,
        "subscription updated from billing event"
    );
    Ok(record)
}

pub fn reset_usage(store: &dyn QuotaStore, user_id: &str) -> Result<QuotaRecord, QuotaStoreError> {
    let mut record = store.load(user_id)?;
    record.reset_usage();
    store.persist(&record)?;
    Ok(record)
}

/// In-process store. Failure switches let callers exercise outage paths.
#[derive(Debug)]
pub struct MemoryQuotaStore {
    free_limit: u32,
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: HashMap<String, QuotaRecord>,
    unavailable: bool,
    persist_budget: Option<usize>,
    persist_calls: usize,
}

impl MemoryQuotaStore {
    pub fn new(free_limit: u32) -> Self {
        Self {
            free_limit,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub fn with_record(self, record: QuotaRecord) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.records.insert(record.user_id.clone(), record);
        }
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Lets the next `successful` persists through, then fails every later one.
    pub fn fail_persists_after(&self, successful: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.persist_budget = Some(successful);
        }
    }

    pub fn persist_calls(&self) -> usize {
        self.inner.lock().map(|inner| inner.persist_calls).unwrap_or(0)
    }

    pub fn snapshot(&self, user_id: &str) -> Option<QuotaRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.records.get(user_id).cloned())
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn load(&self, user_id: &str) -> Result<QuotaRecord, QuotaStoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| QuotaStoreError::unavailable("memory store lock poisoned"))?;
        if inner.unavailable {
            return Err(QuotaStoreError::unavailable("memory store offline"));
        }
        Ok(inner
            .records
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| QuotaRecord::fresh(user_id, self.free_limit)))
    }

    fn persist(&self, record: &QuotaRecord) -> Result<(), QuotaStoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| QuotaStoreError::unavailable("memory store lock poisoned"))?;
        inner.persist_calls += 1;
        if inner.unavailable {
            return Err(QuotaStoreError::unavailable("memory store offline"));
        }
        if let Some(budget) = inner.persist_budget {
            if budget == 0 {
                return Err(QuotaStoreError::unavailable("memory store rejected write"));
            }
            inner.persist_budget = Some(budget - 1);
        }
        inner
            .records
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }
}
