mod json_file;
mod record;
mod store;

pub use json_file::JsonFileQuotaStore;
pub use record::{QuotaRecord, SubscriptionTier, DEFAULT_FREE_LIMIT};
pub use store::{apply_billing_event, reset_usage, MemoryQuotaStore, QuotaStore, QuotaStoreError};
