use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use super::bill::{BillId, BillRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Bill {0} already exists")]
    Duplicate(BillId),
    #[error("Record store failure: {0}")]
    Backend(String),
}

/// Append-only sink for accepted bills.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, record: BillRecord) -> Result<BillId, StoreError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<BillRecord>, StoreError>;
}

/// Process-local store, used by tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<Vec<BillRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn append(&self, record: BillRecord) -> Result<BillId, StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        let id = record.id;
        records.push(record);
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<BillRecord>, StoreError> {
        let mut out = self.records.lock().await.clone();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }
}
