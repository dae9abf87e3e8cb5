pub mod bill;
pub mod config;
pub mod money;
pub mod store;

pub use bill::{BillId, BillRecord, ImageRef, ManualEntry, ManualEntryError, ScannedFields, OCR_FAILED_ORGANIZATION};
pub use config::ScanConfig;
pub use money::Money;
pub use store::{InMemoryStore, RecordStore, StoreError};
