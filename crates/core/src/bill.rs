use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

use super::money::Money;

/// Organization used for the stub record offered after a failed scan.
pub const OCR_FAILED_ORGANIZATION: &str = "Unknown (OCR Failed)";

/// Creation-time ordered identifier (milliseconds since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BillId(pub i64);

static LAST_BILL_ID: AtomicI64 = AtomicI64::new(0);

impl BillId {
    /// Next id for this process. Strictly increasing even when two records are
    /// created within the same millisecond.
    pub fn next() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut last = LAST_BILL_ID.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match LAST_BILL_ID.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return BillId(candidate),
                Err(seen) => last = seen,
            }
        }
    }
}

impl fmt::Display for BillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content reference to the scanned image: SHA-256 of the source bytes plus mime type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub sha256: String,
    pub mime_type: String,
}

impl ImageRef {
    pub fn from_bytes(data: &[u8], mime_type: impl Into<String>) -> Self {
        let digest: [u8; 32] = Sha256::digest(data).into();
        Self {
            sha256: digest.iter().map(|b| format!("{b:02x}")).collect(),
            mime_type: mime_type.into(),
        }
    }
}

/// Fields recovered by a successful scan, ready to become a [`BillRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFields {
    pub organization: String,
    pub amount: Money,
    pub tip: Money,
    pub raw_text: Option<String>,
    /// Engine confidence, 0–100. `None` when the fields came from the remote collaborator.
    pub confidence: Option<f32>,
}

/// What a user typed into the manual-entry form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualEntry {
    pub organization: String,
    pub amount: String,
    pub tip: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManualEntryError {
    #[error("Organization name is required")]
    MissingOrganization,
    #[error("Amount is required")]
    MissingAmount,
}

/// An accepted expense. Created once and never mutated by the scanning core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillRecord {
    pub id: BillId,
    pub date: DateTime<Utc>,
    pub image: Option<ImageRef>,
    pub organization: String,
    pub amount: Money,
    pub tip: Money,
    pub raw_text: Option<String>,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub is_manual: bool,
    #[serde(default)]
    pub is_ocr_failed: bool,
}

impl BillRecord {
    pub fn scanned(fields: ScannedFields, image: Option<ImageRef>) -> Self {
        BillRecord {
            id: BillId::next(),
            date: Utc::now(),
            image,
            organization: fields.organization,
            amount: fields.amount,
            tip: fields.tip,
            raw_text: fields.raw_text,
            confidence: fields.confidence.map(|c| c.clamp(0.0, 100.0)),
            is_manual: false,
            is_ocr_failed: false,
        }
    }

    /// Stub offered when a scan failed after the image was captured.
    pub fn ocr_failed(image: ImageRef) -> Self {
        BillRecord {
            id: BillId::next(),
            date: Utc::now(),
            image: Some(image),
            organization: OCR_FAILED_ORGANIZATION.to_string(),
            amount: Money::zero(),
            tip: Money::zero(),
            raw_text: None,
            confidence: None,
            is_manual: false,
            is_ocr_failed: true,
        }
    }

    /// Organization and amount must be filled in; numbers that do not parse become zero.
    pub fn manual(entry: &ManualEntry) -> Result<Self, ManualEntryError> {
        let organization = entry.organization.trim();
        if organization.is_empty() {
            return Err(ManualEntryError::MissingOrganization);
        }
        if entry.amount.trim().is_empty() {
            return Err(ManualEntryError::MissingAmount);
        }
        Ok(BillRecord {
            id: BillId::next(),
            date: Utc::now(),
            image: None,
            organization: organization.to_string(),
            amount: Money::parse_loose(&entry.amount).unwrap_or_default(),
            tip: Money::parse_loose(&entry.tip).unwrap_or_default(),
            raw_text: None,
            confidence: None,
            is_manual: true,
            is_ocr_failed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bill_ids_are_strictly_increasing() {
        let ids: Vec<BillId> = (0..1000).map(|_| BillId::next()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn bill_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..250).map(|_| BillId::next()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<BillId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let len = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len);
    }

    #[test]
    fn image_ref_is_sha256_hex() {
        let r = ImageRef::from_bytes(b"", "image/png");
        assert_eq!(
            r.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(r.mime_type, "image/png");
    }

    #[test]
    fn ocr_failed_stub_shape() {
        let bill = BillRecord::ocr_failed(ImageRef::from_bytes(b"img", "image/jpeg"));
        assert!(bill.is_ocr_failed);
        assert!(!bill.is_manual);
        assert_eq!(bill.organization, OCR_FAILED_ORGANIZATION);
        assert!(bill.amount.is_zero() && bill.tip.is_zero());
        assert!(bill.image.is_some());
    }

    #[test]
    fn manual_entry_requires_organization_and_amount() {
        let mut entry = ManualEntry { organization: "  ".into(), amount: "5".into(), tip: String::new() };
        assert_eq!(BillRecord::manual(&entry), Err(ManualEntryError::MissingOrganization));

        entry.organization = "Corner Deli".into();
        entry.amount = String::new();
        assert_eq!(BillRecord::manual(&entry), Err(ManualEntryError::MissingAmount));
    }

    #[test]
    fn manual_entry_unparsable_numbers_become_zero() {
        let entry = ManualEntry {
            organization: "Corner Deli".into(),
            amount: "twelve".into(),
            tip: "1.5".into(),
        };
        let bill = BillRecord::manual(&entry).unwrap();
        assert!(bill.is_manual);
        assert!(bill.amount.is_zero());
        assert_eq!(bill.tip, Money::from_cents(150));
        assert!(bill.image.is_none());
    }

    #[test]
    fn scanned_clamps_confidence() {
        let bill = BillRecord::scanned(
            ScannedFields {
                organization: "STARBUCKS".into(),
                amount: Money::from_cents(550),
                tip: Money::zero(),
                raw_text: Some("STARBUCKS\nTotal 5.50".into()),
                confidence: Some(140.0),
            },
            None,
        );
        assert_eq!(bill.confidence, Some(100.0));
        assert!(!bill.is_ocr_failed);
    }
}
