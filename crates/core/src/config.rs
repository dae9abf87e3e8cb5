use serde::{Deserialize, Serialize};

/// The only switches the scanning core reads at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Run the on-device OCR path. When false, scans go to the remote vision extractor.
    pub use_local_ocr: bool,
    /// Hand the decoded image to the recognizer without rescaling/enhancing it.
    pub skip_normalization: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { use_local_ocr: true, skip_normalization: false }
    }
}
