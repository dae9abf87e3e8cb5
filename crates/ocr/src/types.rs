use billscan_core::Money;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Organization reported when no line of the receipt looks like a business name.
pub const UNKNOWN_BUSINESS: &str = "Unknown Business";

/// Alphanumerics plus the punctuation that shows up around amounts and names.
pub const DEFAULT_CHAR_WHITELIST: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz$.,:-& ";

/// The three fields pulled out of raw receipt text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedReceipt {
    pub organization: String,
    /// Grand total, `0 <= amount < 10000`. Zero means nothing usable was found.
    pub amount: Money,
    /// `0 < tip < 1000`, or zero when absent.
    pub tip: Money,
    /// How each field was decided. Empty for results produced outside the local extractor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl ExtractedReceipt {
    /// Nothing beyond defaults was recovered; the user has to fill the fields in.
    pub fn is_ambiguous(&self) -> bool {
        self.amount.is_zero() && self.organization == UNKNOWN_BUSINESS
    }
}

impl Default for ExtractedReceipt {
    fn default() -> Self {
        Self {
            organization: UNKNOWN_BUSINESS.to_string(),
            amount: Money::zero(),
            tip: Money::zero(),
            diagnostics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Organization,
    Amount,
    Tip,
}

/// Which matcher produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    HeaderLine,
    TextHeavyLine,
    TipKeyword,
    GrandTotal,
    TotalKeyword,
    CurrencySweep,
    AggressiveDecimal,
}

/// One decision the extractor made, kept for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub field: Field,
    pub tier: MatchTier,
    pub line: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    High,
}

/// A provisionally matched amount awaiting cascade resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountCandidate {
    pub value: Money,
    pub source_line: String,
    pub priority: Priority,
}

impl AmountCandidate {
    /// Ordering used to pick a winner: higher priority first, then larger value.
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.value.cmp(&self.value))
    }
}

/// Output of one successful recognizer call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub text: String,
    /// Engine-reported reliability, 0–100.
    pub confidence: f32,
}

impl RecognitionResult {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self { text: text.into(), confidence: confidence.clamp(0.0, 100.0) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RecognitionProgress {
    /// Engine or model warm-up; no meaningful percentage yet.
    Initializing,
    Recognizing { percent: u8 },
}

/// Tesseract page segmentation modes we expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSegMode {
    #[default]
    Auto,
    SingleColumn,
    SingleBlock,
    SparseText,
}

impl PageSegMode {
    pub fn as_tesseract_value(self) -> &'static str {
        match self {
            PageSegMode::Auto => "3",
            PageSegMode::SingleColumn => "4",
            PageSegMode::SingleBlock => "6",
            PageSegMode::SparseText => "11",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizeOptions {
    pub language: String,
    pub segmentation: PageSegMode,
    pub char_whitelist: Option<String>,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            segmentation: PageSegMode::Auto,
            char_whitelist: Some(DEFAULT_CHAR_WHITELIST.to_string()),
        }
    }
}
