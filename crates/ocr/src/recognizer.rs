use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{RecognitionProgress, RecognitionResult, RecognizeOptions};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),
    #[error("Recognition cancelled")]
    Cancelled,
}

/// Progress sink and cancellation flag handed to a single recognizer call.
///
/// Percentages are forced to be non-decreasing, and nothing is emitted once the
/// call has been cancelled.
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<RecognitionProgress>>,
    cancel: CancellationToken,
    last_percent: AtomicU8,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<RecognitionProgress>, cancel: CancellationToken) -> Self {
        Self { tx: Some(tx), cancel, last_percent: AtomicU8::new(0) }
    }

    /// Reporter with no listener and a token nobody will cancel.
    pub fn silent() -> Self {
        Self { tx: None, cancel: CancellationToken::new(), last_percent: AtomicU8::new(0) }
    }

    pub fn initializing(&self) {
        self.emit(RecognitionProgress::Initializing);
    }

    pub fn recognizing(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last_percent.fetch_max(percent, Ordering::AcqRel);
        self.emit(RecognitionProgress::Recognizing { percent: percent.max(previous) });
    }

    /// Backends should poll this between expensive steps and bail out with
    /// [`OcrError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn emit(&self, event: RecognitionProgress) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Abstraction over an OCR backend.
///
/// Implementations receive PNG/JPEG bytes and block until recognition finishes;
/// callers run them on a blocking thread and enforce deadlines themselves.
pub trait OcrBackend: Send + Sync {
    fn recognize(
        &self,
        image_bytes: &[u8],
        options: &RecognizeOptions,
        progress: &ProgressReporter,
    ) -> Result<RecognitionResult, OcrError>;
}

// ── Mock backend (always available, used for tests) ───────────────────────────

enum MockBehavior {
    Text { text: String, confidence: f32 },
    Unavailable(String),
    Fail(String),
}

/// Returns a pre-set result and walks through the usual progress phases, so the
/// pipeline can be exercised without Tesseract installed.
pub struct MockRecognizer {
    behavior: MockBehavior,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { behavior: MockBehavior::Text { text: text.into(), confidence: 90.0 } }
    }

    pub fn with_confidence(text: impl Into<String>, confidence: f32) -> Self {
        Self { behavior: MockBehavior::Text { text: text.into(), confidence } }
    }

    /// Behaves like an engine whose model never loaded.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self { behavior: MockBehavior::Unavailable(reason.into()) }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self { behavior: MockBehavior::Fail(reason.into()) }
    }
}

impl OcrBackend for MockRecognizer {
    fn recognize(
        &self,
        _image_bytes: &[u8],
        _options: &RecognizeOptions,
        progress: &ProgressReporter,
    ) -> Result<RecognitionResult, OcrError> {
        progress.initializing();
        match &self.behavior {
            MockBehavior::Unavailable(reason) => Err(OcrError::Unavailable(reason.clone())),
            MockBehavior::Fail(reason) => {
                progress.recognizing(0);
                Err(OcrError::Engine(reason.clone()))
            }
            MockBehavior::Text { text, confidence } => {
                for percent in [0, 50, 100] {
                    if progress.is_cancelled() {
                        return Err(OcrError::Cancelled);
                    }
                    progress.recognizing(percent);
                }
                Ok(RecognitionResult::new(text.clone(), *confidence))
            }
        }
    }
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{OcrBackend, OcrError, ProgressReporter};
    use crate::types::{RecognitionResult, RecognizeOptions};
    use leptess::{LepTess, Variable};

    pub struct TesseractRecognizer {
        data_path: Option<String>,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>) -> Self {
            Self { data_path }
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn recognize(
            &self,
            image_bytes: &[u8],
            options: &RecognizeOptions,
            progress: &ProgressReporter,
        ) -> Result<RecognitionResult, OcrError> {
            progress.initializing();
            let mut lt = LepTess::new(self.data_path.as_deref(), &options.language)
                .map_err(|e| OcrError::Unavailable(e.to_string()))?;
            lt.set_variable(Variable::TesseditPagesegMode, options.segmentation.as_tesseract_value())
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            if let Some(whitelist) = &options.char_whitelist {
                lt.set_variable(Variable::TesseditCharWhitelist, whitelist)
                    .map_err(|e| OcrError::Engine(e.to_string()))?;
            }

            if progress.is_cancelled() {
                return Err(OcrError::Cancelled);
            }
            progress.recognizing(0);
            lt.set_image_from_mem(image_bytes)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            let text = lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))?;
            let confidence = lt.mean_text_conf().max(0) as f32;
            progress.recognizing(100);

            Ok(RecognitionResult::new(text, confidence))
        }
    }
}
