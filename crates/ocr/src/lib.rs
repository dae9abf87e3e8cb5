pub mod extract;
pub mod intake;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod types;
pub mod vision;

pub use extract::Extractor;
pub use intake::{validate_source, IntakeError};
pub use pipeline::{
    spawn_intake_watcher, PipelineEvent, PipelineOptions, ReceiptPipeline, ScanError, ScanOutcome,
    ScanReport, ScanState,
};
pub use preprocess::{ImageNormalizer, NormalizeError};
pub use recognizer::{MockRecognizer, OcrBackend, OcrError, ProgressReporter};
#[cfg(feature = "tesseract")]
pub use recognizer::tesseract_backend::TesseractRecognizer;
pub use types::{
    ExtractedReceipt, RecognitionProgress, RecognitionResult, RecognizeOptions, UNKNOWN_BUSINESS,
};
pub use vision::{OpenAiVisionExtractor, VisionError, VisionExtractor};
