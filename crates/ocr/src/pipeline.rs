use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use billscan_core::{BillRecord, ImageRef, ScanConfig, ScannedFields};
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::extract::Extractor;
use crate::intake;
use crate::preprocess::{self, ImageNormalizer};
use crate::recognizer::{OcrBackend, OcrError, ProgressReporter};
use crate::types::{ExtractedReceipt, RecognitionProgress, RecognitionResult, RecognizeOptions};
use crate::vision::{VisionError, VisionExtractor};

/// Phases of a single scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    ReadingFile,
    Normalizing,
    Recognizing,
    Extracting,
    Done,
    TimedOut,
    FailedOfferManualFallback,
}

/// Everything a listener (UI, CLI progress line) gets told while a scan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    State { state: ScanState },
    Progress { progress: RecognitionProgress },
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Could not read image: {0}")]
    FileRead(String),
    #[error("OCR engine is not available ({0}). Reload the engine or switch to remote extraction.")]
    EngineUnavailable(String),
    #[error("Image processing timed out after {0:?}. Try a smaller image or a different format.")]
    OcrTimeout(Duration),
    #[error("OCR recognition failed: {0}")]
    Engine(String),
    #[error("Remote extraction failed: {0}")]
    RemoteExtraction(#[from] VisionError),
    #[error("A scan is already in progress")]
    Busy,
}

/// The result of a completed scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub extracted: ExtractedReceipt,
    /// Raw OCR text; `None` when the remote extractor was used.
    pub raw_text: Option<String>,
    pub confidence: Option<f32>,
    pub image: ImageRef,
    /// Whether the recognizer saw a normalized copy rather than the original.
    pub normalized: bool,
}

impl ScanReport {
    pub fn into_bill(self) -> BillRecord {
        BillRecord::scanned(
            ScannedFields {
                organization: self.extracted.organization,
                amount: self.extracted.amount,
                tip: self.extracted.tip,
                raw_text: self.raw_text,
                confidence: self.confidence,
            },
            Some(self.image),
        )
    }
}

#[derive(Debug)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// The scan failed. `offer` is a stub record the caller may accept and edit by
    /// hand; it is only present when the image itself was read successfully.
    FailedOfferManualFallback { error: ScanError, offer: Option<BillRecord> },
}

impl ScanOutcome {
    pub fn error(&self) -> Option<&ScanError> {
        match self {
            ScanOutcome::Completed(_) => None,
            ScanOutcome::FailedOfferManualFallback { error, .. } => Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Budget for the whole scan, measured from the moment it starts.
    pub global_deadline: Duration,
    pub normalizer: ImageNormalizer,
    pub recognize: RecognizeOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            global_deadline: Duration::from_secs(60),
            normalizer: ImageNormalizer::default(),
            recognize: RecognizeOptions::default(),
        }
    }
}

enum Source<'a> {
    Path(&'a Path),
    Bytes(Vec<u8>),
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Events<'a>(Option<&'a mpsc::UnboundedSender<PipelineEvent>>);

impl Events<'_> {
    fn state(&self, state: ScanState) {
        self.send(PipelineEvent::State { state });
    }

    fn progress(&self, progress: RecognitionProgress) {
        self.send(PipelineEvent::Progress { progress });
    }

    fn send(&self, event: PipelineEvent) {
        if let Some(tx) = self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Orchestrates: read → decode → normalize → recognize → extract, under one deadline.
///
/// At most one scan runs at a time; a concurrent call fails with [`ScanError::Busy`].
pub struct ReceiptPipeline<R: OcrBackend + 'static> {
    recognizer: Arc<R>,
    vision: Option<Arc<dyn VisionExtractor>>,
    config: ScanConfig,
    options: PipelineOptions,
    in_flight: AtomicBool,
    next_scan_id: AtomicU64,
    orphans: Mutex<Vec<JoinHandle<()>>>,
    discarded_late: Arc<AtomicU64>,
}

impl<R: OcrBackend + 'static> ReceiptPipeline<R> {
    pub fn new(recognizer: R, config: ScanConfig) -> Self {
        Self {
            recognizer: Arc::new(recognizer),
            vision: None,
            config,
            options: PipelineOptions::default(),
            in_flight: AtomicBool::new(false),
            next_scan_id: AtomicU64::new(1),
            orphans: Mutex::new(Vec::new()),
            discarded_late: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionExtractor>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Recognition results that arrived after their scan had already timed out.
    pub fn discarded_late_results(&self) -> u64 {
        self.discarded_late.load(Ordering::Acquire)
    }

    /// Wait for every abandoned recognition call to finish. Returns how many there were.
    pub async fn reap_orphans(&self) -> usize {
        let handles: Vec<_> = std::mem::take(&mut *self.orphans.lock().await);
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        count
    }

    /// Scan a file on disk.
    pub async fn scan_file(
        &self,
        path: &Path,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> ScanOutcome {
        self.scan(Source::Path(path), Events(events)).await
    }

    /// Scan raw bytes (camera capture or an already-read file).
    pub async fn scan_bytes(
        &self,
        data: Vec<u8>,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> ScanOutcome {
        self.scan(Source::Bytes(data), Events(events)).await
    }

    async fn scan(&self, source: Source<'_>, events: Events<'_>) -> ScanOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            warn!("Rejecting scan request: another scan is in progress");
            return ScanOutcome::FailedOfferManualFallback { error: ScanError::Busy, offer: None };
        };
        self.orphans.lock().await.retain(|h| !h.is_finished());

        let scan_id = self.next_scan_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.options.global_deadline;
        info!(scan_id, "Starting receipt scan");

        // ── ReadingFile ──────────────────────────────────────────────────────
        events.state(ScanState::ReadingFile);
        let (bytes, decoded) = match self.read_source(source, deadline).await {
            Ok(read) => read,
            Err(error) => return self.fail(scan_id, &events, error, None),
        };
        let image_ref = ImageRef::from_bytes(&bytes, intake::mime_type(&bytes));

        let result = if self.config.use_local_ocr {
            self.run_local(scan_id, &events, bytes, decoded, image_ref.clone(), deadline).await
        } else {
            self.run_remote(&events, bytes, image_ref.clone(), deadline).await
        };

        match result {
            Ok(report) => {
                info!(
                    scan_id,
                    organization = %report.extracted.organization,
                    amount = %report.extracted.amount,
                    tip = %report.extracted.tip,
                    "Receipt scan complete"
                );
                events.state(ScanState::Done);
                ScanOutcome::Completed(report)
            }
            Err(error) => self.fail(scan_id, &events, error, Some(image_ref)),
        }
    }

    async fn read_source(
        &self,
        source: Source<'_>,
        deadline: Instant,
    ) -> Result<(Vec<u8>, Arc<DynamicImage>), ScanError> {
        let read = async {
            let bytes = match source {
                Source::Path(path) => tokio::fs::read(path)
                    .await
                    .map_err(|e| ScanError::FileRead(format!("{}: {e}", path.display())))?,
                Source::Bytes(bytes) => bytes,
            };
            let (bytes, decoded) = tokio::task::spawn_blocking(move || {
                let decoded = intake::decode(&bytes);
                (bytes, decoded)
            })
            .await
            .map_err(|e| ScanError::FileRead(e.to_string()))?;
            let decoded = decoded.map_err(|e| ScanError::FileRead(e.to_string()))?;
            Ok::<_, ScanError>((bytes, Arc::new(decoded)))
        };

        tokio::time::timeout_at(deadline, read)
            .await
            .map_err(|_| ScanError::OcrTimeout(self.options.global_deadline))?
    }

    async fn run_local(
        &self,
        scan_id: u64,
        events: &Events<'_>,
        bytes: Vec<u8>,
        decoded: Arc<DynamicImage>,
        image: ImageRef,
        deadline: Instant,
    ) -> Result<ScanReport, ScanError> {
        // ── Normalizing ──────────────────────────────────────────────────────
        let normalized = if self.config.skip_normalization {
            Arc::clone(&decoded)
        } else {
            events.state(ScanState::Normalizing);
            tokio::time::timeout_at(deadline, self.options.normalizer.normalize(Arc::clone(&decoded)))
                .await
                .map_err(|_| ScanError::OcrTimeout(self.options.global_deadline))?
        };

        let was_normalized = !Arc::ptr_eq(&normalized, &decoded);
        let engine_input = if was_normalized {
            let encoded = tokio::task::spawn_blocking(move || preprocess::encode_as_png(&normalized)).await;
            match encoded {
                Ok(Ok(png)) => png,
                Ok(Err(e)) => {
                    warn!(scan_id, "Normalized image could not be encoded, using original: {e}");
                    bytes
                }
                Err(e) => {
                    warn!(scan_id, "Normalized image could not be encoded, using original: {e}");
                    bytes
                }
            }
        } else {
            bytes
        };

        // ── Recognizing ──────────────────────────────────────────────────────
        events.state(ScanState::Recognizing);
        let recognized = self.recognize(scan_id, events, engine_input, deadline).await?;
        info!(scan_id, confidence = recognized.confidence, chars = recognized.text.len(), "OCR finished");

        // ── Extracting ───────────────────────────────────────────────────────
        events.state(ScanState::Extracting);
        let extracted = Extractor::extract(&recognized.text);

        Ok(ScanReport {
            extracted,
            raw_text: Some(recognized.text),
            confidence: Some(recognized.confidence),
            image,
            normalized: was_normalized,
        })
    }

    async fn run_remote(
        &self,
        events: &Events<'_>,
        bytes: Vec<u8>,
        image: ImageRef,
        deadline: Instant,
    ) -> Result<ScanReport, ScanError> {
        events.state(ScanState::Extracting);
        let vision = self.vision.as_ref().ok_or(VisionError::NotConfigured)?;
        let extracted = tokio::time::timeout_at(deadline, vision.extract(&bytes, &image.mime_type))
            .await
            .map_err(|_| ScanError::OcrTimeout(self.options.global_deadline))??;

        Ok(ScanReport { extracted, raw_text: None, confidence: None, image, normalized: false })
    }

    /// Run the recognizer on the blocking pool and race it against `deadline`.
    ///
    /// On timeout the call is cancelled and parked in `orphans`; whatever it
    /// eventually produces is counted in `discarded_late` and dropped.
    async fn recognize(
        &self,
        scan_id: u64,
        events: &Events<'_>,
        image: Vec<u8>,
        deadline: Instant,
    ) -> Result<RecognitionResult, ScanError> {
        let token = CancellationToken::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = oneshot::channel();
        let reporter = ProgressReporter::new(progress_tx, token.clone());

        let handle = {
            let recognizer = Arc::clone(&self.recognizer);
            let options = self.options.recognize.clone();
            let discarded = Arc::clone(&self.discarded_late);
            tokio::task::spawn_blocking(move || {
                let result = recognizer.recognize(&image, &options, &reporter);
                if reporter.is_cancelled() || result_tx.send(result).is_err() {
                    discarded.fetch_add(1, Ordering::AcqRel);
                    warn!(scan_id, "Discarding recognition result delivered after the scan timed out");
                }
            })
        };

        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);

        let finished = loop {
            tokio::select! {
                biased;
                Some(progress) = progress_rx.recv() => events.progress(progress),
                result = &mut result_rx => {
                    while let Ok(progress) = progress_rx.try_recv() {
                        events.progress(progress);
                    }
                    break Some(result);
                }
                _ = &mut timer => break None,
            }
        };

        match finished {
            None => {
                token.cancel();
                result_rx.close();
                if result_rx.try_recv().is_ok() {
                    self.discarded_late.fetch_add(1, Ordering::AcqRel);
                    warn!(scan_id, "Discarding recognition result that raced the deadline");
                }
                self.orphans.lock().await.push(handle);
                Err(ScanError::OcrTimeout(self.options.global_deadline))
            }
            Some(Ok(Ok(result))) => Ok(result),
            Some(Ok(Err(OcrError::Unavailable(reason)))) => Err(ScanError::EngineUnavailable(reason)),
            Some(Ok(Err(e))) => Err(ScanError::Engine(e.to_string())),
            Some(Err(_)) => Err(ScanError::Engine("recognizer stopped without a result".into())),
        }
    }

    fn fail(
        &self,
        scan_id: u64,
        events: &Events<'_>,
        error: ScanError,
        image: Option<ImageRef>,
    ) -> ScanOutcome {
        if matches!(error, ScanError::OcrTimeout(_)) {
            events.state(ScanState::TimedOut);
        }
        warn!(scan_id, "Receipt scan failed: {error}");
        events.state(ScanState::FailedOfferManualFallback);
        ScanOutcome::FailedOfferManualFallback { error, offer: image.map(BillRecord::ocr_failed) }
    }
}

// ── Watch-folder integration ──────────────────────────────────────────────────

/// Extensions picked up from the intake folder. Content is sniffed again before scanning.
const INTAKE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"];

pub fn is_intake_candidate(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INTAKE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Spawn a notify watcher on `watch_dir` that sends newly created image paths to `tx`.
/// The returned watcher must be kept alive for watching to continue.
pub fn spawn_intake_watcher(
    watch_dir: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> notify::Result<impl notify::Watcher> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(ev) = event {
            if matches!(ev.kind, EventKind::Create(_)) {
                for path in ev.paths.into_iter().filter(|p| is_intake_candidate(p)) {
                    if tx.try_send(path).is_err() {
                        warn!("Intake queue full, dropping new file event");
                    }
                }
            }
        }
    })?;

    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::MockRecognizer;
    use crate::types::UNKNOWN_BUSINESS;
    use async_trait::async_trait;
    use billscan_core::{Money, OCR_FAILED_ORGANIZATION};
    use image::{GrayImage, ImageBuffer, Luma};
    use std::io::Cursor;
    use std::sync::mpsc as std_mpsc;

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(4, 4, |_, _| Luma([200u8]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn states(events: &[PipelineEvent]) -> Vec<ScanState> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::State { state } => Some(*state),
                PipelineEvent::Progress { .. } => None,
            })
            .collect()
    }

    /// Blocks inside `recognize` until the test sends on the gate.
    struct GatedRecognizer {
        gate: std::sync::Mutex<std_mpsc::Receiver<()>>,
        text: String,
    }

    impl GatedRecognizer {
        fn new(text: &str) -> (Self, std_mpsc::Sender<()>) {
            let (tx, rx) = std_mpsc::channel();
            (Self { gate: std::sync::Mutex::new(rx), text: text.into() }, tx)
        }
    }

    impl OcrBackend for GatedRecognizer {
        fn recognize(
            &self,
            _image_bytes: &[u8],
            _options: &RecognizeOptions,
            progress: &ProgressReporter,
        ) -> Result<RecognitionResult, OcrError> {
            progress.initializing();
            let _ = self.gate.lock().unwrap().recv();
            progress.recognizing(100);
            Ok(RecognitionResult::new(self.text.clone(), 80.0))
        }
    }

    struct FixedVision;

    #[async_trait]
    impl VisionExtractor for FixedVision {
        async fn extract(&self, _image: &[u8], mime_type: &str) -> Result<ExtractedReceipt, VisionError> {
            assert_eq!(mime_type, "image/png");
            Ok(ExtractedReceipt {
                organization: "Hosted Diner".into(),
                amount: Money::from_cents(3300),
                tip: Money::from_cents(500),
                diagnostics: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn completed_scan_walks_every_state() {
        let pipeline = ReceiptPipeline::new(
            MockRecognizer::new("SRI KRISHNA CAFE\nItem A 10.00\nGrand Total: 70"),
            ScanConfig::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = match pipeline.scan_bytes(tiny_png(), Some(&tx)).await {
            ScanOutcome::Completed(report) => report,
            other => panic!("expected completed scan, got {other:?}"),
        };
        assert_eq!(report.extracted.organization, "SRI KRISHNA");
        assert_eq!(report.extracted.amount, Money::from_cents(7000));
        assert_eq!(report.confidence, Some(90.0));
        assert!(report.normalized);
        assert_eq!(report.image.mime_type, "image/png");

        let events = collect(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ScanState::ReadingFile,
                ScanState::Normalizing,
                ScanState::Recognizing,
                ScanState::Extracting,
                ScanState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn progress_is_ordered_and_precedes_extracting() {
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("SHOP\nTotal 5.00"), ScanConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        pipeline.scan_bytes(tiny_png(), Some(&tx)).await;
        let events = collect(&mut rx);

        let extracting = events
            .iter()
            .position(|e| *e == PipelineEvent::State { state: ScanState::Extracting })
            .unwrap();
        let progress: Vec<_> = events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                PipelineEvent::Progress { progress } => Some((i, *progress)),
                PipelineEvent::State { .. } => None,
            })
            .collect();

        assert_eq!(progress.first().map(|p| p.1), Some(RecognitionProgress::Initializing));
        assert!(progress.iter().all(|(i, _)| *i < extracting));
        let percents: Vec<u8> = progress
            .iter()
            .filter_map(|(_, p)| match p {
                RecognitionProgress::Recognizing { percent } => Some(*percent),
                RecognitionProgress::Initializing => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 50, 100]);
    }

    #[tokio::test]
    async fn skip_normalization_feeds_original_image() {
        let config = ScanConfig { skip_normalization: true, ..ScanConfig::default() };
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("SHOP\nTotal 5.00"), config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ScanOutcome::Completed(report) = pipeline.scan_bytes(tiny_png(), Some(&tx)).await else {
            panic!("expected completed scan");
        };
        assert!(!report.normalized);
        assert!(!states(&collect(&mut rx)).contains(&ScanState::Normalizing));
    }

    #[tokio::test]
    async fn missing_file_is_file_read_error_without_offer() {
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("x"), ScanConfig::default());
        let outcome = pipeline
            .scan_file(Path::new("/definitely/not/here.png"), None)
            .await;
        match outcome {
            ScanOutcome::FailedOfferManualFallback { error: ScanError::FileRead(_), offer } => {
                assert!(offer.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!pipeline.is_processing());
    }

    #[tokio::test]
    async fn undecodable_bytes_are_file_read_error() {
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("x"), ScanConfig::default());
        let outcome = pipeline.scan_bytes(b"definitely not an image".to_vec(), None).await;
        assert!(matches!(
            outcome,
            ScanOutcome::FailedOfferManualFallback { error: ScanError::FileRead(_), offer: None }
        ));
    }

    #[tokio::test]
    async fn scan_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, tiny_png()).unwrap();

        let pipeline = ReceiptPipeline::new(MockRecognizer::new("BLUE BOTTLE\nTotal $6.25"), ScanConfig::default());
        let ScanOutcome::Completed(report) = pipeline.scan_file(&path, None).await else {
            panic!("expected completed scan");
        };
        let bill = report.into_bill();
        assert_eq!(bill.organization, "BLUE BOTTLE");
        assert_eq!(bill.amount, Money::from_cents(625));
        assert_eq!(bill.raw_text.as_deref(), Some("BLUE BOTTLE\nTotal $6.25"));
        assert!(bill.image.is_some());
        assert!(!bill.is_ocr_failed);
    }

    #[tokio::test]
    async fn unavailable_engine_offers_stub_record() {
        let pipeline = ReceiptPipeline::new(MockRecognizer::unavailable("worker not loaded"), ScanConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = pipeline.scan_bytes(tiny_png(), Some(&tx)).await;
        let ScanOutcome::FailedOfferManualFallback { error, offer } = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(error, ScanError::EngineUnavailable(_)));
        assert!(error.to_string().contains("switch to remote extraction"));
        let offer = offer.expect("image was read, so a stub is offered");
        assert!(offer.is_ocr_failed);
        assert_eq!(offer.organization, OCR_FAILED_ORGANIZATION);
        assert!(offer.amount.is_zero() && offer.tip.is_zero());

        assert_eq!(states(&collect(&mut rx)).last(), Some(&ScanState::FailedOfferManualFallback));
    }

    #[tokio::test]
    async fn engine_failure_offers_stub_record() {
        let pipeline = ReceiptPipeline::new(MockRecognizer::failing("segfault in model"), ScanConfig::default());
        let outcome = pipeline.scan_bytes(tiny_png(), None).await;
        assert!(matches!(
            outcome,
            ScanOutcome::FailedOfferManualFallback { error: ScanError::Engine(_), offer: Some(_) }
        ));
    }

    #[tokio::test]
    async fn unreadable_text_still_completes_with_defaults() {
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("~~ ~~"), ScanConfig::default());
        let ScanOutcome::Completed(report) = pipeline.scan_bytes(tiny_png(), None).await else {
            panic!("extraction never fails");
        };
        assert_eq!(report.extracted.organization, UNKNOWN_BUSINESS);
        assert!(report.extracted.is_ambiguous());
    }

    #[tokio::test]
    async fn timeout_abandons_recognition_and_discards_late_result() {
        let (recognizer, gate) = GatedRecognizer::new("LATE SHOP\nTotal 9.99");
        let pipeline = ReceiptPipeline::new(recognizer, ScanConfig::default()).with_options(PipelineOptions {
            global_deadline: Duration::from_millis(200),
            ..PipelineOptions::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = pipeline.scan_bytes(tiny_png(), Some(&tx)).await;
        let ScanOutcome::FailedOfferManualFallback { error, offer } = outcome else {
            panic!("expected timeout");
        };
        assert!(matches!(error, ScanError::OcrTimeout(_)));
        assert!(offer.unwrap().is_ocr_failed);
        assert!(!pipeline.is_processing());

        let seen = states(&collect(&mut rx));
        assert_eq!(
            &seen[seen.len() - 2..],
            &[ScanState::TimedOut, ScanState::FailedOfferManualFallback]
        );

        // Let the abandoned call finish; its result must be thrown away.
        gate.send(()).unwrap();
        assert_eq!(pipeline.reap_orphans().await, 1);
        assert_eq!(pipeline.discarded_late_results(), 1);
        // Nothing from the orphan leaks into the event stream.
        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn global_deadline_can_expire_while_normalizing() {
        let img: GrayImage = ImageBuffer::from_fn(100, 100, |x, _| Luma([(x * 2) as u8]));
        let mut png = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        // A 40x upscale to 4000x4000 takes far longer than the 100ms budget.
        let normalizer = ImageNormalizer {
            scale: 40.0,
            deadline: Duration::from_secs(120),
            ..ImageNormalizer::default()
        };
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("SHOP\nTotal 1.00"), ScanConfig::default())
            .with_options(PipelineOptions {
                global_deadline: Duration::from_millis(100),
                normalizer,
                ..PipelineOptions::default()
            });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = pipeline.scan_bytes(png, Some(&tx)).await;
        let ScanOutcome::FailedOfferManualFallback { error, offer } = outcome else {
            panic!("expected timeout");
        };
        assert!(matches!(error, ScanError::OcrTimeout(_)));
        assert!(offer.unwrap().is_ocr_failed);
        assert_eq!(
            states(&collect(&mut rx)),
            vec![
                ScanState::ReadingFile,
                ScanState::Normalizing,
                ScanState::TimedOut,
                ScanState::FailedOfferManualFallback,
            ]
        );
        // Recognition never started, so nothing was orphaned.
        assert_eq!(pipeline.reap_orphans().await, 0);
    }

    #[tokio::test]
    async fn concurrent_scan_is_rejected() {
        let (recognizer, gate) = GatedRecognizer::new("SHOP\nTotal 1.00");
        let pipeline = Arc::new(ReceiptPipeline::new(recognizer, ScanConfig::default()));

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.scan_bytes(tiny_png(), None).await })
        };
        while !pipeline.is_processing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = pipeline.scan_bytes(tiny_png(), None).await;
        assert!(matches!(
            second,
            ScanOutcome::FailedOfferManualFallback { error: ScanError::Busy, offer: None }
        ));

        gate.send(()).unwrap();
        assert!(matches!(first.await.unwrap(), ScanOutcome::Completed(_)));
        assert!(!pipeline.is_processing());
    }

    #[tokio::test]
    async fn remote_route_skips_local_ocr() {
        let config = ScanConfig { use_local_ocr: false, ..ScanConfig::default() };
        let pipeline = ReceiptPipeline::new(MockRecognizer::unavailable("unused"), config)
            .with_vision(Arc::new(FixedVision));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ScanOutcome::Completed(report) = pipeline.scan_bytes(tiny_png(), Some(&tx)).await else {
            panic!("expected completed scan");
        };
        assert_eq!(report.extracted.organization, "Hosted Diner");
        assert!(report.raw_text.is_none());
        assert!(report.confidence.is_none());
        assert_eq!(
            states(&collect(&mut rx)),
            vec![ScanState::ReadingFile, ScanState::Extracting, ScanState::Done]
        );
    }

    #[tokio::test]
    async fn remote_route_without_extractor_fails_with_offer() {
        let config = ScanConfig { use_local_ocr: false, ..ScanConfig::default() };
        let pipeline = ReceiptPipeline::new(MockRecognizer::new("x"), config);
        let outcome = pipeline.scan_bytes(tiny_png(), None).await;
        assert!(matches!(
            outcome,
            ScanOutcome::FailedOfferManualFallback {
                error: ScanError::RemoteExtraction(VisionError::NotConfigured),
                offer: Some(_)
            }
        ));
    }

    #[test]
    fn intake_candidates_by_extension() {
        assert!(is_intake_candidate(Path::new("/in/receipt.JPG")));
        assert!(is_intake_candidate(Path::new("scan.webp")));
        assert!(!is_intake_candidate(Path::new("notes.txt")));
        assert!(!is_intake_candidate(Path::new("no_extension")));
    }
}
