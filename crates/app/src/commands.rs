use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use billscan_core::{BillId, BillRecord, ManualEntry, Money, RecordStore};
use billscan_ocr::pipeline::spawn_intake_watcher;
use billscan_ocr::{
    validate_source, OcrBackend, PipelineEvent, ReceiptPipeline, RecognitionProgress, ScanError,
    ScanOutcome,
};
use billscan_storage::DbPool;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Create events fire before the writer has finished; give it a moment.
const INTAKE_SETTLE: Duration = Duration::from_millis(500);

/// What happened to one scanned image.
#[derive(Debug)]
pub enum ScanDisposition {
    Stored(BillRecord),
    /// The scan failed and the "Unknown (OCR Failed)" stub was stored in its place.
    StoredFallback { bill: BillRecord, error: ScanError },
    /// The scan failed and nothing was stored. `offered` tells whether a stub was available.
    Failed { error: ScanError, offered: bool },
}

pub async fn scan_image<R, S>(
    pipeline: &ReceiptPipeline<R>,
    store: &S,
    path: &Path,
    auto_accept_fallback: bool,
) -> anyhow::Result<ScanDisposition>
where
    R: OcrBackend + 'static,
    S: RecordStore + ?Sized,
{
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    validate_source(&bytes).with_context(|| format!("{} was not accepted", path.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(event);
        }
    });
    let outcome = pipeline.scan_bytes(bytes, Some(&tx)).await;
    drop(tx);
    let _ = listener.await;

    match outcome {
        ScanOutcome::Completed(report) => {
            if report.extracted.is_ambiguous() {
                warn!("Nothing recognisable on {}; review the stored bill", path.display());
            }
            let bill = report.into_bill();
            store.append(bill.clone()).await?;
            Ok(ScanDisposition::Stored(bill))
        }
        ScanOutcome::FailedOfferManualFallback { error, offer: Some(stub) } if auto_accept_fallback => {
            store.append(stub.clone()).await?;
            Ok(ScanDisposition::StoredFallback { bill: stub, error })
        }
        ScanOutcome::FailedOfferManualFallback { error, offer } => {
            Ok(ScanDisposition::Failed { error, offered: offer.is_some() })
        }
    }
}

fn log_event(event: PipelineEvent) {
    match event {
        PipelineEvent::State { state } => debug!(?state, "scan state"),
        PipelineEvent::Progress { progress: RecognitionProgress::Initializing } => {
            info!("Loading OCR engine")
        }
        PipelineEvent::Progress { progress: RecognitionProgress::Recognizing { percent } } => {
            debug!(percent, "recognizing")
        }
    }
}

pub fn report(path: &Path, disposition: &ScanDisposition) -> anyhow::Result<()> {
    match disposition {
        ScanDisposition::Stored(bill) => println!("{}", serde_json::to_string_pretty(bill)?),
        ScanDisposition::StoredFallback { bill, error } => {
            eprintln!("{}: {error}", path.display());
            eprintln!("Stored placeholder bill {} for manual correction.", bill.id);
        }
        ScanDisposition::Failed { error, offered } => {
            eprintln!("{}: {error}", path.display());
            if *offered {
                eprintln!("Record it by hand with `billscan add <ORGANIZATION> <AMOUNT> [TIP]`.");
            }
        }
    }
    Ok(())
}

pub async fn scan<R, S>(
    pipeline: &ReceiptPipeline<R>,
    store: &S,
    images: &[PathBuf],
    auto_accept_fallback: bool,
) -> anyhow::Result<()>
where
    R: OcrBackend + 'static,
    S: RecordStore + ?Sized,
{
    let mut failures = 0;
    for path in images {
        match scan_image(pipeline, store, path, auto_accept_fallback).await {
            Ok(disposition) => {
                if matches!(disposition, ScanDisposition::Failed { .. }) {
                    failures += 1;
                }
                report(path, &disposition)?;
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {e:#}", path.display());
            }
        }
    }
    pipeline.reap_orphans().await;
    if failures > 0 {
        bail!("{failures} of {} images could not be scanned", images.len());
    }
    Ok(())
}

/// Scan files dropped into `intake_dir` one at a time until Ctrl-C.
pub async fn watch<R, S>(
    pipeline: &ReceiptPipeline<R>,
    store: &S,
    intake_dir: &Path,
    auto_accept_fallback: bool,
) -> anyhow::Result<()>
where
    R: OcrBackend + 'static,
    S: RecordStore + ?Sized,
{
    std::fs::create_dir_all(intake_dir)
        .with_context(|| format!("Failed to create intake folder {}", intake_dir.display()))?;

    // The channel bridges the notify watcher thread and this loop, which keeps scans serial.
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
    let _watcher =
        spawn_intake_watcher(intake_dir, tx).context("Failed to start intake folder watcher")?;
    info!("Watching intake folder: {}", intake_dir.display());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Stopping intake watcher");
                break;
            }
            next = rx.recv() => {
                let Some(path) = next else { break };
                tokio::time::sleep(INTAKE_SETTLE).await;
                info!("Processing receipt: {}", path.display());
                match scan_image(pipeline, store, &path, auto_accept_fallback).await {
                    Ok(disposition) => report(&path, &disposition)?,
                    Err(e) => warn!("Skipping {}: {e:#}", path.display()),
                }
            }
        }
    }

    let reaped = pipeline.reap_orphans().await;
    if reaped > 0 {
        info!(reaped, "Waited for abandoned recognition calls");
    }
    Ok(())
}

pub async fn add<S: RecordStore + ?Sized>(
    store: &S,
    organization: &str,
    amount: &str,
    tip: &str,
) -> anyhow::Result<BillRecord> {
    let bill = BillRecord::manual(&ManualEntry {
        organization: organization.to_string(),
        amount: amount.to_string(),
        tip: tip.to_string(),
    })?;
    store.append(bill.clone()).await?;
    Ok(bill)
}

/// Sum of amounts and sum of tips.
pub fn totals(bills: &[BillRecord]) -> (Money, Money) {
    bills.iter().fold((Money::zero(), Money::zero()), |(amount, tip), b| {
        (amount + b.amount, tip + b.tip)
    })
}

pub async fn list<S: RecordStore + ?Sized>(store: &S) -> anyhow::Result<()> {
    let bills = store.list().await?;
    for bill in &bills {
        let flag = if bill.is_manual {
            " [manual]"
        } else if bill.is_ocr_failed {
            " [ocr failed]"
        } else {
            ""
        };
        println!(
            "{:>14}  {}  {:<32} {:>10} {:>9}{flag}",
            bill.id,
            bill.date.format("%Y-%m-%d %H:%M"),
            bill.organization,
            bill.amount.to_string(),
            bill.tip.to_string(),
        );
    }
    let (amount, tip) = totals(&bills);
    println!("{} bills, total {amount}, tips {tip}", bills.len());
    Ok(())
}

pub async fn delete(db: &DbPool, id: BillId) -> anyhow::Result<()> {
    if !billscan_storage::delete_bill(db, id).await? {
        bail!("No bill with id {id}");
    }
    println!("Deleted bill {id}");
    Ok(())
}
