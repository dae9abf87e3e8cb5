use std::sync::Arc;

use anyhow::Context;
use billscan_ocr::{OpenAiVisionExtractor, ReceiptPipeline};
use billscan_storage::SqliteStore;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;

use cli::{Command, USAGE};
use config::AppConfig;

#[cfg(feature = "tesseract")]
fn ocr_engine(config: &AppConfig) -> billscan_ocr::TesseractRecognizer {
    billscan_ocr::TesseractRecognizer::new(config.ocr.tessdata_path.clone())
}

#[cfg(not(feature = "tesseract"))]
fn ocr_engine(_config: &AppConfig) -> billscan_ocr::MockRecognizer {
    billscan_ocr::MockRecognizer::unavailable("billscan was built without the `tesseract` feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let invocation = match cli::parse(std::env::args().skip(1)) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    if invocation.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config_path = match invocation.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let db_path = data_dir.join("bills.db");
    let db = billscan_storage::create_db(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let store = SqliteStore::new(db.clone());

    // ── Receipt pipeline ──────────────────────────────────────────────────────
    let mut pipeline = ReceiptPipeline::new(ocr_engine(&config), config.scan)
        .with_options(config.pipeline_options());
    if let Some(key) = &config.vision.api_key {
        pipeline = pipeline.with_vision(Arc::new(OpenAiVisionExtractor::new(
            config.vision.base_url.clone(),
            config.vision.model.clone(),
            key.clone(),
        )));
    } else if !config.scan.use_local_ocr {
        tracing::warn!(
            "Local OCR is disabled but no vision API key is set ({})",
            config::VISION_API_KEY_ENV
        );
    }

    match invocation.command {
        Command::Scan { images } => {
            commands::scan(&pipeline, &store, &images, config.auto_accept_fallback).await
        }
        Command::Watch => {
            let intake_dir = config.intake_dir()?;
            commands::watch(&pipeline, &store, &intake_dir, config.auto_accept_fallback).await
        }
        Command::Add { organization, amount, tip } => {
            let bill = commands::add(&store, &organization, &amount, &tip).await?;
            println!("{}", serde_json::to_string_pretty(&bill)?);
            Ok(())
        }
        Command::List => commands::list(&store).await,
        Command::Delete { id } => commands::delete(&db, id).await,
        Command::Help => Ok(()),
    }
}
