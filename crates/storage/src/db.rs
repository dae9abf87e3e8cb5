use async_trait::async_trait;
use billscan_core::{BillId, BillRecord, ImageRef, Money, RecordStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::info;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    info!(path = %path.display(), "Bill database ready");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bills (
            id INTEGER PRIMARY KEY,
            date TEXT NOT NULL,
            image_sha256 TEXT,
            image_mime TEXT,
            organization TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            tip_cents INTEGER NOT NULL DEFAULT 0,
            raw_text TEXT,
            confidence REAL,
            is_manual INTEGER NOT NULL DEFAULT 0,
            is_ocr_failed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

type BillRow = (
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    i64,
    i64,
    Option<String>,
    Option<f64>,
    i64,
    i64,
);

const BILL_COLUMNS: &str = "id, date, image_sha256, image_mime, organization, amount_cents, tip_cents, raw_text, confidence, is_manual, is_ocr_failed";

fn bill_from_row(r: BillRow) -> Result<BillRecord, sqlx::Error> {
    let date = DateTime::parse_from_rfc3339(&r.1)
        .map_err(|e| sqlx::Error::Decode(e.into()))?
        .with_timezone(&Utc);
    let image = match (r.2, r.3) {
        (Some(sha256), Some(mime_type)) => Some(ImageRef { sha256, mime_type }),
        _ => None,
    };
    Ok(BillRecord {
        id: BillId(r.0),
        date,
        image,
        organization: r.4,
        amount: Money::from_cents(r.5),
        tip: Money::from_cents(r.6),
        raw_text: r.7,
        confidence: r.8.map(|c| c as f32),
        is_manual: r.9 != 0,
        is_ocr_failed: r.10 != 0,
    })
}

pub async fn insert_bill(pool: &DbPool, bill: &BillRecord) -> Result<BillId, sqlx::Error> {
    sqlx::query(
        "INSERT INTO bills (id, date, image_sha256, image_mime, organization, amount_cents, tip_cents, raw_text, confidence, is_manual, is_ocr_failed) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    )
    .bind(bill.id.0)
    .bind(bill.date.to_rfc3339())
    .bind(bill.image.as_ref().map(|i| i.sha256.as_str()))
    .bind(bill.image.as_ref().map(|i| i.mime_type.as_str()))
    .bind(&bill.organization)
    .bind(bill.amount.to_cents())
    .bind(bill.tip.to_cents())
    .bind(bill.raw_text.as_deref())
    .bind(bill.confidence.map(f64::from))
    .bind(bill.is_manual as i64)
    .bind(bill.is_ocr_failed as i64)
    .execute(pool)
    .await?;

    Ok(bill.id)
}

/// All bills, newest first.
pub async fn get_bills(pool: &DbPool) -> Result<Vec<BillRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, BillRow>(&format!(
        "SELECT {BILL_COLUMNS} FROM bills ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(bill_from_row).collect()
}

pub async fn get_bill_by_id(pool: &DbPool, id: BillId) -> Result<Option<BillRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, BillRow>(&format!("SELECT {BILL_COLUMNS} FROM bills WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(pool)
        .await?;

    row.map(bill_from_row).transpose()
}

/// Returns whether a bill was removed.
pub async fn delete_bill(pool: &DbPool, id: BillId) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM bills WHERE id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// [`RecordStore`] backed by the SQLite bill table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn append(&self, record: BillRecord) -> Result<BillId, StoreError> {
        insert_bill(&self.pool, &record).await.map_err(|e| {
            let duplicate = e
                .as_database_error()
                .map_or(false, |d| d.is_unique_violation());
            if duplicate {
                StoreError::Duplicate(record.id)
            } else {
                StoreError::Backend(e.to_string())
            }
        })
    }

    async fn list(&self) -> Result<Vec<BillRecord>, StoreError> {
        get_bills(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}
