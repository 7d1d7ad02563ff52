use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use vendflow_core::error::{Result, VendflowError};
use vendflow_core::traits::PersistenceSink;
use vendflow_core::types::FinalResult;
use vendflow_core::Context;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS verification_results (
        verification_id TEXT PRIMARY KEY,
        verification_type TEXT NOT NULL,
        vending_machine_id TEXT NOT NULL,
        verification_status TEXT NOT NULL,
        confidence_score REAL NOT NULL DEFAULT 0,
        discrepancies_count INTEGER NOT NULL DEFAULT 0,
        result_image_url TEXT,
        result_json TEXT NOT NULL,
        stored_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_results_stored_at
        ON verification_results(stored_at DESC);

    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        verification_id TEXT NOT NULL,
        vending_machine_id TEXT NOT NULL,
        notified_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_notifications_verification
        ON notifications(verification_id);";

/// One row of `verification_results`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVerification {
    pub verification_id: String,
    pub verification_type: String,
    pub vending_machine_id: String,
    pub result: FinalResult,
    pub stored_at: DateTime<Utc>,
}

/// SQLite-backed result store.
#[derive(Debug)]
pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> VendflowError {
    VendflowError::Database(e.to_string())
}

impl SqliteResultStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Result store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VendflowError::Database(e.to_string()))
    }

    /// Insert or replace the result for a verification.
    pub fn save(
        &self,
        verification_id: &str,
        verification_type: &str,
        vending_machine_id: &str,
        result: &FinalResult,
    ) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO verification_results
                 (verification_id, verification_type, vending_machine_id, verification_status,
                  confidence_score, discrepancies_count, result_image_url, result_json, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(verification_id) DO UPDATE SET
                 verification_status = excluded.verification_status,
                 confidence_score = excluded.confidence_score,
                 discrepancies_count = excluded.discrepancies_count,
                 result_image_url = excluded.result_image_url,
                 result_json = excluded.result_json,
                 stored_at = excluded.stored_at",
            params![
                verification_id,
                verification_type,
                vending_machine_id,
                result.verification_status.as_str(),
                result.confidence_score,
                result.discrepancies_count as i64,
                result.result_image_url,
                result_json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        debug!(verification_id, status = %result.verification_status, "Result stored");
        Ok(())
    }

    /// Load the stored result for one verification.
    pub fn load(&self, verification_id: &str) -> Result<Option<StoredVerification>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT verification_id, verification_type, vending_machine_id, result_json, stored_at
                 FROM verification_results
                 WHERE verification_id = ?1",
                params![verification_id],
                read_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(decode).transpose()
    }

    /// The most recently stored results, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<StoredVerification>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT verification_id, verification_type, vending_machine_id, result_json, stored_at
                 FROM verification_results
                 ORDER BY stored_at DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], read_row)
            .map_err(db_err)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(decode(row.map_err(db_err)?)?);
        }
        Ok(results)
    }

    /// When notifications were recorded for a verification.
    pub fn notifications(&self, verification_id: &str) -> Result<Vec<DateTime<Utc>>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT notified_at FROM notifications
                 WHERE verification_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![verification_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut times = Vec::new();
        for row in rows {
            times.push(parse_timestamp(&row.map_err(db_err)?));
        }
        Ok(times)
    }

    fn record_notification(&self, verification_id: &str, vending_machine_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notifications (verification_id, vending_machine_id, notified_at)
             VALUES (?1, ?2, ?3)",
            params![verification_id, vending_machine_id, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

type RawRow = (String, String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode(
    (verification_id, verification_type, vending_machine_id, result_json, stored_at): RawRow,
) -> Result<StoredVerification> {
    Ok(StoredVerification {
        verification_id,
        verification_type,
        vending_machine_id,
        result: serde_json::from_str(&result_json)?,
        stored_at: parse_timestamp(&stored_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl PersistenceSink for SqliteResultStore {
    fn store<'a>(
        &'a self,
        result: &'a FinalResult,
        context: &'a Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let vc = context.verification_context()?;
            self.save(
                &vc.verification_id,
                &vc.verification_type,
                &vc.vending_machine_id,
                result,
            )
        })
    }

    fn notify<'a>(&'a self, context: &'a Context) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let vc = context.verification_context()?;
            self.record_notification(&vc.verification_id, &vc.vending_machine_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vendflow_core::types::VerificationStatus;

    fn context(id: &str) -> Context {
        let mut ctx = Context::new();
        ctx.merge(
            "verificationContext",
            json!({
                "verificationId": id,
                "verificationType": "LAYOUT_VS_CHECKING",
                "referenceImageUrl": "s3://ref/a.png",
                "checkingImageUrl": "s3://chk/b.png",
                "vendingMachineId": "VM-3245"
            }),
        )
        .unwrap();
        ctx
    }

    fn result(status: &str) -> FinalResult {
        serde_json::from_value(json!({
            "verificationStatus": status,
            "discrepancies": [{"type": "MISSING_PRODUCT", "description": "A3 empty"}],
            "discrepanciesCount": 1,
            "confidenceScore": 0.9,
            "resultImageUrl": "s3://results/v1.png"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let store = SqliteResultStore::in_memory().unwrap();
        store.store(&result("INCORRECT"), &context("verif-1")).await.unwrap();

        let loaded = store.load("verif-1").unwrap().unwrap();
        assert_eq!(loaded.vending_machine_id, "VM-3245");
        assert_eq!(loaded.result.verification_status, VerificationStatus::Incorrect);
        assert_eq!(loaded.result.discrepancies.len(), 1);
        assert_eq!(loaded.result.result_image_url.as_deref(), Some("s3://results/v1.png"));
        assert!(store.load("verif-missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_upserts_by_verification_id() {
        let store = SqliteResultStore::in_memory().unwrap();
        let ctx = context("verif-1");
        store.store(&result("INCORRECT"), &ctx).await.unwrap();
        store.store(&result("CORRECT"), &ctx).await.unwrap();

        let all = store.list_recent(10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].result.verification_status, VerificationStatus::Correct);
    }

    #[tokio::test]
    async fn test_list_recent_limit() {
        let store = SqliteResultStore::in_memory().unwrap();
        for i in 0..5 {
            store
                .store(&result("CORRECT"), &context(&format!("verif-{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(store.list_recent(3).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_store_requires_verification_context() {
        let store = SqliteResultStore::in_memory().unwrap();
        let err = store
            .store(&result("CORRECT"), &Context::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VendflowError::MissingField { .. }));
    }

    #[tokio::test]
    async fn test_notifications_recorded() {
        let store = SqliteResultStore::in_memory().unwrap();
        let ctx = context("verif-9");
        store.notify(&ctx).await.unwrap();
        assert_eq!(store.notifications("verif-9").unwrap().len(), 1);
        assert!(store.notifications("verif-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vendflow.db");
        {
            let store = SqliteResultStore::open(&path).unwrap();
            store.store(&result("CORRECT"), &context("verif-7")).await.unwrap();
        }
        let reopened = SqliteResultStore::open(&path).unwrap();
        assert!(reopened.load("verif-7").unwrap().is_some());
    }

    #[test]
    fn test_open_under_a_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let err = SqliteResultStore::open(&blocker.join("vendflow.db")).unwrap_err();
        assert!(matches!(err, VendflowError::Io(_)));
    }
}
