//! SQLite persistence for enrolled identities and attendance records.

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::gallery::GalleryError;
use rollcall_core::ledger::{LedgerError, WindowKey};
use rollcall_core::{AttendanceRecord, Embedding, EnrolledIdentity, IdentityRepository, LedgerBackend};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_id   TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    enrolled_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id  TEXT NOT NULL,
    display_name TEXT NOT NULL,
    camera_id    TEXT NOT NULL,
    confidence   REAL NOT NULL,
    marked_at    TEXT NOT NULL,
    date         TEXT NOT NULL,
    window_key   TEXT NOT NULL,
    UNIQUE (identity_id, window_key)
);

CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance (date);
";

/// Identity repository and ledger backend over one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "cannot create database directory");
            }
        }
        let conn = Connection::open(path)?;
        // journal_mode returns a row, so its result is not checked.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    #[cfg(test)]
    fn identity_count(&self) -> rusqlite::Result<usize> {
        self.conn()
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

fn embedding_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

fn repo_err(e: rusqlite::Error) -> GalleryError {
    GalleryError::Repository(e.to_string())
}

fn ledger_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

impl IdentityRepository for SqliteStore {
    fn upsert(&self, identity: &EnrolledIdentity) -> Result<(), GalleryError> {
        self.conn()
            .execute(
                "INSERT INTO identities (identity_id, display_name, embedding, model_version, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (identity_id) DO UPDATE SET
                     display_name = excluded.display_name,
                     embedding = excluded.embedding,
                     model_version = excluded.model_version,
                     enrolled_at = excluded.enrolled_at",
                params![
                    identity.identity_id,
                    identity.display_name,
                    embedding_to_blob(&identity.embedding.values),
                    identity.embedding.model_version,
                    identity.enrolled_at.to_rfc3339(),
                ],
            )
            .map_err(repo_err)?;
        Ok(())
    }

    fn remove(&self, identity_id: &str) -> Result<(), GalleryError> {
        self.conn()
            .execute("DELETE FROM identities WHERE identity_id = ?1", params![identity_id])
            .map_err(repo_err)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<EnrolledIdentity>, GalleryError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, display_name, embedding, model_version, enrolled_at
                 FROM identities ORDER BY identity_id",
            )
            .map_err(repo_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(repo_err)?;

        let mut identities = Vec::new();
        for row in rows {
            let (identity_id, display_name, blob, model_version, enrolled_at) =
                row.map_err(repo_err)?;
            let (Some(values), Some(enrolled_at)) =
                (blob_to_embedding(&blob), parse_time(&enrolled_at))
            else {
                tracing::warn!(identity_id = %identity_id, "skipping corrupt identity row");
                continue;
            };
            identities.push(EnrolledIdentity {
                identity_id,
                display_name,
                embedding: Embedding {
                    values,
                    model_version,
                },
                enrolled_at,
            });
        }
        Ok(identities)
    }
}

impl LedgerBackend for SqliteStore {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, LedgerError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO attendance
                     (identity_id, display_name, camera_id, confidence, marked_at, date, window_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.identity_id,
                    record.display_name,
                    record.camera_id,
                    record.confidence as f64,
                    record.timestamp.to_rfc3339(),
                    record.date.to_string(),
                    record.window.as_str(),
                ],
            )
            .map_err(ledger_err)?;
        Ok(inserted == 1)
    }

    fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, display_name, camera_id, confidence, marked_at, window_key
                 FROM attendance WHERE date = ?1 ORDER BY marked_at",
            )
            .map_err(ledger_err)?;
        let rows = stmt
            .query_map(params![date.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(ledger_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (identity_id, display_name, camera_id, confidence, marked_at, window_key) =
                row.map_err(ledger_err)?;
            let Some(timestamp) = parse_time(&marked_at) else {
                tracing::warn!(identity_id = %identity_id, marked_at = %marked_at, "skipping attendance row with bad timestamp");
                continue;
            };
            records.push(AttendanceRecord {
                identity_id,
                display_name,
                timestamp,
                camera_id,
                confidence: confidence as f32,
                date,
                window: WindowKey(window_key),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use rollcall_core::{AttendanceLedger, AttendanceWindow, EmbeddingStore, MarkOutcome};
    use std::sync::Arc;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn ledger(store: Arc<SqliteStore>) -> AttendanceLedger {
        AttendanceLedger::new(store, AttendanceWindow::daily(FixedOffset::east_opt(0).unwrap()))
    }

    #[test]
    fn test_embedding_blob_roundtrip_is_little_endian() {
        let blob = embedding_to_blob(&[1.0, -0.5]);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(blob_to_embedding(&blob).unwrap(), vec![1.0, -0.5]);
        assert!(blob_to_embedding(&[0, 1, 2]).is_none());
    }

    #[test]
    fn test_gallery_survives_reopen_through_store() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gallery = EmbeddingStore::open(2, store.clone()).unwrap();
        gallery.enroll("u1", "Ada", Embedding::new(vec![1.0, 0.0])).unwrap();
        gallery.enroll("u1", "Ada L.", Embedding::new(vec![0.0, 1.0])).unwrap();
        gallery.enroll("u2", "Bob", Embedding::new(vec![0.6, 0.8])).unwrap();
        assert_eq!(store.identity_count().unwrap(), 2);

        let reopened = EmbeddingStore::open(2, store.clone()).unwrap();
        assert_eq!(reopened.len(), 2);
        let ada = reopened.get("u1").unwrap();
        assert_eq!(ada.display_name, "Ada L.");
        assert_eq!(ada.embedding.values, vec![0.0, 1.0]);

        assert!(reopened.remove("u1").unwrap());
        assert_eq!(store.identity_count().unwrap(), 1);
    }

    #[test]
    fn test_mismatched_dimension_rows_skipped_on_load() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        EmbeddingStore::open(3, store.clone())
            .unwrap()
            .enroll("u1", "Ada", Embedding::new(vec![1.0, 0.0, 0.0]))
            .unwrap();
        assert!(EmbeddingStore::open(2, store).unwrap().is_empty());
    }

    #[test]
    fn test_unique_window_constraint_marks_once() {
        let ledger = ledger(Arc::new(SqliteStore::open_in_memory().unwrap()));

        let first = ledger
            .record_if_new("u1", "Ada", "cam0", 0.91, utc("2026-05-04T08:00:00Z"))
            .unwrap();
        let again = ledger
            .record_if_new("u1", "Ada", "cam1", 0.95, utc("2026-05-04T17:00:00Z"))
            .unwrap();
        let next_day = ledger
            .record_if_new("u1", "Ada", "cam0", 0.9, utc("2026-05-05T08:00:00Z"))
            .unwrap();
        assert_eq!(first, MarkOutcome::Marked);
        assert_eq!(again, MarkOutcome::AlreadyPresent);
        assert_eq!(next_day, MarkOutcome::Marked);

        let day = ledger.summary("2026-05-04".parse().unwrap()).unwrap();
        assert_eq!(day.total_present, 1);
        assert_eq!(day.records.len(), 1);
        assert_eq!(day.records[0].camera_id, "cam0");
        assert!((day.records[0].confidence - 0.91).abs() < 1e-6);
        assert_eq!(day.records[0].window.as_str(), "2026-05-04");

        let next = ledger.summary("2026-05-05".parse().unwrap()).unwrap();
        assert_eq!(next.total_present, 1);
    }

    #[test]
    fn test_concurrent_marks_hit_database_once() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Arc::new(ledger(store));
        let at = utc("2026-05-04T08:00:00Z");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger.record_if_new("u1", "Ada", &format!("cam{i}"), 0.9, at).unwrap()
                })
            })
            .collect();
        let marked = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == MarkOutcome::Marked)
            .count();
        assert_eq!(marked, 1);
    }
}
