use facematch_core::{blob, codec, Candidate, Embedding, MalformedEmbedding};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS enrollments (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp                INTEGER NOT NULL,
    embedding                TEXT    NOT NULL,
    identifier               TEXT    NOT NULL,
    verification_attempts    INTEGER NOT NULL DEFAULT 0 CHECK (verification_attempts >= 0),
    successful_verifications INTEGER NOT NULL DEFAULT 0
        CHECK (successful_verifications >= 0 AND successful_verifications <= verification_attempts)
);
";

const RECORD_COLUMNS: &str =
    "id, timestamp, embedding, identifier, verification_attempts, successful_verifications";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no enrollment with id {0}")]
    NotFound(i64),
    #[error("enrollment {id}: {source}")]
    Malformed {
        id: i64,
        #[source]
        source: MalformedEmbedding,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One enrolled face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentRecord {
    pub id: i64,
    /// Enrollment time, epoch seconds.
    pub timestamp: i64,
    /// Canonical embedding text.
    pub embedding: String,
    /// Subject label; not unique.
    pub identifier: String,
    pub verification_attempts: u32,
    pub successful_verifications: u32,
}

impl EnrollmentRecord {
    pub fn decode_embedding(&self) -> Result<Embedding> {
        codec::decode(&self.embedding).map_err(|source| StoreError::Malformed {
            id: self.id,
            source,
        })
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            embedding: row.get(2)?,
            identifier: row.get(3)?,
            verification_attempts: row.get(4)?,
            successful_verifications: row.get(5)?,
        })
    }
}

/// Aggregate counters across all enrollments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub enrollments: u64,
    pub verification_attempts: u64,
    pub successful_verifications: u64,
}

/// Outcome of [`EnrollmentStore::migrate_to_binary`].
#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Rows whose text could not be decoded, left without a binary copy.
    pub failed: Vec<(i64, String)>,
}

/// Enrollment table on a single SQLite connection.
///
/// Not `Sync`: share it by owning it on one thread.
pub struct EnrollmentStore {
    conn: Connection,
}

impl EnrollmentStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened enrollment store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        let store = Self { conn };
        store.ensure_blob_column()?;
        Ok(store)
    }

    /// Databases written before the binary migration lack `embedding_f32`.
    fn ensure_blob_column(&self) -> Result<()> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(enrollments)")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if !columns.iter().any(|c| c == "embedding_f32") {
            self.conn
                .execute("ALTER TABLE enrollments ADD COLUMN embedding_f32 BLOB", [])?;
            tracing::info!("added embedding_f32 column");
        }
        Ok(())
    }

    /// Store a new enrollment with zeroed counters.
    pub fn enroll(&self, identifier: &str, embedding: &Embedding) -> Result<EnrollmentRecord> {
        let timestamp = chrono::Utc::now().timestamp();
        let text = embedding.to_string();

        self.conn.execute(
            "INSERT INTO enrollments (timestamp, embedding, identifier) VALUES (?1, ?2, ?3)",
            params![timestamp, text, identifier],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(id, identifier, dim = embedding.dim(), "enrolled face");

        Ok(EnrollmentRecord {
            id,
            timestamp,
            embedding: text,
            identifier: identifier.to_string(),
            verification_attempts: 0,
            successful_verifications: 0,
        })
    }

    /// Count one verification attempt, and a success when `matched`.
    ///
    /// Both counters move in a single statement.
    pub fn record_verification(&self, id: i64, matched: bool) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE enrollments
             SET verification_attempts = verification_attempts + 1,
                 successful_verifications = successful_verifications + ?1
             WHERE id = ?2",
            params![i64::from(matched), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::debug!(id, matched, "recorded verification");
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<EnrollmentRecord> {
        self.conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM enrollments WHERE id = ?1"),
                params![id],
                EnrollmentRecord::from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound(id))
    }

    /// Every enrollment, oldest first.
    pub fn all(&self) -> Result<Vec<EnrollmentRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM enrollments ORDER BY id"))?;
        let rows = stmt.query_map([], EnrollmentRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Id-keyed candidate pool for similarity scans.
    pub fn candidates(&self) -> Result<Vec<Candidate<i64>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, embedding FROM enrollments ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok(Candidate::new(row.get(0)?, row.get::<_, String>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (enrollments, attempts, successes): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(verification_attempts), 0),
                    COALESCE(SUM(successful_verifications), 0)
             FROM enrollments",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StoreStats {
            enrollments: enrollments.max(0) as u64,
            verification_attempts: attempts.max(0) as u64,
            successful_verifications: successes.max(0) as u64,
        })
    }

    /// Delete every enrollment. Returns the number of rows removed.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM enrollments", [])?;
        tracing::info!(removed, "cleared enrollment store");
        Ok(removed)
    }

    /// Fill the binary column for rows that lack it.
    ///
    /// The text column is left untouched so older readers keep working.
    /// Running it again only processes rows added or left behind since.
    pub fn migrate_to_binary(&mut self) -> Result<MigrationReport> {
        let tx = self.conn.transaction()?;
        let pending = {
            let mut stmt =
                tx.prepare("SELECT id, embedding FROM enrollments WHERE embedding_f32 IS NULL")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut report = MigrationReport::default();
        for (id, text) in pending {
            match codec::decode(&text).and_then(|embedding| blob::to_blob(&embedding)) {
                Ok(bytes) => {
                    tx.execute(
                        "UPDATE enrollments SET embedding_f32 = ?1 WHERE id = ?2",
                        params![bytes, id],
                    )?;
                    report.migrated += 1;
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "cannot migrate enrollment");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        tx.commit()?;

        tracing::info!(
            migrated = report.migrated,
            failed = report.failed.len(),
            "binary embedding migration finished"
        );
        Ok(report)
    }

    /// The migrated binary embedding for `id`, if the row has one.
    pub fn binary_embedding(&self, id: i64) -> Result<Option<Embedding>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT embedding_f32 FROM enrollments WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound(id))?;

        bytes
            .map(|b| blob::from_blob(&b).map_err(|source| StoreError::Malformed { id, source }))
            .transpose()
    }

    #[cfg(test)]
    fn insert_raw(&self, identifier: &str, text: &str) -> i64 {
        self.conn
            .execute(
                "INSERT INTO enrollments (timestamp, embedding, identifier) VALUES (0, ?1, ?2)",
                params![text, identifier],
            )
            .unwrap();
        self.conn.last_insert_rowid()
    }
}
