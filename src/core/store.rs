/// Coverage store: durable per-bucket generation counts.
///
/// The SQLite store increments with a single upsert statement so
/// concurrent producers never lose an update. The in-memory store holds the
/// same contract behind a mutex and backs tests and dry runs.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::core::space::BucketSpace;
use crate::schema::bucket::BucketKey;
use crate::schema::coverage::{BatchQuality, CoverageRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coverage store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("coverage store holds an unreadable record: {0}")]
    CorruptRecord(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::StoreUnavailable(e.to_string())
    }
}

/// Operations every coverage backend provides. Records are created and
/// changed only through `increment`.
pub trait CoverageStore: Send + Sync {
    /// Times the bucket has been generated; 0 when it has no record.
    fn get_count(&self, bucket: &BucketKey) -> Result<u64, StoreError>;

    /// Record one successful generation for the bucket.
    fn increment(&self, bucket: &BucketKey) -> Result<(), StoreError>;

    /// Up to `limit` buckets of the space, least generated first. Ties go
    /// to the earliest first generation (never-generated buckets first),
    /// then to lexical bucket order.
    fn least_covered(&self, limit: usize) -> Result<Vec<BucketKey>, StoreError>;

    /// Every stored record.
    fn snapshot(&self) -> Result<BTreeMap<BucketKey, CoverageRecord>, StoreError>;

    /// Keep the outcome of a validated batch. Stores without a history
    /// table ignore it.
    fn record_batch_quality(&self, _quality: &BatchQuality) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Order the space's buckets by coverage using the store's records.
pub fn rank_least_covered(
    space: &BucketSpace,
    records: &BTreeMap<BucketKey, CoverageRecord>,
    limit: usize,
) -> Vec<BucketKey> {
    let mut ranked: Vec<(u64, Option<DateTime<Utc>>, BucketKey)> = space
        .buckets()
        .into_iter()
        .map(|bucket| match records.get(&bucket) {
            Some(r) => (r.generated_count, Some(r.first_generated_at), bucket),
            None => (0, None, bucket),
        })
        .collect();
    ranked.sort();
    ranked.into_iter().take(limit).map(|(_, _, b)| b).collect()
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord(format!("timestamp '{}': {}", raw, e)))
}

fn encode_key(bucket: &BucketKey) -> Result<String, StoreError> {
    serde_json::to_string(bucket).map_err(|e| StoreError::CorruptRecord(e.to_string()))
}

fn decode_key(raw: &str) -> Result<BucketKey, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::CorruptRecord(format!("bucket key '{}': {}", raw, e)))
}

/// SQLite-backed coverage store.
pub struct SqliteCoverageStore {
    conn: Mutex<Connection>,
    space: Arc<BucketSpace>,
}

impl SqliteCoverageStore {
    /// Open (or create) the coverage database at `path`.
    pub fn open(path: &Path, space: Arc<BucketSpace>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        Self::init(conn, space)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(space: Arc<BucketSpace>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, space)
    }

    fn init(conn: Connection, space: Arc<BucketSpace>) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS bucket_coverage (
                bucket_key          TEXT PRIMARY KEY,
                generated_count     INTEGER NOT NULL DEFAULT 0,
                first_generated_at  TEXT NOT NULL,
                last_generated_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS generation_quality (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id        TEXT NOT NULL,
                recorded_at     TEXT NOT NULL,
                total_examples  INTEGER NOT NULL,
                passed          INTEGER NOT NULL,
                failed_checks   TEXT NOT NULL
            );
            ",
        )?;
        tracing::debug!(buckets = space.bucket_count(), "coverage store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            space,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::StoreUnavailable("connection lock poisoned".to_string()))
    }

    /// Validation outcomes recorded so far, oldest first.
    pub fn batch_history(&self) -> Result<Vec<BatchQuality>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, recorded_at, total_examples, passed, failed_checks
             FROM generation_quality
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (batch_id, recorded_at, total, passed, failed) = row?;
            let failed_checks: Vec<String> = serde_json::from_str(&failed)
                .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
            history.push(BatchQuality {
                batch_id,
                recorded_at: parse_timestamp(&recorded_at)?,
                total_examples: total.max(0) as usize,
                passed,
                failed_checks,
            });
        }
        Ok(history)
    }
}

impl CoverageStore for SqliteCoverageStore {
    fn get_count(&self, bucket: &BucketKey) -> Result<u64, StoreError> {
        let key = encode_key(bucket)?;
        let conn = self.lock()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT generated_count FROM bucket_coverage WHERE bucket_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    fn increment(&self, bucket: &BucketKey) -> Result<(), StoreError> {
        let key = encode_key(bucket)?;
        let now = timestamp(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bucket_coverage (bucket_key, generated_count, first_generated_at, last_generated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(bucket_key) DO UPDATE SET
                 generated_count = generated_count + 1,
                 last_generated_at = excluded.last_generated_at",
            params![key, now],
        )?;
        Ok(())
    }

    fn least_covered(&self, limit: usize) -> Result<Vec<BucketKey>, StoreError> {
        let records = self.snapshot()?;
        Ok(rank_least_covered(&self.space, &records, limit))
    }

    fn snapshot(&self) -> Result<BTreeMap<BucketKey, CoverageRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT bucket_key, generated_count, first_generated_at, last_generated_at
             FROM bucket_coverage",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = BTreeMap::new();
        for row in rows {
            let (key, count, first, last) = row?;
            let bucket = decode_key(&key)?;
            records.insert(
                bucket.clone(),
                CoverageRecord {
                    bucket,
                    generated_count: count.max(0) as u64,
                    first_generated_at: parse_timestamp(&first)?,
                    last_generated_at: parse_timestamp(&last)?,
                },
            );
        }
        Ok(records)
    }

    fn record_batch_quality(&self, quality: &BatchQuality) -> Result<(), StoreError> {
        let failed = serde_json::to_string(&quality.failed_checks)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO generation_quality (batch_id, recorded_at, total_examples, passed, failed_checks)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                quality.batch_id,
                timestamp(quality.recorded_at),
                quality.total_examples as i64,
                quality.passed,
                failed
            ],
        )?;
        Ok(())
    }
}

/// Coverage store kept in process memory.
pub struct MemoryCoverageStore {
    records: Mutex<BTreeMap<BucketKey, CoverageRecord>>,
    space: Arc<BucketSpace>,
}

impl MemoryCoverageStore {
    pub fn new(space: Arc<BucketSpace>) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            space,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<BucketKey, CoverageRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::StoreUnavailable("record lock poisoned".to_string()))
    }
}

impl CoverageStore for MemoryCoverageStore {
    fn get_count(&self, bucket: &BucketKey) -> Result<u64, StoreError> {
        Ok(self
            .lock()?
            .get(bucket)
            .map(|r| r.generated_count)
            .unwrap_or(0))
    }

    fn increment(&self, bucket: &BucketKey) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut records = self.lock()?;
        records
            .entry(bucket.clone())
            .and_modify(|r| {
                r.generated_count += 1;
                r.last_generated_at = now;
            })
            .or_insert_with(|| CoverageRecord {
                bucket: bucket.clone(),
                generated_count: 1,
                first_generated_at: now,
                last_generated_at: now,
            });
        Ok(())
    }

    fn least_covered(&self, limit: usize) -> Result<Vec<BucketKey>, StoreError> {
        let records = self.lock()?;
        Ok(rank_least_covered(&self.space, &records, limit))
    }

    fn snapshot(&self) -> Result<BTreeMap<BucketKey, CoverageRecord>, StoreError> {
        Ok(self.lock()?.clone())
    }
}
