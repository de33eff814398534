//! SQLite engine-state persistence.
//!
//! Stores memoized task results and circuit breaker snapshots so that a
//! restarted engine of the same version picks up where the last one stopped.

use chrono::{DateTime, Utc};
use sqlx::Row;

use conductor_core::repository::EngineStateRepository;
use conductor_types::error::RepositoryError;
use conductor_types::state::{BreakerSnapshot, CacheEntry, CircuitStateKind};
use conductor_types::task::TaskOutput;

use super::pool::DatabasePool;

/// SQLite-backed [`EngineStateRepository`].
#[derive(Debug, Clone)]
pub struct SqliteEngineStateStore {
    pool: DatabasePool,
}

impl SqliteEngineStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

impl EngineStateRepository for SqliteEngineStateStore {
    async fn load_cache_entries(&self, engine_version: &str) -> Result<Vec<CacheEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM cache_entries WHERE engine_version = ? ORDER BY created_at",
        )
        .bind(engine_version)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let cache_row =
                CacheSqlRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            entries.push(cache_row.into_entry()?);
        }
        Ok(entries)
    }

    async fn save_cache_entries(&self, entries: &[CacheEntry]) -> Result<(), RepositoryError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for entry in entries {
            let value = serde_json::to_string(&entry.value)
                .map_err(|e| RepositoryError::Corrupt(format!("unserializable cache value: {e}")))?;
            let ttl_ms = i64::try_from(entry.ttl_ms).unwrap_or(i64::MAX);

            sqlx::query(
                r#"INSERT INTO cache_entries (fingerprint, value, created_at, ttl_ms, expires_at, engine_version)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT (fingerprint) DO UPDATE SET
                       value = excluded.value,
                       created_at = excluded.created_at,
                       ttl_ms = excluded.ttl_ms,
                       expires_at = excluded.expires_at,
                       engine_version = excluded.engine_version"#,
            )
            .bind(&entry.fingerprint)
            .bind(value)
            .bind(format_datetime(&entry.created_at))
            .bind(ttl_ms)
            .bind(entry.created_at.timestamp_millis().saturating_add(ttl_ms))
            .bind(&entry.engine_version)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn purge_expired_cache(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn load_breakers(&self, engine_version: &str) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM circuit_breakers WHERE engine_version = ? ORDER BY capability",
        )
        .bind(engine_version)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            let breaker_row =
                BreakerSqlRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            snapshots.push(breaker_row.into_snapshot()?);
        }
        Ok(snapshots)
    }

    async fn save_breakers(&self, snapshots: &[BreakerSnapshot]) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        for snapshot in snapshots {
            sqlx::query(
                r#"INSERT INTO circuit_breakers (capability, state, consecutive_failures, opened_at, total_calls, total_failures, engine_version, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (capability) DO UPDATE SET
                       state = excluded.state,
                       consecutive_failures = excluded.consecutive_failures,
                       opened_at = excluded.opened_at,
                       total_calls = excluded.total_calls,
                       total_failures = excluded.total_failures,
                       engine_version = excluded.engine_version,
                       updated_at = excluded.updated_at"#,
            )
            .bind(&snapshot.capability)
            .bind(snapshot.state.as_str())
            .bind(snapshot.consecutive_failures as i64)
            .bind(snapshot.opened_at.map(|dt| format_datetime(&dt)))
            .bind(snapshot.total_calls as i64)
            .bind(snapshot.total_failures as i64)
            .bind(&snapshot.engine_version)
            .bind(&now)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private Row types
// ---------------------------------------------------------------------------

struct CacheSqlRow {
    fingerprint: String,
    value: String,
    created_at: String,
    ttl_ms: i64,
    engine_version: String,
}

impl CacheSqlRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            fingerprint: row.try_get("fingerprint")?,
            value: row.try_get("value")?,
            created_at: row.try_get("created_at")?,
            ttl_ms: row.try_get("ttl_ms")?,
            engine_version: row.try_get("engine_version")?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, RepositoryError> {
        let value: TaskOutput = serde_json::from_str(&self.value).map_err(|e| {
            RepositoryError::Corrupt(format!("cache entry {}: {e}", self.fingerprint))
        })?;
        Ok(CacheEntry {
            created_at: parse_datetime(&self.created_at)?,
            fingerprint: self.fingerprint,
            value,
            ttl_ms: self.ttl_ms.max(0) as u64,
            engine_version: self.engine_version,
        })
    }
}

struct BreakerSqlRow {
    capability: String,
    state: String,
    consecutive_failures: i64,
    opened_at: Option<String>,
    total_calls: i64,
    total_failures: i64,
    engine_version: String,
}

impl BreakerSqlRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            capability: row.try_get("capability")?,
            state: row.try_get("state")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            opened_at: row.try_get("opened_at")?,
            total_calls: row.try_get("total_calls")?,
            total_failures: row.try_get("total_failures")?,
            engine_version: row.try_get("engine_version")?,
        })
    }

    fn into_snapshot(self) -> Result<BreakerSnapshot, RepositoryError> {
        let state = CircuitStateKind::parse(&self.state).ok_or_else(|| {
            RepositoryError::Corrupt(format!(
                "breaker {}: unknown state '{}'",
                self.capability, self.state
            ))
        })?;
        let opened_at = self.opened_at.as_deref().map(parse_datetime).transpose()?;

        Ok(BreakerSnapshot {
            capability: self.capability,
            state,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            opened_at,
            total_calls: self.total_calls.max(0) as u64,
            total_failures: self.total_failures.max(0) as u64,
            engine_version: self.engine_version,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
