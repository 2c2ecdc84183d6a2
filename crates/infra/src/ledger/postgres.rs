//! Postgres-backed ledger store.
//!
//! ## Ownership
//!
//! `claim` is a single conditional `UPDATE ... RETURNING`: the row only moves
//! to `processing` if it is still `pending` (or a retry-eligible `failed`) at
//! the moment the statement runs, so two workers racing for the same entry
//! cannot both win. Other transitions load the row `FOR UPDATE`, apply the
//! state machine from `clinsync_core::LedgerEntry` and write the result back
//! in the same transaction.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | LedgerError |
//! |-----------------------|-------------|
//! | `23505` (unique violation) on insert | `AlreadyExists` |
//! | any other / pool / network | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use clinsync_core::{
    EntityType, FailureDisposition, FailureKind, LedgerEntry, LedgerEntryId, LedgerStatus,
    RetryPolicy, TargetSystem,
};

use super::store::{ExternalLinks, LedgerError, LedgerStats, LedgerStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_ledger (
        id UUID PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        target_system TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5,
        scheduled_at TIMESTAMPTZ NOT NULL,
        next_retry_at TIMESTAMPTZ NULL,
        error_message TEXT NULL,
        last_error_at TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL,
        processing_started_at TIMESTAMPTZ NULL,
        completed_at TIMESTAMPTZ NULL,
        CONSTRAINT sync_ledger_status_check
            CHECK (status IN ('pending', 'processing', 'done', 'failed')),
        CONSTRAINT sync_ledger_retry_check CHECK (retry_count >= 0 AND max_retries >= 0)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sync_ledger_sweep ON sync_ledger (status, priority, scheduled_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_ledger_entity ON sync_ledger (entity_type, entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_ledger_target ON sync_ledger (target_system, status)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_external_links (
        target_system TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        external_id TEXT NOT NULL,
        linked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (target_system, entity_type, entity_id)
    )
    "#,
];

const COLUMNS: &str = r#"
    id, entity_type, entity_id, operation, target_system, payload, status,
    retry_count, max_retries, priority, scheduled_at, next_retry_at,
    error_message, last_error_at, created_at, processing_started_at, completed_at
"#;

/// Postgres ledger. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger and link tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn lock_row(
        tx: &mut Transaction<'static, Postgres>,
        id: LedgerEntryId,
        operation: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sync_ledger WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or(LedgerError::NotFound(id))?;

        decode(&row)
    }

    /// Persist every mutable column of `entry`.
    async fn write_back(
        tx: &mut Transaction<'static, Postgres>,
        entry: &LedgerEntry,
        operation: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE sync_ledger SET
                status = $2,
                retry_count = $3,
                scheduled_at = $4,
                next_retry_at = $5,
                error_message = $6,
                last_error_at = $7,
                processing_started_at = $8,
                completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.status.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.scheduled_at)
        .bind(entry.next_retry_at)
        .bind(entry.error_message.as_deref())
        .bind(entry.last_error_at)
        .bind(entry.processing_started_at)
        .bind(entry.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    /// Lock one row, run a state transition on it and persist the result.
    async fn transition<T>(
        &self,
        id: LedgerEntryId,
        operation: &str,
        f: impl FnOnce(&mut LedgerEntry) -> Result<(T, bool), LedgerError> + Send,
    ) -> Result<(LedgerEntry, T), LedgerError>
    where
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let mut entry = Self::lock_row(&mut tx, id, operation).await?;
        let (out, changed) = f(&mut entry)?;
        if changed {
            Self::write_back(&mut tx, &entry, operation).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((entry, out))
    }

    async fn fetch_entries(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        operation: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode).collect()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))
    }

    #[instrument(
        skip(self, tx, entry),
        fields(
            entry_id = %entry.id,
            entity_type = %entry.entity_type,
            target_system = %entry.target_system
        ),
        err
    )]
    async fn insert(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO sync_ledger ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#
        ))
        .bind(entry.id.as_uuid())
        .bind(entry.entity_type.as_str())
        .bind(&entry.entity_id)
        .bind(entry.operation.as_str())
        .bind(entry.target_system.as_str())
        .bind(&entry.payload)
        .bind(entry.status.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.max_retries as i32)
        .bind(entry.priority)
        .bind(entry.scheduled_at)
        .bind(entry.next_retry_at)
        .bind(entry.error_message.as_deref())
        .bind(entry.last_error_at)
        .bind(entry.created_at)
        .bind(entry.processing_started_at)
        .bind(entry.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return LedgerError::AlreadyExists(entry.id);
                }
            }
            map_sqlx_error("insert", e)
        })?;
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sync_ledger WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn claim(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_ledger
            SET status = 'processing',
                retry_count = retry_count + 1,
                processing_started_at = $2
            WHERE id = $1
              AND (
                status = 'pending'
                OR (
                    status = 'failed'
                    AND retry_count < max_retries
                    AND next_retry_at IS NOT NULL
                    AND next_retry_at <= $2
                )
              )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(decode).transpose()
    }

    async fn mark_done(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let (entry, _) = self
            .transition(id, "mark_done", |e| {
                let changed = e.complete(now)?;
                Ok(((), changed))
            })
            .await?;
        Ok(entry)
    }

    async fn mark_failed(
        &self,
        id: LedgerEntryId,
        error: &str,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(LedgerEntry, FailureDisposition), LedgerError> {
        self.transition(id, "mark_failed", |e| {
            let disposition = e.fail(error, kind, policy, now)?;
            let changed = disposition != FailureDisposition::AlreadyDone;
            Ok((disposition, changed))
        })
        .await
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM sync_ledger
            WHERE status = 'pending'
            ORDER BY priority ASC, scheduled_at ASC
            LIMIT $1
            "#
        );
        self.fetch_entries(sqlx::query(&sql).bind(limit as i64), "find_pending")
            .await
    }

    async fn find_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM sync_ledger
            WHERE status = 'failed'
              AND retry_count < max_retries
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY priority ASC, scheduled_at ASC
            LIMIT $2
            "#
        );
        self.fetch_entries(
            sqlx::query(&sql).bind(now).bind(limit as i64),
            "find_retry_eligible",
        )
        .await
    }

    async fn find_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM sync_ledger
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY created_at ASC
            "#
        );
        self.fetch_entries(
            sqlx::query(&sql).bind(entity_type.as_str()).bind(entity_id),
            "find_by_entity",
        )
        .await
    }

    async fn list_failed(
        &self,
        target: Option<TargetSystem>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM sync_ledger
            WHERE status = 'failed'
              AND ($1::TEXT IS NULL OR target_system = $1)
            ORDER BY last_error_at DESC NULLS LAST
            LIMIT $2
            "#
        );
        self.fetch_entries(
            sqlx::query(&sql)
                .bind(target.map(|t| t.as_str()))
                .bind(limit as i64),
            "list_failed",
        )
        .await
    }

    async fn reset_to_pending(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let (entry, _) = self
            .transition(id, "reset_to_pending", |e| {
                e.reset_for_retry(now)?;
                Ok(((), true))
            })
            .await?;
        Ok(entry)
    }

    #[instrument(skip(self, policy), err)]
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM sync_ledger
            WHERE status = 'processing' AND processing_started_at < $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = decode(row)?;
            entry.fail("processing timed out", FailureKind::Stale, policy, now)?;
            Self::write_back(&mut tx, &entry, "reclaim_stale").await?;
            reclaimed.push(entry);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;
        Ok(reclaimed)
    }

    async fn purge_done_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result =
            sqlx::query("DELETE FROM sync_ledger WHERE status = 'done' AND completed_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("purge_done_before", e))?;
        Ok(result.rows_affected())
    }

    async fn purge_exhausted_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_ledger
            WHERE status = 'failed'
              AND retry_count >= max_retries
              AND COALESCE(last_error_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_exhausted_before", e))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT status, retry_count >= max_retries AS exhausted, COUNT(*) AS n
            FROM sync_ledger
            GROUP BY 1, 2
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let exhausted: bool = row.try_get("exhausted").map_err(decode_error)?;
            let n = row.try_get::<i64, _>("n").map_err(decode_error)? as u64;
            match status.parse::<LedgerStatus>()? {
                LedgerStatus::Pending => stats.pending += n,
                LedgerStatus::Processing => stats.processing += n,
                LedgerStatus::Done => stats.done += n,
                LedgerStatus::Failed if exhausted => stats.failed_exhausted += n,
                LedgerStatus::Failed => stats.failed_retryable += n,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ExternalLinks for PostgresLedgerStore {
    async fn external_id(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<String>, LedgerError> {
        sqlx::query_scalar(
            r#"
            SELECT external_id FROM sync_external_links
            WHERE target_system = $1 AND entity_type = $2 AND entity_id = $3
            "#,
        )
        .bind(target.as_str())
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("external_id", e))
    }

    async fn link(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
        external_id: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO sync_external_links (target_system, entity_type, entity_id, external_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (target_system, entity_type, entity_id)
            DO UPDATE SET external_id = EXCLUDED.external_id, linked_at = NOW()
            "#,
        )
        .bind(target.as_str())
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("link", e))?;
        Ok(())
    }
}

/// Row shape of `sync_ledger`, before the text columns are parsed.
#[derive(Debug)]
struct LedgerRow {
    id: Uuid,
    entity_type: String,
    entity_id: String,
    operation: String,
    target_system: String,
    payload: JsonValue,
    status: String,
    retry_count: i32,
    max_retries: i32,
    priority: i32,
    scheduled_at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for LedgerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            operation: row.try_get("operation")?,
            target_system: row.try_get("target_system")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
            last_error_at: row.try_get("last_error_at")?,
            created_at: row.try_get("created_at")?,
            processing_started_at: row.try_get("processing_started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(row.id),
            entity_type: row.entity_type.parse()?,
            entity_id: row.entity_id,
            operation: row.operation.parse()?,
            target_system: row.target_system.parse()?,
            payload: row.payload,
            status: row.status.parse()?,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            last_error_at: row.last_error_at,
            created_at: row.created_at,
            processing_started_at: row.processing_started_at,
            completed_at: row.completed_at,
        })
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<LedgerEntry, LedgerError> {
    LedgerRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_error(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(format!("failed to decode ledger row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            LedgerError::Storage(format!(
                "database error in {operation} [{code}]: {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed during {operation}"))
        }
        other => LedgerError::Storage(format!("{operation} failed: {other}")),
    }
}


#[cfg(test)]
mod db_tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use clinsync_core::{NewLedgerEntry, Operation};
    use serde_json::json;

    use crate::test_db::TestDb;
    use crate::workers::{RetentionConfig, RetentionSweeper};

    /// Postgres keeps microseconds.
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    async fn store(db: &TestDb) -> PostgresLedgerStore {
        let store = PostgresLedgerStore::new(db.pool.clone());
        store.ensure_schema().await.unwrap();
        store
    }

    async fn seed(
        store: &PostgresLedgerStore,
        key: &str,
        max_retries: u32,
        at: DateTime<Utc>,
    ) -> LedgerEntryId {
        let entry = LedgerEntry::new(
            NewLedgerEntry::new(
                EntityType::Patient,
                key,
                Operation::Create,
                TargetSystem::FhirServer,
                json!({ "key": key }),
            )
            .with_max_retries(max_retries),
            &RetryPolicy::default(),
            at,
        );
        let mut tx = store.begin().await.unwrap();
        store.insert(&mut tx, &entry).await.unwrap();
        store.commit(tx).await.unwrap();
        entry.id
    }

    async fn fail_at(store: &PostgresLedgerStore, id: LedgerEntryId, at: DateTime<Utc>) {
        store.claim(id, at).await.unwrap().unwrap();
        store
            .mark_failed(id, "HTTP 503", FailureKind::Transient, &RetryPolicy::default(), at)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let store = store(&db).await;
        let id = seed(&store, "P-1", 5, now()).await;

        let mut claims = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            claims.push(tokio::spawn(async move { store.claim(id, now()).await }));
        }
        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Processing);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.processing_started_at.is_some());
        db.drop_schema().await;
    }

    #[tokio::test]
    async fn retry_selection_needs_due_time_and_budget() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let store = store(&db).await;
        let t = now();

        let due = seed(&store, "due", 5, t - Duration::minutes(30)).await;
        fail_at(&store, due, t - Duration::minutes(10)).await;
        let later = seed(&store, "later", 5, t).await;
        fail_at(&store, later, t).await;
        let exhausted = seed(&store, "exhausted", 1, t - Duration::minutes(30)).await;
        fail_at(&store, exhausted, t - Duration::minutes(10)).await;
        let pending = seed(&store, "pending", 5, t).await;

        let eligible: Vec<_> = store
            .find_retry_eligible(t, 50)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let fresh: Vec<_> = store
            .find_pending(100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();

        assert_eq!(eligible, [due]);
        assert_eq!(fresh, [pending]);

        assert!(store.claim(later, t).await.unwrap().is_none());
        assert!(store.claim(exhausted, t).await.unwrap().is_none());
        let reclaimed = store.claim(due, t).await.unwrap().unwrap();
        assert_eq!(reclaimed.retry_count, 2);
        db.drop_schema().await;
    }

    #[tokio::test]
    async fn stale_processing_entries_are_reclaimed() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let store = store(&db).await;
        let t = now();
        let policy = RetryPolicy::default();

        let stuck = seed(&store, "stuck", 5, t - Duration::hours(1)).await;
        store.claim(stuck, t - Duration::minutes(30)).await.unwrap().unwrap();
        let stuck_last = seed(&store, "stuck-last", 1, t - Duration::hours(1)).await;
        store.claim(stuck_last, t - Duration::minutes(30)).await.unwrap().unwrap();
        let busy = seed(&store, "busy", 5, t).await;
        store.claim(busy, t - Duration::minutes(1)).await.unwrap().unwrap();

        let mut reclaimed = store
            .reclaim_stale(t - Duration::minutes(15), &policy, t)
            .await
            .unwrap();
        reclaimed.sort_by_key(|e| e.max_retries);

        let ids: Vec<_> = reclaimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, [stuck_last, stuck]);

        let stuck = store.get(stuck).await.unwrap().unwrap();
        assert_eq!(stuck.status, LedgerStatus::Failed);
        assert_eq!(stuck.next_retry_at, Some(t));
        assert!(stuck.is_retry_eligible(t));

        let stuck_last = store.get(stuck_last).await.unwrap().unwrap();
        assert_eq!(stuck_last.status, LedgerStatus::Failed);
        assert_eq!(stuck_last.next_retry_at, None);
        assert!(stuck_last.is_exhausted());

        let busy = store.get(busy).await.unwrap().unwrap();
        assert_eq!(busy.status, LedgerStatus::Processing);
        db.drop_schema().await;
    }

    #[tokio::test]
    async fn retention_purges_by_age_and_outcome() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let store = store(&db).await;
        let t = now();
        let policy = RetryPolicy::default();

        let done_old = seed(&store, "done-old", 5, t - Duration::days(10)).await;
        store.claim(done_old, t - Duration::days(10)).await.unwrap().unwrap();
        store.mark_done(done_old, t - Duration::days(8)).await.unwrap();

        let done_recent = seed(&store, "done-recent", 5, t - Duration::days(2)).await;
        store.claim(done_recent, t - Duration::days(2)).await.unwrap().unwrap();
        store.mark_done(done_recent, t - Duration::days(1)).await.unwrap();

        let exhausted_old = seed(&store, "exhausted-old", 1, t - Duration::days(100)).await;
        store.claim(exhausted_old, t - Duration::days(100)).await.unwrap().unwrap();
        store
            .mark_failed(exhausted_old, "HTTP 503", FailureKind::Transient, &policy, t - Duration::days(91))
            .await
            .unwrap();

        let exhausted_recent = seed(&store, "exhausted-recent", 1, t - Duration::days(20)).await;
        store.claim(exhausted_recent, t - Duration::days(20)).await.unwrap().unwrap();
        store
            .mark_failed(exhausted_recent, "HTTP 503", FailureKind::Transient, &policy, t - Duration::days(10))
            .await
            .unwrap();

        let retrying_old = seed(&store, "retrying-old", 5, t - Duration::days(100)).await;
        fail_at(&store, retrying_old, t - Duration::days(100)).await;

        let report = RetentionSweeper::new(store.clone(), RetentionConfig::default())
            .purge_once(t)
            .await
            .unwrap();

        assert_eq!(report.done_deleted, 1);
        assert_eq!(report.failed_deleted, 1);
        assert!(store.get(done_old).await.unwrap().is_none());
        assert!(store.get(exhausted_old).await.unwrap().is_none());
        for kept in [done_recent, exhausted_recent, retrying_old] {
            assert!(store.get(kept).await.unwrap().is_some());
        }
        db.drop_schema().await;
    }

    #[tokio::test]
    async fn rolled_back_insert_leaves_no_entry() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let store = store(&db).await;
        let entry = LedgerEntry::new(
            NewLedgerEntry::new(
                EntityType::Order,
                "O-1",
                Operation::Create,
                TargetSystem::LegacyEmr,
                json!({}),
            ),
            &RetryPolicy::default(),
            now(),
        );

        let mut tx = store.begin().await.unwrap();
        store.insert(&mut tx, &entry).await.unwrap();
        store.rollback(tx).await.unwrap();

        assert!(store.get(entry.id).await.unwrap().is_none());
        assert!(store.find_by_entity(EntityType::Order, "O-1").await.unwrap().is_empty());
        db.drop_schema().await;
    }
}
