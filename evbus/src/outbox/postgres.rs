//! Postgres Outbox 存储（`infra-sqlx`）
//!
//! 记录保存在 `evbus_outbox` 表中；认领使用 `FOR UPDATE SKIP LOCKED`，
//! 多个工作者实例并发轮询时不会认领到同一条记录。
//!
use super::{DispatchRecord, OutboxStore, OutboxTransaction, RecordStatus};
use crate::contract::Event;
use crate::error::{BusError, BusResult};
use crate::outbox::record::after;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS evbus_outbox (
    event_id        UUID PRIMARY KEY,
    type_tag        TEXT        NOT NULL,
    event           JSONB       NOT NULL,
    status          TEXT        NOT NULL,
    attempt_count   INTEGER     NOT NULL DEFAULT 0,
    last_error      TEXT,
    next_attempt_at TIMESTAMPTZ,
    claimed_until   TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS evbus_outbox_due_idx
    ON evbus_outbox (status, next_attempt_at)
    WHERE status IN ('pending', 'failed');
"#;

const INSERT: &str = r#"
INSERT INTO evbus_outbox (
    event_id, type_tag, event, status, attempt_count,
    last_error, next_attempt_at, claimed_until, created_at, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const COLUMNS: &str = "event, status, attempt_count, last_error, next_attempt_at, \
                       claimed_until, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 创建表与索引（幂等）
    pub async fn migrate(&self) -> BusResult<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        Ok(())
    }

    /// 在业务事务中写入记录
    pub async fn stage_in(
        tx: &mut Transaction<'_, Postgres>,
        record: &DispatchRecord,
    ) -> BusResult<()> {
        insert(record).execute(&mut **tx).await.map_err(map_insert)?;
        Ok(())
    }

    async fn set_status(
        &self,
        event_id: Uuid,
        status: RecordStatus,
        attempts: u32,
        error: Option<&str>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> BusResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE evbus_outbox
            SET status = $2,
                attempt_count = $3,
                last_error = COALESCE($4, last_error),
                next_attempt_at = $5,
                claimed_until = NULL,
                updated_at = now()
            WHERE event_id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(attempts_to_db(attempts))
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.rejection(event_id, Utc::now()).await?);
        }
        Ok(())
    }

    /// 条件更新未命中时，根据当前行说明原因
    async fn rejection(&self, event_id: Uuid, now: DateTime<Utc>) -> BusResult<BusError> {
        let Some(record) = self.get(event_id).await? else {
            return Ok(BusError::RecordNotFound { event_id });
        };
        if let Err(settled) = record.ensure_open() {
            return Ok(settled);
        }
        Ok(match record.leased_until(now) {
            Some(until) => BusError::RecordLeased { event_id, until },
            None => BusError::Outbox {
                reason: format!("record changed concurrently: event={event_id}"),
            },
        })
    }
}

fn insert(
    record: &DispatchRecord,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(INSERT)
        .bind(record.event_id())
        .bind(record.event().type_tag())
        .bind(sqlx::types::Json(record.event()))
        .bind(record.status().as_str())
        .bind(attempts_to_db(record.attempt_count()))
        .bind(record.last_error())
        .bind(record.next_attempt_at())
        .bind(record.claimed_until())
        .bind(record.created_at())
        .bind(record.updated_at())
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_insert(err: sqlx::Error) -> BusError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => BusError::Outbox {
            reason: format!("record already exists: {}", db.message()),
        },
        _ => err.into(),
    }
}

struct RecordRow(DispatchRecord);

impl<'r> FromRow<'r, PgRow> for RecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let sqlx::types::Json(event): sqlx::types::Json<Event> = row.try_get("event")?;
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<RecordStatus>()
            .map_err(|reason| sqlx::Error::Decode(reason.into()))?;
        let attempts: i32 = row.try_get("attempt_count")?;

        let record = DispatchRecord::builder()
            .event(event)
            .status(status)
            .attempt_count(u32::try_from(attempts).unwrap_or(0))
            .maybe_last_error(row.try_get("last_error")?)
            .maybe_next_attempt_at(row.try_get("next_attempt_at")?)
            .maybe_claimed_until(row.try_get("claimed_until")?)
            .created_at(row.try_get("created_at")?)
            .updated_at(row.try_get("updated_at")?)
            .build();
        Ok(RecordRow(record))
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn append(&self, record: DispatchRecord) -> BusResult<()> {
        insert(&record)
            .execute(&self.pool)
            .await
            .map_err(map_insert)?;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: usize,
        lease: Duration,
    ) -> BusResult<Vec<DispatchRecord>> {
        let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
        let pending_before = now
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let claimed_until = after(now, lease);

        let sql = format!(
            r#"
            UPDATE evbus_outbox AS o
            SET claimed_until = $4
            FROM (
                SELECT event_id
                FROM evbus_outbox
                WHERE (claimed_until IS NULL OR claimed_until <= $1)
                  AND (
                        (status = 'pending' AND created_at <= $2)
                     OR (status = 'failed' AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
                  )
                ORDER BY event_id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ) AS due
            WHERE o.event_id = due.event_id
            RETURNING {COLUMNS}
            "#
        );

        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(pending_before)
            .bind(limit_to_db(limit))
            .bind(claimed_until)
            .fetch_all(&self.pool)
            .await?;

        let mut records: Vec<DispatchRecord> = rows.into_iter().map(|r| r.0).collect();
        records.sort_by_key(|r| r.event_id());
        Ok(records)
    }

    async fn claim(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> BusResult<DispatchRecord> {
        let sql = format!(
            r#"
            UPDATE evbus_outbox
            SET claimed_until = $3
            WHERE event_id = $1
              AND status IN ('pending', 'failed')
              AND (claimed_until IS NULL OR claimed_until <= $2)
            RETURNING {COLUMNS}
            "#
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .bind(now)
            .bind(after(now, lease))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.0),
            None => Err(self.rejection(event_id, now).await?),
        }
    }

    async fn mark_dispatched(&self, event_id: Uuid, attempts: u32) -> BusResult<()> {
        self.set_status(event_id, RecordStatus::Dispatched, attempts, None, None)
            .await
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> BusResult<()> {
        self.set_status(
            event_id,
            RecordStatus::Failed,
            attempts,
            Some(error),
            Some(next_attempt_at),
        )
        .await
    }

    async fn mark_dead_lettered(
        &self,
        event_id: Uuid,
        attempts: u32,
        error: &str,
    ) -> BusResult<()> {
        self.set_status(
            event_id,
            RecordStatus::DeadLettered,
            attempts,
            Some(error),
            None,
        )
        .await
    }

    async fn get(&self, event_id: Uuid) -> BusResult<Option<DispatchRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM evbus_outbox WHERE event_id = $1");
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn dead_letters(&self, limit: usize) -> BusResult<Vec<DispatchRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM evbus_outbox WHERE status = 'dead_lettered' \
             ORDER BY created_at, event_id LIMIT $1"
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn requeue(&self, event_id: Uuid) -> BusResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE evbus_outbox
            SET status = 'failed',
                attempt_count = 0,
                next_attempt_at = now(),
                claimed_until = NULL,
                updated_at = now()
            WHERE event_id = $1 AND status = 'dead_lettered'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return match self.get(event_id).await? {
                None => Err(BusError::RecordNotFound { event_id }),
                Some(record) => Err(BusError::Outbox {
                    reason: format!(
                        "only dead-lettered records can be requeued: event={event_id}, status={}",
                        record.status()
                    ),
                }),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl<'c> OutboxTransaction for Transaction<'c, Postgres> {
    async fn stage(&mut self, record: &DispatchRecord) -> BusResult<()> {
        PgOutboxStore::stage_in(self, record).await
    }
}
