use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DisputeRepository, RetryQueue, ScheduleRepository, SettlementRepository};
use crate::error::{AppError, AppResult};
use crate::settlement::models::{Dispute, RetryJob, Settlement, SettlementSchedule, SettlementStatus};

// Rows keep the full document as JSONB next to the columns the queries filter on.

fn to_i64(value: u64, what: &str) -> AppResult<i64> {
    i64::try_from(value).map_err(|_| AppError::InvalidInput(format!("{} out of range: {}", what, value)))
}

fn document<T: DeserializeOwned>(row: &PgRow) -> AppResult<T> {
    let Json(value) = row.try_get::<Json<T>, _>("document")?;
    Ok(value)
}

pub struct PgSettlementRepository {
    pool: PgPool,
}

impl PgSettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementRepository for PgSettlementRepository {
    async fn insert(&self, settlement: &Settlement) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlements (id, user_id, status, version, created_at, updated_at, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(settlement.id)
        .bind(&settlement.user_id)
        .bind(settlement.status.as_str())
        .bind(to_i64(settlement.version, "version")?)
        .bind(settlement.created_at)
        .bind(settlement.updated_at)
        .bind(Json(settlement))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Settlement>> {
        let row = sqlx::query("SELECT document FROM settlements WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(document).transpose()
    }

    async fn compare_and_swap(&self, settlement: &Settlement, expected_version: u64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlements
            SET status = $3, version = $4, updated_at = $5, document = $6
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(settlement.id)
        .bind(to_i64(expected_version, "version")?)
        .bind(settlement.status.as_str())
        .bind(to_i64(settlement.version, "version")?)
        .bind(settlement.updated_at)
        .bind(Json(settlement))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM settlements WHERE id = $1")
            .bind(settlement.id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("Settlement {} not found", settlement.id))),
        }
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        status: Option<SettlementStatus>,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<Settlement>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM settlements
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .bind(to_i64(limit as u64, "limit")?)
        .bind(to_i64(offset as u64, "offset")?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document).collect()
    }

    async fn list_by_status(&self, status: SettlementStatus) -> AppResult<Vec<Settlement>> {
        let rows = sqlx::query("SELECT document FROM settlements WHERE status = $1")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(document).collect()
    }

    async fn count_by_status(&self, status: SettlementStatus) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settlements WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

pub struct PgScheduleRepository {
    pool: PgPool,
}

impl PgScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for PgScheduleRepository {
    async fn upsert(&self, schedule: &SettlementSchedule) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_schedules (user_id, enabled, next_scheduled, document)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET enabled = EXCLUDED.enabled,
                next_scheduled = EXCLUDED.next_scheduled,
                document = EXCLUDED.document
            "#,
        )
        .bind(&schedule.user_id)
        .bind(schedule.enabled)
        .bind(schedule.next_scheduled)
        .bind(Json(schedule))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, user_id: &str) -> AppResult<Option<SettlementSchedule>> {
        let row = sqlx::query("SELECT document FROM settlement_schedules WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(document).transpose()
    }

    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<SettlementSchedule>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM settlement_schedules
            WHERE enabled AND next_scheduled <= $1
            ORDER BY next_scheduled
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document).collect()
    }

    async fn record_run(
        &self,
        user_id: &str,
        next_scheduled: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_schedules
            SET next_scheduled = $2,
                document = document || jsonb_build_object(
                    'nextScheduled', $3::text,
                    'lastProcessed', $4::text,
                    'updatedAt', $4::text
                )
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(next_scheduled)
        .bind(next_scheduled.to_rfc3339())
        .bind(processed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_enabled(&self) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settlement_schedules WHERE enabled")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

pub struct PgDisputeRepository {
    pool: PgPool,
}

impl PgDisputeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DisputeRepository for PgDisputeRepository {
    async fn insert(&self, dispute: &Dispute) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_disputes (id, settlement_id, created_at, document)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(dispute.id)
        .bind(dispute.settlement_id)
        .bind(dispute.created_at)
        .bind(Json(dispute))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Dispute>> {
        let row = sqlx::query("SELECT document FROM settlement_disputes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(document).transpose()
    }
}

pub struct PgRetryQueue {
    pool: PgPool,
}

impl PgRetryQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryQueue for PgRetryQueue {
    async fn enqueue(&self, job: RetryJob) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_retry_jobs (settlement_id, attempt, run_at, enqueued_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (settlement_id) DO UPDATE
            SET attempt = EXCLUDED.attempt,
                run_at = EXCLUDED.run_at,
                enqueued_at = EXCLUDED.enqueued_at
            "#,
        )
        .bind(job.settlement_id)
        .bind(job.attempt as i32)
        .bind(job.run_at)
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> AppResult<Vec<RetryJob>> {
        // SKIP LOCKED lets several workers drain the queue without handing out a job twice
        let rows = sqlx::query(
            r#"
            DELETE FROM settlement_retry_jobs
            WHERE settlement_id IN (
                SELECT settlement_id FROM settlement_retry_jobs
                WHERE run_at <= $1
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING settlement_id, attempt, run_at, enqueued_at
            "#,
        )
        .bind(now)
        .bind(to_i64(limit as u64, "limit")?)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(RetryJob {
                settlement_id: row.try_get("settlement_id")?,
                attempt: row.try_get::<i32, _>("attempt")?.max(0) as u32,
                run_at: row.try_get("run_at")?,
                enqueued_at: row.try_get("enqueued_at")?,
            });
        }
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at));

        Ok(jobs)
    }

    async fn remove(&self, settlement_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM settlement_retry_jobs WHERE settlement_id = $1")
            .bind(settlement_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn contains(&self, settlement_id: Uuid) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 FROM settlement_retry_jobs WHERE settlement_id = $1")
            .bind(settlement_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn len(&self) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settlement_retry_jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}
