pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::settlement::models::{Dispute, RetryJob, Settlement, SettlementSchedule, SettlementStatus};

pub use memory::{InMemoryDisputeRepository, InMemoryRetryQueue, InMemoryScheduleRepository, InMemorySettlementRepository};
pub use postgres::{PgDisputeRepository, PgRetryQueue, PgScheduleRepository, PgSettlementRepository};

/// Settlement persistence. Every write goes through `compare_and_swap`.
#[async_trait]
pub trait SettlementRepository: Send + Sync {
    async fn insert(&self, settlement: &Settlement) -> AppResult<()>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Settlement>>;

    /// Replace the stored settlement only if its version still equals
    /// `expected_version`. Returns `false` when another writer got there first.
    /// The caller bumps `settlement.version` before calling.
    async fn compare_and_swap(&self, settlement: &Settlement, expected_version: u64) -> AppResult<bool>;

    /// Newest first
    async fn list_by_user(
        &self,
        user_id: &str,
        status: Option<SettlementStatus>,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<Settlement>>;

    async fn list_by_status(&self, status: SettlementStatus) -> AppResult<Vec<Settlement>>;

    async fn count_by_status(&self, status: SettlementStatus) -> AppResult<u64>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn upsert(&self, schedule: &SettlementSchedule) -> AppResult<()>;

    async fn get(&self, user_id: &str) -> AppResult<Option<SettlementSchedule>>;

    /// Enabled schedules whose `next_scheduled` is at or before `now`
    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<SettlementSchedule>>;

    /// Set only `next_scheduled`, `last_processed` and `updated_at`, leaving the
    /// policy fields as the latest writer left them. Returns `false` when the
    /// user has no schedule.
    async fn record_run(
        &self,
        user_id: &str,
        next_scheduled: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn count_enabled(&self) -> AppResult<u64>;
}

#[async_trait]
pub trait DisputeRepository: Send + Sync {
    async fn insert(&self, dispute: &Dispute) -> AppResult<()>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Dispute>>;
}

/// Durable queue of pending payout retries, at most one job per settlement
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Insert or replace the job for `job.settlement_id`
    async fn enqueue(&self, job: RetryJob) -> AppResult<()>;

    /// Remove and return up to `limit` jobs whose `run_at` has passed.
    /// A claimed job is not handed to any other caller.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> AppResult<Vec<RetryJob>>;

    async fn remove(&self, settlement_id: Uuid) -> AppResult<()>;

    async fn contains(&self, settlement_id: Uuid) -> AppResult<bool>;

    async fn len(&self) -> AppResult<u64>;
}

/// Handles to every store the engine writes to
#[derive(Clone)]
pub struct Stores {
    pub settlements: Arc<dyn SettlementRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub disputes: Arc<dyn DisputeRepository>,
    pub retry_queue: Arc<dyn RetryQueue>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            settlements: Arc::new(InMemorySettlementRepository::new()),
            schedules: Arc::new(InMemoryScheduleRepository::new()),
            disputes: Arc::new(InMemoryDisputeRepository::new()),
            retry_queue: Arc::new(InMemoryRetryQueue::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            settlements: Arc::new(PgSettlementRepository::new(pool.clone())),
            schedules: Arc::new(PgScheduleRepository::new(pool.clone())),
            disputes: Arc::new(PgDisputeRepository::new(pool.clone())),
            retry_queue: Arc::new(PgRetryQueue::new(pool)),
        }
    }
}
