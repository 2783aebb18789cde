use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DisputeRepository, RetryQueue, ScheduleRepository, SettlementRepository};
use crate::error::{AppError, AppResult};
use crate::settlement::models::{Dispute, RetryJob, Settlement, SettlementSchedule, SettlementStatus};

/// Process-local settlement store used by tests and database-less deployments
#[derive(Default)]
pub struct InMemorySettlementRepository {
    settlements: RwLock<HashMap<Uuid, Settlement>>,
}

impl InMemorySettlementRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementRepository for InMemorySettlementRepository {
    async fn insert(&self, settlement: &Settlement) -> AppResult<()> {
        let mut settlements = self.settlements.write().await;
        if settlements.contains_key(&settlement.id) {
            return Err(AppError::InvalidInput(format!(
                "Settlement {} already exists",
                settlement.id
            )));
        }
        settlements.insert(settlement.id, settlement.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Settlement>> {
        let settlements = self.settlements.read().await;
        Ok(settlements.get(&id).cloned())
    }

    async fn compare_and_swap(&self, settlement: &Settlement, expected_version: u64) -> AppResult<bool> {
        let mut settlements = self.settlements.write().await;
        match settlements.get_mut(&settlement.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = settlement.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!(
                "Settlement {} not found",
                settlement.id
            ))),
        }
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        status: Option<SettlementStatus>,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<Settlement>> {
        let settlements = self.settlements.read().await;
        let mut matching: Vec<Settlement> = settlements
            .values()
            .filter(|s| s.user_id == user_id)
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_by_status(&self, status: SettlementStatus) -> AppResult<Vec<Settlement>> {
        let settlements = self.settlements.read().await;
        Ok(settlements
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: SettlementStatus) -> AppResult<u64> {
        let settlements = self.settlements.read().await;
        Ok(settlements.values().filter(|s| s.status == status).count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<String, SettlementSchedule>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn upsert(&self, schedule: &SettlementSchedule) -> AppResult<()> {
        let mut schedules = self.schedules.write().await;
        schedules.insert(schedule.user_id.clone(), schedule.clone());
        Ok(())
    }

    async fn get(&self, user_id: &str) -> AppResult<Option<SettlementSchedule>> {
        let schedules = self.schedules.read().await;
        Ok(schedules.get(user_id).cloned())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<SettlementSchedule>> {
        let schedules = self.schedules.read().await;
        let mut due: Vec<SettlementSchedule> = schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_scheduled.cmp(&b.next_scheduled));
        Ok(due)
    }

    async fn record_run(
        &self,
        user_id: &str,
        next_scheduled: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut schedules = self.schedules.write().await;
        let Some(schedule) = schedules.get_mut(user_id) else {
            return Ok(false);
        };
        schedule.next_scheduled = next_scheduled;
        schedule.last_processed = Some(processed_at);
        schedule.updated_at = processed_at;
        Ok(true)
    }

    async fn count_enabled(&self) -> AppResult<u64> {
        let schedules = self.schedules.read().await;
        Ok(schedules.values().filter(|s| s.enabled).count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryDisputeRepository {
    disputes: RwLock<HashMap<Uuid, Dispute>>,
}

impl InMemoryDisputeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DisputeRepository for InMemoryDisputeRepository {
    async fn insert(&self, dispute: &Dispute) -> AppResult<()> {
        let mut disputes = self.disputes.write().await;
        disputes.insert(dispute.id, dispute.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Dispute>> {
        let disputes = self.disputes.read().await;
        Ok(disputes.get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryRetryQueue {
    jobs: RwLock<HashMap<Uuid, RetryJob>>,
}

impl InMemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn enqueue(&self, job: RetryJob) -> AppResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.settlement_id, job);
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> AppResult<Vec<RetryJob>> {
        let mut jobs = self.jobs.write().await;
        let mut due: Vec<RetryJob> = jobs.values().filter(|j| j.run_at <= now).cloned().collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at));
        due.truncate(limit);
        for job in &due {
            jobs.remove(&job.settlement_id);
        }
        Ok(due)
    }

    async fn remove(&self, settlement_id: Uuid) -> AppResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&settlement_id);
        Ok(())
    }

    async fn contains(&self, settlement_id: Uuid) -> AppResult<bool> {
        let jobs = self.jobs.read().await;
        Ok(jobs.contains_key(&settlement_id))
    }

    async fn len(&self) -> AppResult<u64> {
        let jobs = self.jobs.read().await;
        Ok(jobs.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::fixtures;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let repo = InMemorySettlementRepository::new();
        let mut settlement = fixtures::settlement("user-1", SettlementStatus::Pending);
        repo.insert(&settlement).await.unwrap();

        let mut first = settlement.clone();
        first.status = SettlementStatus::Processing;
        first.version = 1;
        assert!(repo.compare_and_swap(&first, 0).await.unwrap());

        settlement.status = SettlementStatus::Cancelled;
        settlement.version = 1;
        assert!(!repo.compare_and_swap(&settlement, 0).await.unwrap());

        let stored = repo.get(settlement.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Processing);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = InMemorySettlementRepository::new();
        let settlement = fixtures::settlement("user-1", SettlementStatus::Pending);
        repo.insert(&settlement).await.unwrap();
        assert!(repo.insert(&settlement).await.is_err());
    }

    #[tokio::test]
    async fn test_list_by_user_newest_first_with_paging() {
        let repo = InMemorySettlementRepository::new();
        let base = Utc::now();
        for i in 0..5 {
            let mut settlement = fixtures::settlement("user-1", SettlementStatus::Pending);
            settlement.created_at = base + Duration::minutes(i);
            repo.insert(&settlement).await.unwrap();
        }
        repo.insert(&fixtures::settlement("user-2", SettlementStatus::Pending))
            .await
            .unwrap();

        let page = repo.list_by_user("user-1", None, 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].created_at, base + Duration::minutes(3));
        assert_eq!(page[1].created_at, base + Duration::minutes(2));

        let failed = repo
            .list_by_user("user-1", Some(SettlementStatus::Failed), 50, 0)
            .await
            .unwrap();
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_retry_queue_claims_each_job_once() {
        let queue = InMemoryRetryQueue::new();
        let now = Utc::now();
        let due = Uuid::new_v4();
        let later = Uuid::new_v4();

        queue
            .enqueue(RetryJob {
                settlement_id: due,
                attempt: 1,
                run_at: now - Duration::seconds(1),
                enqueued_at: now,
            })
            .await
            .unwrap();
        queue
            .enqueue(RetryJob {
                settlement_id: later,
                attempt: 1,
                run_at: now + Duration::minutes(5),
                enqueued_at: now,
            })
            .await
            .unwrap();

        let claimed = queue.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].settlement_id, due);
        assert!(queue.claim_due(now, 10).await.unwrap().is_empty());
        assert!(queue.contains(later).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schedule_list_due_skips_disabled() {
        let repo = InMemoryScheduleRepository::new();
        let now = Utc::now();

        let mut enabled = fixtures::schedule("user-1", now - Duration::minutes(1));
        enabled.enabled = true;
        let mut disabled = fixtures::schedule("user-2", now - Duration::minutes(1));
        disabled.enabled = false;
        let future = fixtures::schedule("user-3", now + Duration::hours(1));

        repo.upsert(&enabled).await.unwrap();
        repo.upsert(&disabled).await.unwrap();
        repo.upsert(&future).await.unwrap();

        let due = repo.list_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].user_id, "user-1");
        assert_eq!(repo.count_enabled().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_run_keeps_policy_fields() {
        let repo = InMemoryScheduleRepository::new();
        let now = Utc::now();

        let mut schedule = fixtures::schedule("user-1", now - Duration::minutes(1));
        schedule.enabled = false;
        schedule.minimum_amount = dec!(5000);
        repo.upsert(&schedule).await.unwrap();

        let next = now + Duration::days(1);
        assert!(repo.record_run("user-1", next, now).await.unwrap());
        assert!(!repo.record_run("user-2", next, now).await.unwrap());

        let stored = repo.get("user-1").await.unwrap().unwrap();
        assert_eq!(stored.next_scheduled, next);
        assert_eq!(stored.last_processed, Some(now));
        assert!(!stored.enabled);
        assert_eq!(stored.minimum_amount, dec!(5000));
    }
}
