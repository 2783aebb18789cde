use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult, SettlementError};
use crate::settlement::fees::checked_sum;
use crate::settlement::models::{HealthReport, Settlement, SettlementStats, SettlementStatus};
use crate::storage::{RetryQueue, ScheduleRepository, SettlementRepository, Stores};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementQuery {
    pub status: Option<SettlementStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Read-only views over the stores
pub struct QueryService {
    settlements: Arc<dyn SettlementRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    retry_queue: Arc<dyn RetryQueue>,
}

impl QueryService {
    pub fn new(stores: &Stores) -> Self {
        Self {
            settlements: stores.settlements.clone(),
            schedules: stores.schedules.clone(),
            retry_queue: stores.retry_queue.clone(),
        }
    }

    pub async fn get_settlement(&self, id: Uuid) -> AppResult<Settlement> {
        self.settlements
            .get(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(id).into())
    }

    /// Newest first
    pub async fn get_user_settlements(&self, user_id: &str, query: SettlementQuery) -> AppResult<Vec<Settlement>> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(AppError::InvalidInput(format!(
                "limit must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, limit
            )));
        }
        self.settlements
            .list_by_user(user_id, query.status, limit, query.offset.unwrap_or(0))
            .await
    }

    /// Totals across every settlement the user has; `total_amount` sums net amounts
    pub async fn get_settlement_stats(&self, user_id: &str) -> AppResult<SettlementStats> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .settlements
                .list_by_user(user_id, None, MAX_PAGE_SIZE, offset)
                .await?;
            let fetched = page.len();
            all.extend(page);
            if fetched < MAX_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        let count = |status: SettlementStatus| all.iter().filter(|s| s.status == status).count() as u64;

        Ok(SettlementStats {
            total_settlements: all.len() as u64,
            total_amount: checked_sum(all.iter().map(|s| s.net_amount), "settlement total")?,
            completed_settlements: count(SettlementStatus::Completed),
            pending_settlements: count(SettlementStatus::Pending),
            failed_settlements: count(SettlementStatus::Failed),
        })
    }

    pub async fn health_check(&self) -> AppResult<HealthReport> {
        Ok(HealthReport {
            active_settlements: self.settlements.count_by_status(SettlementStatus::Processing).await?,
            pending_settlements: self.settlements.count_by_status(SettlementStatus::Pending).await?,
            scheduled_users: self.schedules.count_enabled().await?,
            pending_retries: self.retry_queue.len().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::fixtures;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn seeded() -> (QueryService, Stores) {
        let stores = Stores::in_memory();
        for status in [
            SettlementStatus::Completed,
            SettlementStatus::Completed,
            SettlementStatus::Pending,
            SettlementStatus::Failed,
            SettlementStatus::Processing,
        ] {
            stores
                .settlements
                .insert(&fixtures::settlement("creator-1", status))
                .await
                .unwrap();
        }
        stores
            .settlements
            .insert(&fixtures::settlement("creator-2", SettlementStatus::Pending))
            .await
            .unwrap();
        (QueryService::new(&stores), stores)
    }

    #[tokio::test]
    async fn test_stats_per_user() {
        let (queries, _) = seeded().await;
        let stats = queries.get_settlement_stats("creator-1").await.unwrap();

        assert_eq!(stats.total_settlements, 5);
        assert_eq!(stats.completed_settlements, 2);
        assert_eq!(stats.pending_settlements, 1);
        assert_eq!(stats.failed_settlements, 1);
        assert_eq!(stats.total_amount, dec!(76234) * dec!(5));

        let empty = queries.get_settlement_stats("nobody").await.unwrap();
        assert_eq!(empty, SettlementStats::default());
    }

    #[tokio::test]
    async fn test_health_counts() {
        let (queries, stores) = seeded().await;
        stores
            .schedules
            .upsert(&fixtures::schedule("creator-1", Utc::now()))
            .await
            .unwrap();

        let health = queries.health_check().await.unwrap();
        assert_eq!(health.active_settlements, 1);
        assert_eq!(health.pending_settlements, 2);
        assert_eq!(health.scheduled_users, 1);
        assert_eq!(health.pending_retries, 0);
    }

    #[tokio::test]
    async fn test_user_settlements_filter_and_limits() {
        let (queries, _) = seeded().await;

        let completed = queries
            .get_user_settlements(
                "creator-1",
                SettlementQuery {
                    status: Some(SettlementStatus::Completed),
                    limit: None,
                    offset: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.len(), 2);

        let too_big = queries
            .get_user_settlements(
                "creator-1",
                SettlementQuery {
                    status: None,
                    limit: Some(MAX_PAGE_SIZE + 1),
                    offset: None,
                },
            )
            .await;
        assert!(matches!(too_big, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_missing_settlement_not_found() {
        let (queries, _) = seeded().await;
        assert!(matches!(
            queries.get_settlement(Uuid::new_v4()).await,
            Err(AppError::Settlement(SettlementError::NotFound(_)))
        ));
    }
}
