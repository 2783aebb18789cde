use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::AppResult;
use crate::settlement::models::{RetryJob, SettlementStatus};
use crate::settlement::orchestrator::SettlementOrchestrator;
use crate::storage::{RetryQueue, SettlementRepository};

/// Linear backoff: the n-th retry waits `n * base_delay`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: chrono::Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: chrono::Duration::seconds(config.base_delay_secs as i64),
        }
    }

    pub fn delay_for(&self, retry_count: u32) -> chrono::Duration {
        self.base_delay * retry_count as i32
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }

    /// When the next automatic attempt should run, or `None` once attempts are exhausted
    pub fn next_retry_at(&self, retry_count: u32, failed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.can_retry(retry_count)
            .then(|| failed_at + self.delay_for(retry_count))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

const CLAIM_BATCH: usize = 32;
const RETRY_CONCURRENCY: usize = 4;
/// A PROCESSING settlement older than this many external-call timeouts has no live attempt
const STALL_TIMEOUT_MULTIPLE: i64 = 4;

/// Drains the durable retry queue and re-drives failed payouts
pub struct RetryWorker {
    orchestrator: Arc<SettlementOrchestrator>,
    queue: Arc<dyn RetryQueue>,
    settlements: Arc<dyn SettlementRepository>,
    policy: RetryPolicy,
    poll_interval: Duration,
    stall_after: chrono::Duration,
}

impl RetryWorker {
    pub fn new(
        orchestrator: Arc<SettlementOrchestrator>,
        queue: Arc<dyn RetryQueue>,
        settlements: Arc<dyn SettlementRepository>,
        policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Self {
        let call_timeout_ms = i64::try_from(orchestrator.call_timeout().as_millis()).unwrap_or(i64::MAX);
        let stall_after = chrono::Duration::milliseconds(call_timeout_ms.saturating_mul(STALL_TIMEOUT_MULTIPLE));
        Self {
            orchestrator,
            queue,
            settlements,
            policy,
            poll_interval,
            stall_after,
        }
    }

    /// Start polling the queue (runs in background)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.recover(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("🔁 Re-enqueued {} orphaned retries", count),
                Err(e) => error!("❌ Retry recovery failed: {}", e),
            }

            let mut ticker = interval(self.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stalled(Utc::now()).await {
                    error!("❌ Stalled settlement sweep failed: {}", e);
                }
                if let Err(e) = self.run_due(Utc::now()).await {
                    error!("❌ Retry queue poll failed: {}", e);
                }
            }
        })
    }

    /// Run every job due at `now`. Returns how many jobs were claimed.
    pub async fn run_due(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let jobs = self.queue.claim_due(now, CLAIM_BATCH).await?;
        let claimed = jobs.len();
        if claimed == 0 {
            return Ok(0);
        }

        info!("🔁 Running {} due payout retries", claimed);

        stream::iter(jobs)
            .for_each_concurrent(RETRY_CONCURRENCY, |job| async move {
                match self.orchestrator.retry_settlement(job.settlement_id).await {
                    Ok(settlement) => info!(
                        "✅ Retry {} for settlement {} finished as {}",
                        job.attempt, settlement.id, settlement.status
                    ),
                    Err(e) => warn!(
                        "⚠️ Retry {} for settlement {} did not complete: {}",
                        job.attempt, job.settlement_id, e
                    ),
                }
            })
            .await;

        Ok(claimed)
    }

    /// Re-enqueue FAILED settlements that expect a retry but have no queued job,
    /// e.g. after a crash between the FAILED write and the enqueue.
    pub async fn recover(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let failed = self.settlements.list_by_status(SettlementStatus::Failed).await?;
        let mut recovered = 0;

        for settlement in failed {
            let Some(run_at) = settlement.processing.next_retry_at else {
                continue;
            };
            if !self.policy.can_retry(settlement.processing.retry_count)
                || self.queue.contains(settlement.id).await?
            {
                continue;
            }

            self.queue
                .enqueue(RetryJob {
                    settlement_id: settlement.id,
                    attempt: settlement.processing.retry_count,
                    run_at,
                    enqueued_at: now,
                })
                .await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Move PROCESSING settlements whose attempt outlived `stall_after` to FAILED,
    /// queueing a retry when attempts remain. Covers a crash or an aborted task
    /// between the PROCESSING write and the outcome write.
    pub async fn sweep_stalled(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let cutoff = now - self.stall_after;
        let processing = self.settlements.list_by_status(SettlementStatus::Processing).await?;
        let mut swept = 0;

        for settlement in processing {
            let started = settlement.processing.initiated_at.unwrap_or(settlement.updated_at);
            if started > cutoff {
                continue;
            }

            match self.orchestrator.fail_stalled(settlement.id, cutoff).await {
                Ok(updated) => {
                    swept += 1;
                    warn!(
                        "⚠️ Settlement {} stalled in PROCESSING since {}; now {} (attempt {})",
                        updated.id, started, updated.status, updated.processing.retry_count
                    );
                }
                // Finished or re-driven since the listing
                Err(e) => debug!("Skipping stalled candidate {}: {}", settlement.id, e),
            }
        }

        Ok(swept)
    }
}
