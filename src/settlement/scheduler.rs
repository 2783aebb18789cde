// Settlement Scheduler - drives recurring per-user settlements
//
// One periodic driver per process:
// - Every tick collects the schedules that are due
// - Users are settled on a bounded worker pool so one slow payout cannot stall the rest
// - A user already being settled is skipped until the next tick
// - nextScheduled always advances, whatever happened to the user

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{Collaborators, LedgerClient};
use crate::config::SchedulerConfig;
use crate::error::{AppError, AppResult};
use crate::settlement::events::{publish_logged, EventPublisher, SettlementEvent};
use crate::settlement::fees::checked_sum;
use crate::settlement::models::{PeriodType, SettlementPeriod, SettlementSchedule, SettlementStatus};
use crate::settlement::orchestrator::{with_timeout, CreateSettlementRequest, SettlementOrchestrator};
use crate::settlement::schedule::{
    validate_day_of_month, validate_day_of_week, ScheduleClock, DEFAULT_DAY_OF_MONTH, DEFAULT_DAY_OF_WEEK,
};
use crate::storage::{ScheduleRepository, Stores};

pub const SCHEDULER_ACTOR: &str = "scheduler";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertScheduleRequest {
    pub period: PeriodType,
    pub day_of_week: Option<u32>,
    pub day_of_month: Option<u32>,
    #[serde(default)]
    pub auto_process: bool,
    pub minimum_amount: Option<Decimal>,
    pub enabled: Option<bool>,
}

/// What one tick did for one user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    NoTransactions,
    BelowMinimum { total: Decimal, minimum: Decimal },
    Created { settlement_id: Uuid },
    Processed { settlement_id: Uuid, status: SettlementStatus },
    ProcessingFailed { settlement_id: Uuid, error: String },
    Failed { error: String },
    /// Another worker still holds this user
    Busy,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub outcomes: Vec<(String, TickOutcome)>,
}

impl TickReport {
    pub fn outcome_for(&self, user_id: &str) -> Option<&TickOutcome> {
        self.outcomes
            .iter()
            .find(|(user, _)| user == user_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Marks a user as in flight until dropped
struct InFlightGuard {
    users: Arc<Mutex<HashSet<String>>>,
    user_id: String,
}

impl InFlightGuard {
    fn acquire(users: &Arc<Mutex<HashSet<String>>>, user_id: &str) -> Option<Self> {
        if !users.lock().insert(user_id.to_string()) {
            return None;
        }
        Some(Self {
            users: users.clone(),
            user_id: user_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.users.lock().remove(&self.user_id);
    }
}

/// Settlement scheduler - turns due schedules into settlements
pub struct SettlementScheduler {
    orchestrator: Arc<SettlementOrchestrator>,
    schedules: Arc<dyn ScheduleRepository>,
    ledger: Arc<dyn LedgerClient>,
    events: Arc<dyn EventPublisher>,
    clock: ScheduleClock,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SettlementScheduler {
    pub fn new(
        orchestrator: Arc<SettlementOrchestrator>,
        stores: &Stores,
        collaborators: &Collaborators,
        config: SchedulerConfig,
    ) -> AppResult<Self> {
        let clock = ScheduleClock::new(config.timezone()?, config.run_hour);
        Ok(Self {
            orchestrator,
            schedules: stores.schedules.clone(),
            ledger: collaborators.ledger.clone(),
            events: collaborators.events.clone(),
            clock,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Start the settlement scheduler (runs in background)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.tick_interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_tick(Utc::now()).await {
                    error!("❌ Settlement tick failed: {}", e);
                }
            }
        })
    }

    /// Settle every user whose schedule is due at `now`
    pub async fn run_tick(&self, now: DateTime<Utc>) -> AppResult<TickReport> {
        let due = self.schedules.list_due(now).await?;
        if due.is_empty() {
            return Ok(TickReport::default());
        }

        info!("🔄 Starting settlement tick for {} users", due.len());

        let outcomes: Vec<(String, TickOutcome)> = stream::iter(due)
            .map(|schedule| self.run_for_user(schedule, now))
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        info!("✓ Settlement tick completed ({} users)", outcomes.len());
        Ok(TickReport { outcomes })
    }

    async fn run_for_user(&self, schedule: SettlementSchedule, now: DateTime<Utc>) -> (String, TickOutcome) {
        let user_id = schedule.user_id.clone();
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &user_id) else {
            warn!("⏭️ Settlement for {} still running, skipping this tick", user_id);
            return (user_id, TickOutcome::Busy);
        };

        let outcome = match self.settle_user(&schedule, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("❌ Scheduled settlement for {} failed: {}", user_id, e);
                TickOutcome::Failed { error: e.to_string() }
            }
        };

        if let Err(e) = self.advance(&user_id, now).await {
            error!("❌ Could not advance schedule for {}: {}", user_id, e);
        }

        (user_id, outcome)
    }

    async fn settle_user(&self, schedule: &SettlementSchedule, now: DateTime<Utc>) -> AppResult<TickOutcome> {
        let start = self
            .clock
            .period_start(schedule.period, schedule.day_of_month, now)?;
        let period = SettlementPeriod::new(schedule.period, start, now)?;

        let transactions = with_timeout(
            self.orchestrator.call_timeout(),
            "ledger query",
            self.ledger.collect_transactions(&schedule.user_id, &period),
        )
        .await?;

        if transactions.is_empty() {
            info!("No transactions for {} in {} - {}", schedule.user_id, start, now);
            return Ok(TickOutcome::NoTransactions);
        }

        let total = checked_sum(transactions.iter().map(|t| t.amount), "period total")?;
        if total < schedule.minimum_amount {
            info!(
                "Period total {} for {} is below minimum {}, rolling over",
                total, schedule.user_id, schedule.minimum_amount
            );
            return Ok(TickOutcome::BelowMinimum {
                total,
                minimum: schedule.minimum_amount,
            });
        }

        let settlement = self
            .orchestrator
            .create_settlement(CreateSettlementRequest {
                user_id: schedule.user_id.clone(),
                user_type: None,
                period_type: schedule.period,
                start_date: start,
                end_date: now,
                transactions: Some(transactions),
                created_by: SCHEDULER_ACTOR.to_string(),
            })
            .await?;

        if !schedule.auto_process {
            return Ok(TickOutcome::Created {
                settlement_id: settlement.id,
            });
        }

        match self
            .orchestrator
            .process_settlement(settlement.id, None, Some(SCHEDULER_ACTOR.to_string()))
            .await
        {
            Ok(processed) => Ok(TickOutcome::Processed {
                settlement_id: processed.id,
                status: processed.status,
            }),
            // The failure is recorded on the settlement and retried from the queue
            Err(e) => Ok(TickOutcome::ProcessingFailed {
                settlement_id: settlement.id,
                error: e.to_string(),
            }),
        }
    }

    async fn advance(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let Some(current) = self.schedules.get(user_id).await? else {
            return Ok(());
        };

        let next_scheduled =
            self.clock
                .next_run(current.period, current.day_of_week, current.day_of_month, now)?;
        // Policy edits that land meanwhile are kept; only run bookkeeping is written
        if !self.schedules.record_run(user_id, next_scheduled, now).await? {
            debug!("Schedule for {} removed before it could advance", user_id);
        }
        Ok(())
    }

    /// Create or replace the user's schedule
    pub async fn upsert_schedule(&self, user_id: &str, request: UpsertScheduleRequest) -> AppResult<SettlementSchedule> {
        if request.period == PeriodType::Custom {
            return Err(AppError::InvalidInput(
                "Schedules support daily, weekly or monthly periods".to_string(),
            ));
        }
        let day_of_week = validate_day_of_week(request.day_of_week.unwrap_or(DEFAULT_DAY_OF_WEEK))?;
        let day_of_month = validate_day_of_month(request.day_of_month.unwrap_or(DEFAULT_DAY_OF_MONTH))?;
        let minimum_amount = request.minimum_amount.unwrap_or(Decimal::ZERO);
        if minimum_amount < Decimal::ZERO {
            return Err(AppError::InvalidInput(format!(
                "minimumAmount must not be negative, got {}",
                minimum_amount
            )));
        }

        let now = Utc::now();
        let existing = self.schedules.get(user_id).await?;
        let schedule = SettlementSchedule {
            user_id: user_id.to_string(),
            period: request.period,
            day_of_week,
            day_of_month,
            auto_process: request.auto_process,
            minimum_amount,
            enabled: request.enabled.unwrap_or(true),
            next_scheduled: self.clock.next_run(request.period, day_of_week, day_of_month, now)?,
            last_processed: existing.as_ref().and_then(|s| s.last_processed),
            created_at: existing.as_ref().map_or(now, |s| s.created_at),
            updated_at: now,
        };

        self.schedules.upsert(&schedule).await?;

        info!(
            "⏰ Schedule for {} set to {} (next run {})",
            user_id,
            schedule.period.as_str(),
            schedule.next_scheduled
        );

        publish_logged(
            self.events.as_ref(),
            self.orchestrator.call_timeout(),
            SettlementEvent::ScheduleCreated {
                user_id: schedule.user_id.clone(),
                period: schedule.period,
                next_scheduled: schedule.next_scheduled,
                auto_process: schedule.auto_process,
            },
        )
        .await;

        Ok(schedule)
    }

    pub async fn get_schedule(&self, user_id: &str) -> AppResult<SettlementSchedule> {
        self.schedules
            .get(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No schedule for user {}", user_id)))
    }

    /// Pause or resume. Resuming recomputes the next run from now.
    pub async fn set_enabled(&self, user_id: &str, enabled: bool) -> AppResult<SettlementSchedule> {
        let mut schedule = self.get_schedule(user_id).await?;
        let now = Utc::now();

        if enabled && !schedule.enabled {
            schedule.next_scheduled =
                self.clock
                    .next_run(schedule.period, schedule.day_of_week, schedule.day_of_month, now)?;
        }
        schedule.enabled = enabled;
        schedule.updated_at = now;

        self.schedules.upsert(&schedule).await?;
        info!("Schedule for {} {}", user_id, if enabled { "resumed" } else { "paused" });
        Ok(schedule)
    }
}
