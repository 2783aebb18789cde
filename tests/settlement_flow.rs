use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use settlement_engine::adapters::{Collaborators, PayoutOutcome, SandboxLedger, SandboxPayoutGateway, SandboxProfiles};
use settlement_engine::bootstrap::{assemble, Engine};
use settlement_engine::config::{Config, FeeConfig, RetryConfig, SchedulerConfig};
use settlement_engine::error::{AppError, SettlementError};
use settlement_engine::settlement::events::{BroadcastEventPublisher, EventEnvelope};
use settlement_engine::settlement::models::{
    BankAccount, PeriodType, SettlementStatus, TaxProfile, Transaction, UserType,
};
use settlement_engine::settlement::scheduler::TickOutcome;
use settlement_engine::settlement::{CreateDisputeRequest, CreateSettlementRequest, UpsertScheduleRequest};
use settlement_engine::storage::{RetryQueue, Stores};

struct TestEnv {
    engine: Engine,
    stores: Stores,
    ledger: Arc<SandboxLedger>,
    profiles: Arc<SandboxProfiles>,
    gateway: Arc<SandboxPayoutGateway>,
    events: Arc<BroadcastEventPublisher>,
}

fn config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url: None,
        platform_api_url: None,
        event_webhook_url: None,
        external_call_timeout_secs: 5,
        fees: FeeConfig::default(),
        retry: RetryConfig::default(),
        scheduler: SchedulerConfig::default(),
    }
}

fn setup() -> TestEnv {
    let stores = Stores::in_memory();
    let ledger = Arc::new(SandboxLedger::new());
    let profiles = Arc::new(SandboxProfiles::new());
    let gateway = Arc::new(SandboxPayoutGateway::new());
    let events = Arc::new(BroadcastEventPublisher::default());

    let collaborators = Collaborators {
        ledger: ledger.clone(),
        profiles: profiles.clone(),
        gateway: gateway.clone(),
        events: events.clone(),
    };
    let engine = assemble(&config(), &stores, &collaborators).unwrap();

    TestEnv {
        engine,
        stores,
        ledger,
        profiles,
        gateway,
        events,
    }
}

impl TestEnv {
    fn register_influencer(&self, user_id: &str) {
        self.profiles.register(
            user_id,
            UserType::Influencer,
            TaxProfile {
                vat_registered: false,
                corporate_type: None,
            },
            Some(BankAccount {
                bank_code: "004".to_string(),
                account_number: "123-456-789".to_string(),
                holder_name: user_id.to_string(),
            }),
        );
    }

    fn record(&self, user_id: &str, amount: Decimal, at: DateTime<Utc>) -> Transaction {
        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            currency: "KRW".to_string(),
            occurred_at: at,
        };
        self.ledger.record(transaction.clone());
        transaction
    }

    /// A PENDING 100,000 KRW settlement
    async fn pending_settlement(&self, user_id: &str) -> Uuid {
        let now = Utc::now();
        let transaction = self.record(user_id, dec!(100000), now - Duration::hours(1));
        let settlement = self
            .engine
            .state
            .orchestrator
            .create_settlement(CreateSettlementRequest {
                user_id: user_id.to_string(),
                user_type: None,
                period_type: PeriodType::Custom,
                start_date: now - Duration::days(1),
                end_date: now,
                transactions: Some(vec![transaction]),
                created_by: "integration".to_string(),
            })
            .await
            .unwrap();
        settlement.id
    }
}

fn drain(receiver: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(envelope) = receiver.try_recv() {
        names.push(envelope.event);
    }
    names
}

#[tokio::test]
async fn test_scheduled_settlement_pays_out_and_tags_ledger() {
    let env = setup();
    let mut receiver = env.events.subscribe();
    env.register_influencer("creator-1");

    let schedule = env
        .engine
        .state
        .scheduler
        .upsert_schedule(
            "creator-1",
            UpsertScheduleRequest {
                period: PeriodType::Daily,
                day_of_week: None,
                day_of_month: None,
                auto_process: true,
                minimum_amount: Some(dec!(10000)),
                enabled: None,
            },
        )
        .await
        .unwrap();

    let tick_at = schedule.next_scheduled + Duration::minutes(1);
    let first = env.record("creator-1", dec!(60000), tick_at - Duration::hours(3));
    let second = env.record("creator-1", dec!(40000), tick_at - Duration::hours(2));

    let report = env.engine.state.scheduler.run_tick(tick_at).await.unwrap();
    let Some(TickOutcome::Processed { settlement_id, status }) = report.outcome_for("creator-1") else {
        panic!("unexpected tick outcome: {:?}", report.outcomes);
    };
    assert_eq!(*status, SettlementStatus::Completed);

    let settlement = env.engine.state.queries.get_settlement(*settlement_id).await.unwrap();
    assert_eq!(settlement.gross_amount, dec!(100000));
    assert_eq!(settlement.fees.total, dec!(18900));
    assert_eq!(settlement.taxes.total, dec!(4866));
    assert_eq!(settlement.net_amount, dec!(76234));
    assert!(settlement.processing.payment_id.is_some());

    assert_eq!(env.ledger.settled_by(&first.id), Some(*settlement_id));
    assert_eq!(env.ledger.settled_by(&second.id), Some(*settlement_id));
    assert_eq!(env.gateway.completed_count(), 1);

    let advanced = env.engine.state.scheduler.get_schedule("creator-1").await.unwrap();
    assert!(advanced.next_scheduled > tick_at);
    assert_eq!(advanced.last_processed, Some(tick_at));

    assert_eq!(
        drain(&mut receiver),
        vec![
            "settlement.schedule.created",
            "settlement.created",
            "settlement.completed"
        ]
    );

    // The settled transactions are not picked up again
    let next_tick = advanced.next_scheduled + Duration::minutes(1);
    let report = env.engine.state.scheduler.run_tick(next_tick).await.unwrap();
    assert_eq!(report.outcome_for("creator-1"), Some(&TickOutcome::NoTransactions));
}

#[tokio::test]
async fn test_failed_payouts_retry_until_attempts_are_exhausted() {
    let env = setup();
    let mut receiver = env.events.subscribe();
    env.register_influencer("creator-1");
    for _ in 0..3 {
        env.gateway.push_outcome(PayoutOutcome::Reject("bank offline".to_string()));
    }

    let id = env.pending_settlement("creator-1").await;
    let result = env.engine.state.orchestrator.process_settlement(id, None, None).await;
    assert!(matches!(
        result,
        Err(AppError::Settlement(SettlementError::Payout { retry_scheduled: true, .. }))
    ));
    assert_eq!(env.stores.retry_queue.len().await.unwrap(), 1);

    // Jobs are not claimed before their backoff elapses
    assert_eq!(env.engine.retry_worker.run_due(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + Duration::hours(1);
    assert_eq!(env.engine.retry_worker.run_due(later).await.unwrap(), 1);
    let after_second = env.engine.state.queries.get_settlement(id).await.unwrap();
    assert_eq!(after_second.status, SettlementStatus::Failed);
    assert_eq!(after_second.processing.retry_count, 2);
    assert!(env.stores.retry_queue.contains(id).await.unwrap());

    assert_eq!(env.engine.retry_worker.run_due(later + Duration::hours(1)).await.unwrap(), 1);
    let exhausted = env.engine.state.queries.get_settlement(id).await.unwrap();
    assert_eq!(exhausted.status, SettlementStatus::Failed);
    assert_eq!(exhausted.processing.retry_count, 3);
    assert_eq!(exhausted.processing.next_retry_at, None);
    assert_eq!(exhausted.processing.error_message.as_deref(), Some("bank offline"));

    assert_eq!(env.stores.retry_queue.len().await.unwrap(), 0);
    assert_eq!(env.engine.retry_worker.run_due(later + Duration::hours(2)).await.unwrap(), 0);
    assert_eq!(env.gateway.calls().len(), 3);
    assert_eq!(env.gateway.completed_count(), 0);

    let events = drain(&mut receiver);
    assert_eq!(events.iter().filter(|e| *e == "settlement.failed").count(), 3);

    // Operators cannot push a settlement past its attempt budget
    assert!(matches!(
        env.engine.state.orchestrator.retry_settlement(id).await,
        Err(AppError::Settlement(SettlementError::InvalidState { .. }))
    ));
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let env = setup();
    env.register_influencer("creator-1");
    env.gateway
        .push_outcome(PayoutOutcome::TransportError("connection reset".to_string()));

    let id = env.pending_settlement("creator-1").await;
    assert!(env.engine.state.orchestrator.process_settlement(id, None, None).await.is_err());

    let claimed = env
        .engine
        .retry_worker
        .run_due(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(claimed, 1);

    let settlement = env.engine.state.queries.get_settlement(id).await.unwrap();
    assert_eq!(settlement.status, SettlementStatus::Completed);
    assert_eq!(settlement.processing.retry_count, 1);
    assert_eq!(env.gateway.completed_count(), 1);

    // Both attempts carried the same idempotency key
    let keys: Vec<String> = env.gateway.calls().into_iter().map(|c| c.idempotency_key).collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_recovery_requeues_orphaned_failures() {
    let env = setup();
    env.register_influencer("creator-1");
    env.gateway.push_outcome(PayoutOutcome::Reject("declined".to_string()));

    let id = env.pending_settlement("creator-1").await;
    assert!(env.engine.state.orchestrator.process_settlement(id, None, None).await.is_err());

    // Simulate a crash between the FAILED write and the enqueue
    env.stores.retry_queue.remove(id).await.unwrap();
    assert_eq!(env.engine.state.queries.health_check().await.unwrap().pending_retries, 0);

    assert_eq!(env.engine.retry_worker.recover(Utc::now()).await.unwrap(), 1);
    assert!(env.stores.retry_queue.contains(id).await.unwrap());
    assert_eq!(env.engine.retry_worker.recover(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stalled_processing_is_failed_and_requeued() {
    let env = setup();
    env.register_influencer("creator-1");
    env.register_influencer("creator-2");
    let orchestrator = &env.engine.state.orchestrator;

    // One attempt died long ago after claiming its settlement, the other is live
    let stalled = env.pending_settlement("creator-1").await;
    let started = Utc::now() - Duration::hours(1);
    orchestrator
        .update_settlement(stalled, |s| {
            s.transition_to(SettlementStatus::Processing)?;
            s.processing.initiated_at = Some(started);
            Ok(())
        })
        .await
        .unwrap();
    let live = env.pending_settlement("creator-2").await;
    orchestrator
        .update_settlement(live, |s| {
            s.transition_to(SettlementStatus::Processing)?;
            s.processing.initiated_at = Some(Utc::now());
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(env.engine.retry_worker.sweep_stalled(Utc::now()).await.unwrap(), 1);

    let failed = env.engine.state.queries.get_settlement(stalled).await.unwrap();
    assert_eq!(failed.status, SettlementStatus::Failed);
    assert_eq!(failed.processing.retry_count, 1);
    assert!(failed.processing.next_retry_at.is_some());
    assert!(env.stores.retry_queue.contains(stalled).await.unwrap());

    let untouched = env.engine.state.queries.get_settlement(live).await.unwrap();
    assert_eq!(untouched.status, SettlementStatus::Processing);
    assert!(!env.stores.retry_queue.contains(live).await.unwrap());

    assert_eq!(env.engine.retry_worker.sweep_stalled(Utc::now()).await.unwrap(), 0);

    // The queued retry pays it out
    assert_eq!(
        env.engine
            .retry_worker
            .run_due(Utc::now() + Duration::minutes(5))
            .await
            .unwrap(),
        1
    );
    let paid = env.engine.state.queries.get_settlement(stalled).await.unwrap();
    assert_eq!(paid.status, SettlementStatus::Completed);
    assert_eq!(env.gateway.completed_count(), 1);
}

#[tokio::test]
async fn test_dispute_after_payout_is_tracked() {
    let env = setup();
    let mut receiver = env.events.subscribe();
    env.register_influencer("creator-1");

    let id = env.pending_settlement("creator-1").await;
    let completed = env
        .engine
        .state
        .orchestrator
        .process_settlement(id, None, Some("finance-ops".to_string()))
        .await
        .unwrap();
    assert_eq!(completed.status, SettlementStatus::Completed);
    assert_eq!(completed.audit.approved_by.as_deref(), Some("finance-ops"));

    let dispute = env
        .engine
        .state
        .disputes
        .open_dispute(
            id,
            CreateDisputeRequest {
                reason: "Campaign bonus missing".to_string(),
                description: "March campaign bonus not included".to_string(),
                evidence: vec![],
                requested_amount: Some(dec!(30000)),
                raised_by: Some("creator-1".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(dispute.previous_status, SettlementStatus::Completed);

    let settlement = env.engine.state.queries.get_settlement(id).await.unwrap();
    assert_eq!(settlement.status, SettlementStatus::Disputed);
    assert_eq!(settlement.metadata.dispute_id, Some(dispute.id));
    assert_eq!(env.engine.state.disputes.get_dispute(dispute.id).await.unwrap(), dispute);

    let stats = env.engine.state.queries.get_settlement_stats("creator-1").await.unwrap();
    assert_eq!(stats.total_settlements, 1);
    assert_eq!(stats.completed_settlements, 0);
    assert_eq!(stats.total_amount, dec!(76234));

    assert_eq!(
        drain(&mut receiver),
        vec![
            "settlement.created",
            "settlement.completed",
            "settlement.dispute.created"
        ]
    );
}

#[tokio::test]
async fn test_health_reflects_engine_state() {
    let env = setup();
    env.register_influencer("creator-1");
    env.register_influencer("creator-2");

    let _pending = env.pending_settlement("creator-1").await;
    env.gateway.push_outcome(PayoutOutcome::Reject("declined".to_string()));
    let failing = env.pending_settlement("creator-2").await;
    assert!(env
        .engine
        .state
        .orchestrator
        .process_settlement(failing, None, None)
        .await
        .is_err());

    let health = env.engine.state.queries.health_check().await.unwrap();
    assert_eq!(health.pending_settlements, 1);
    assert_eq!(health.active_settlements, 0);
    assert_eq!(health.pending_retries, 1);
    assert_eq!(health.scheduled_users, 0);
}
