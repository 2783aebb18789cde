use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::error::{AppError, AppResult, SettlementError};
use crate::settlement::events::{publish_logged, EventPublisher, SettlementEvent};
use crate::settlement::models::{Dispute, DisputeStatus, SettlementStatus};
use crate::settlement::orchestrator::SettlementOrchestrator;
use crate::storage::DisputeRepository;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDisputeRequest {
    pub reason: String,
    pub description: String,
    pub evidence: Vec<String>,
    pub requested_amount: Option<Decimal>,
    pub raised_by: Option<String>,
}

/// Opens disputes and holds the parent settlement in DISPUTED
pub struct DisputeHandler {
    orchestrator: Arc<SettlementOrchestrator>,
    disputes: Arc<dyn DisputeRepository>,
    events: Arc<dyn EventPublisher>,
}

impl DisputeHandler {
    pub fn new(
        orchestrator: Arc<SettlementOrchestrator>,
        disputes: Arc<dyn DisputeRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            orchestrator,
            disputes,
            events,
        }
    }

    /// Force the settlement into DISPUTED from whatever state it is in
    #[instrument(skip(self, request), fields(settlement_id = %settlement_id))]
    pub async fn open_dispute(&self, settlement_id: Uuid, request: CreateDisputeRequest) -> AppResult<Dispute> {
        if request.reason.trim().is_empty() {
            return Err(AppError::InvalidInput("Dispute reason is required".to_string()));
        }
        if let Some(amount) = request.requested_amount {
            if amount < Decimal::ZERO {
                return Err(AppError::InvalidInput(format!(
                    "Requested amount must not be negative, got {}",
                    amount
                )));
            }
        }

        let dispute_id = Uuid::new_v4();
        let mut previous_status = None;
        self.orchestrator
            .update_settlement(settlement_id, |s| {
                previous_status = Some(s.status);
                s.transition_to(SettlementStatus::Disputed)?;
                s.metadata.dispute_id = Some(dispute_id);
                s.add_note(format!("Dispute {} opened: {}", dispute_id, request.reason));
                Ok(())
            })
            .await?;

        let previous_status = previous_status.ok_or_else(|| {
            AppError::Internal(format!("No status captured for settlement {}", settlement_id))
        })?;

        let dispute = Dispute {
            id: dispute_id,
            settlement_id,
            reason: request.reason,
            description: request.description,
            evidence: request.evidence,
            requested_amount: request.requested_amount,
            status: DisputeStatus::Open,
            previous_status,
            raised_by: request.raised_by,
            created_at: Utc::now(),
        };

        if let Err(e) = self.disputes.insert(&dispute).await {
            error!(
                "❌ Settlement {} is DISPUTED but dispute {} could not be stored: {}",
                settlement_id, dispute_id, e
            );
            return Err(e);
        }

        info!(
            "⚖️ Dispute {} opened on settlement {} (was {})",
            dispute.id, settlement_id, previous_status
        );

        publish_logged(
            self.events.as_ref(),
            self.orchestrator.call_timeout(),
            SettlementEvent::DisputeCreated {
                dispute_id: dispute.id,
                settlement_id,
                reason: dispute.reason.clone(),
                previous_status,
            },
        )
        .await;

        Ok(dispute)
    }

    pub async fn get_dispute(&self, id: Uuid) -> AppResult<Dispute> {
        self.disputes
            .get(id)
            .await?
            .ok_or_else(|| SettlementError::DisputeNotFound(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Collaborators, SandboxLedger, SandboxPayoutGateway, SandboxProfiles};
    use crate::config::FeeConfig;
    use crate::settlement::events::BroadcastEventPublisher;
    use crate::settlement::fixtures;
    use crate::settlement::retry::RetryPolicy;
    use crate::storage::Stores;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn handler() -> (DisputeHandler, Stores, Arc<BroadcastEventPublisher>) {
        let stores = Stores::in_memory();
        let events = Arc::new(BroadcastEventPublisher::default());
        let collaborators = Collaborators {
            ledger: Arc::new(SandboxLedger::new()),
            profiles: Arc::new(SandboxProfiles::permissive()),
            gateway: Arc::new(SandboxPayoutGateway::new()),
            events: events.clone(),
        };
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            &stores,
            &collaborators,
            FeeConfig::default(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        ));
        let handler = DisputeHandler::new(orchestrator, stores.disputes.clone(), events.clone());
        (handler, stores, events)
    }

    fn request() -> CreateDisputeRequest {
        CreateDisputeRequest {
            reason: "Missing campaign bonus".to_string(),
            description: "Bonus for March campaign not included".to_string(),
            evidence: vec!["https://files.example/contract.pdf".to_string()],
            requested_amount: Some(dec!(50000)),
            raised_by: Some("creator-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_dispute_forces_completed_settlement() {
        let (handler, stores, events) = handler();
        let mut receiver = events.subscribe();
        let settlement = fixtures::settlement("creator-1", SettlementStatus::Completed);
        stores.settlements.insert(&settlement).await.unwrap();

        let dispute = handler.open_dispute(settlement.id, request()).await.unwrap();

        assert_eq!(dispute.status, DisputeStatus::Open);
        assert_eq!(dispute.previous_status, SettlementStatus::Completed);

        let stored = stores.settlements.get(settlement.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Disputed);
        assert_eq!(stored.metadata.dispute_id, Some(dispute.id));

        assert_eq!(handler.get_dispute(dispute.id).await.unwrap(), dispute);
        assert_eq!(receiver.recv().await.unwrap().event, "settlement.dispute.created");
    }

    #[tokio::test]
    async fn test_dispute_allowed_from_every_status() {
        let (handler, stores, _) = handler();
        for status in SettlementStatus::all() {
            let settlement = fixtures::settlement("creator-1", status);
            stores.settlements.insert(&settlement).await.unwrap();
            handler.open_dispute(settlement.id, request()).await.unwrap();
            let stored = stores.settlements.get(settlement.id).await.unwrap().unwrap();
            assert_eq!(stored.status, SettlementStatus::Disputed);
        }
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let (handler, _, _) = handler();
        assert!(matches!(
            handler.open_dispute(Uuid::new_v4(), request()).await,
            Err(AppError::Settlement(SettlementError::NotFound(_)))
        ));
        assert!(matches!(
            handler.get_dispute(Uuid::new_v4()).await,
            Err(AppError::Settlement(SettlementError::DisputeNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_blank_reason_rejected() {
        let (handler, stores, _) = handler();
        let settlement = fixtures::settlement("creator-1", SettlementStatus::Pending);
        stores.settlements.insert(&settlement).await.unwrap();

        let result = handler
            .open_dispute(
                settlement.id,
                CreateDisputeRequest {
                    reason: "  ".to_string(),
                    ..request()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        let stored = stores.settlements.get(settlement.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Pending);
    }
}
