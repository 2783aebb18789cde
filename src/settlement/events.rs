use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::settlement::models::{PeriodType, SettlementStatus};

/// Lifecycle events emitted by the orchestrator, scheduler and dispute handler
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettlementEvent {
    #[serde(rename_all = "camelCase")]
    Created {
        settlement_id: Uuid,
        user_id: String,
        gross_amount: Decimal,
        net_amount: Decimal,
        created_by: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        settlement_id: Uuid,
        user_id: String,
        net_amount: Decimal,
        payment_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        settlement_id: Uuid,
        user_id: String,
        error: String,
        retry_count: u32,
        /// `None` once no automatic retry remains
        next_retry_at: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    ScheduleCreated {
        user_id: String,
        period: PeriodType,
        next_scheduled: DateTime<Utc>,
        auto_process: bool,
    },
    #[serde(rename_all = "camelCase")]
    DisputeCreated {
        dispute_id: Uuid,
        settlement_id: Uuid,
        reason: String,
        previous_status: SettlementStatus,
    },
}

impl SettlementEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SettlementEvent::Created { .. } => "settlement.created",
            SettlementEvent::Completed { .. } => "settlement.completed",
            SettlementEvent::Failed { .. } => "settlement.failed",
            SettlementEvent::ScheduleCreated { .. } => "settlement.schedule.created",
            SettlementEvent::DisputeCreated { .. } => "settlement.dispute.created",
        }
    }

    pub fn payload(&self) -> AppResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn envelope(&self) -> AppResult<EventEnvelope> {
        Ok(EventEnvelope {
            event: self.name().to_string(),
            payload: self.payload()?,
            occurred_at: Utc::now(),
        })
    }
}

/// What subscribers and webhooks receive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &SettlementEvent) -> AppResult<()>;
}

/// Publish without letting a slow or failing sink affect the caller
pub async fn publish_logged(events: &dyn EventPublisher, limit: Duration, event: SettlementEvent) {
    match tokio::time::timeout(limit, events.publish(&event)).await {
        Ok(Ok(())) => debug!("📣 Published {}", event.name()),
        Ok(Err(e)) => warn!("⚠️ Failed to publish {}: {}", event.name(), e),
        Err(_) => warn!("⚠️ Publishing {} timed out after {:?}", event.name(), limit),
    }
}

/// In-process fan-out over a tokio broadcast channel
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: &SettlementEvent) -> AppResult<()> {
        let envelope = event.envelope()?;
        // No subscribers is not an error
        if self.sender.send(envelope).is_err() {
            debug!("No subscribers for {}", event.name());
        }
        Ok(())
    }
}

/// POSTs every event envelope to a configured endpoint
pub struct WebhookEventPublisher {
    url: String,
    client: reqwest::Client,
}

impl WebhookEventPublisher {
    pub fn new(url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl EventPublisher for WebhookEventPublisher {
    async fn publish(&self, event: &SettlementEvent) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&event.envelope()?)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalError(format!(
                "Event webhook returned {}: {}",
                status, error_text
            )));
        }
        Ok(())
    }
}

/// Delivers to every inner publisher; one failing sink does not starve the others
pub struct FanoutEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutEventPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl EventPublisher for FanoutEventPublisher {
    async fn publish(&self, event: &SettlementEvent) -> AppResult<()> {
        let mut last_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event).await {
                warn!("⚠️ Event sink failed for {}: {}", event.name(), e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
