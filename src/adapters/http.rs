use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{LedgerClient, PayoutGateway, PayoutReceipt, PayoutRequest, ProfileClient};
use crate::error::{AppError, AppResult};
use crate::settlement::models::{BankAccount, SettlementPeriod, TaxProfile, Transaction, UserType};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkSettledRequest<'a> {
    transaction_ids: &'a [String],
    settlement_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTypeResponse {
    user_type: UserType,
}

/// REST client for the surrounding platform: ledger, user profiles and payouts
pub struct PlatformApiClient {
    base_url: Url,
    client: reqwest::Client,
}

impl PlatformApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let parsed = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| AppError::Config(format!("Invalid platform API url {}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(AppError::Config(format!("Platform API url {} cannot take a path", base_url)));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: parsed,
            client,
        })
    }

    /// Append `segments` to the base path; each one is percent-encoded as a single segment
    fn url(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("Platform API url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Dot segments would be dropped from the path rather than encoded
    fn user_segment(user_id: &str) -> AppResult<&str> {
        match user_id {
            "" | "." | ".." => Err(AppError::InvalidInput(format!("Invalid user id {:?}", user_id))),
            _ => Ok(user_id),
        }
    }

    async fn error_from(response: reqwest::Response, what: &str) -> AppError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        AppError::ExternalError(format!("{} failed with {}: {}", what, status, error_text))
    }
}

#[async_trait]
impl LedgerClient for PlatformApiClient {
    async fn collect_transactions(&self, user_id: &str, period: &SettlementPeriod) -> AppResult<Vec<Transaction>> {
        let response = self
            .client
            .get(self.url(&["ledger", "users", Self::user_segment(user_id)?, "transactions"])?)
            .query(&[
                ("start", period.start_date.to_rfc3339()),
                ("end", period.end_date.to_rfc3339()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Ledger query").await);
        }

        let transactions: Vec<Transaction> = response.json().await?;
        debug!("Ledger returned {} transactions for {}", transactions.len(), user_id);
        Ok(transactions)
    }

    async fn mark_settled(&self, transaction_ids: &[String], settlement_id: Uuid) -> AppResult<()> {
        let response = self
            .client
            .post(self.url(&["ledger", "transactions", "settled"])?)
            .json(&MarkSettledRequest {
                transaction_ids,
                settlement_id,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Mark settled").await);
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileClient for PlatformApiClient {
    async fn get_user_type(&self, user_id: &str) -> AppResult<UserType> {
        let response = self
            .client
            .get(self.url(&["users", Self::user_segment(user_id)?, "type"])?)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "User type lookup").await);
        }

        let body: UserTypeResponse = response.json().await?;
        Ok(body.user_type)
    }

    async fn get_tax_profile(&self, user_id: &str) -> AppResult<TaxProfile> {
        let response = self
            .client
            .get(self.url(&["users", Self::user_segment(user_id)?, "tax-profile"])?)
            .send()
            .await?;

        // Users without a filed profile are treated as unregistered individuals
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(TaxProfile {
                vat_registered: false,
                corporate_type: None,
            });
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "Tax profile lookup").await);
        }

        Ok(response.json().await?)
    }

    async fn get_bank_account(&self, user_id: &str) -> AppResult<Option<BankAccount>> {
        let response = self
            .client
            .get(self.url(&["users", Self::user_segment(user_id)?, "bank-account"])?)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "Bank account lookup").await);
        }

        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl PayoutGateway for PlatformApiClient {
    fn name(&self) -> &'static str {
        "platform-api"
    }

    async fn execute_payout(&self, request: &PayoutRequest) -> AppResult<PayoutReceipt> {
        let response = self
            .client
            .post(self.url(&["payouts"])?)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Self::error_from(response, "Payout").await);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Ok(PayoutReceipt {
                success: false,
                error: Some(format!("Payout rejected ({}): {}", status, error_text)),
                ..PayoutReceipt::default()
            });
        }

        let receipt: PayoutReceipt = response.json().await?;
        info!(
            "💸 Payout for settlement {} accepted: payment={:?}",
            request.settlement_id, receipt.payment_id
        );
        Ok(receipt)
    }
}
