use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::traits::{LedgerClient, PayoutGateway, PayoutReceipt, PayoutRequest, ProfileClient};
use crate::error::{AppError, AppResult};
use crate::settlement::models::{BankAccount, SettlementPeriod, TaxProfile, Transaction, UserType};

/// In-process ledger used when no platform API is configured
#[derive(Default)]
pub struct SandboxLedger {
    transactions: Mutex<Vec<Transaction>>,
    settled: Mutex<HashMap<String, Uuid>>,
}

impl SandboxLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, transaction: Transaction) {
        self.transactions.lock().push(transaction);
    }

    pub fn settled_by(&self, transaction_id: &str) -> Option<Uuid> {
        self.settled.lock().get(transaction_id).copied()
    }
}

#[async_trait]
impl LedgerClient for SandboxLedger {
    async fn collect_transactions(&self, user_id: &str, period: &SettlementPeriod) -> AppResult<Vec<Transaction>> {
        let settled = self.settled.lock();
        let transactions = self.transactions.lock();
        Ok(transactions
            .iter()
            .filter(|t| t.user_id == user_id && period.contains(t.occurred_at))
            .filter(|t| !settled.contains_key(&t.id))
            .cloned()
            .collect())
    }

    async fn mark_settled(&self, transaction_ids: &[String], settlement_id: Uuid) -> AppResult<()> {
        let mut settled = self.settled.lock();
        for id in transaction_ids {
            // First settlement wins; re-marking is a no-op
            settled.entry(id.clone()).or_insert(settlement_id);
        }
        Ok(())
    }
}

struct SandboxProfile {
    user_type: UserType,
    tax_profile: TaxProfile,
    bank_account: Option<BankAccount>,
}

/// User directory with optional fallbacks for unknown users
#[derive(Default)]
pub struct SandboxProfiles {
    profiles: Mutex<HashMap<String, SandboxProfile>>,
    fallback_account: Option<BankAccount>,
}

impl SandboxProfiles {
    /// Unknown users are rejected and have no account
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown users resolve to unregistered influencers with a sandbox account
    pub fn permissive() -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            fallback_account: Some(BankAccount {
                bank_code: "000".to_string(),
                account_number: "SANDBOX-0000".to_string(),
                holder_name: "Sandbox User".to_string(),
            }),
        }
    }

    pub fn register(
        &self,
        user_id: &str,
        user_type: UserType,
        tax_profile: TaxProfile,
        bank_account: Option<BankAccount>,
    ) {
        self.profiles.lock().insert(
            user_id.to_string(),
            SandboxProfile {
                user_type,
                tax_profile,
                bank_account,
            },
        );
    }
}

#[async_trait]
impl ProfileClient for SandboxProfiles {
    async fn get_user_type(&self, user_id: &str) -> AppResult<UserType> {
        match self.profiles.lock().get(user_id) {
            Some(profile) => Ok(profile.user_type),
            None if self.fallback_account.is_some() => Ok(UserType::Influencer),
            None => Err(AppError::NotFound(format!("User {} not found", user_id))),
        }
    }

    async fn get_tax_profile(&self, user_id: &str) -> AppResult<TaxProfile> {
        Ok(self
            .profiles
            .lock()
            .get(user_id)
            .map(|profile| profile.tax_profile.clone())
            .unwrap_or(TaxProfile {
                vat_registered: false,
                corporate_type: None,
            }))
    }

    async fn get_bank_account(&self, user_id: &str) -> AppResult<Option<BankAccount>> {
        Ok(match self.profiles.lock().get(user_id) {
            Some(profile) => profile.bank_account.clone(),
            None => self.fallback_account.clone(),
        })
    }
}

/// Scripted gateway behaviour, consumed one entry per payout call
#[derive(Debug, Clone)]
pub enum PayoutOutcome {
    Succeed,
    Reject(String),
    TransportError(String),
    /// Never answers within any sensible timeout
    Hang,
}

/// Gateway double: succeeds unless told otherwise and deduplicates on the idempotency key
#[derive(Default)]
pub struct SandboxPayoutGateway {
    script: Mutex<VecDeque<PayoutOutcome>>,
    calls: Mutex<Vec<PayoutRequest>>,
    completed: Mutex<HashMap<String, PayoutReceipt>>,
}

impl SandboxPayoutGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: PayoutOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<PayoutRequest> {
        self.calls.lock().clone()
    }

    /// Payouts that actually moved money, one per idempotency key
    pub fn completed_count(&self) -> usize {
        self.completed.lock().len()
    }
}

#[async_trait]
impl PayoutGateway for SandboxPayoutGateway {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn execute_payout(&self, request: &PayoutRequest) -> AppResult<PayoutReceipt> {
        self.calls.lock().push(request.clone());

        if let Some(receipt) = self.completed.lock().get(&request.idempotency_key) {
            debug!("Sandbox payout replayed for key {}", request.idempotency_key);
            return Ok(receipt.clone());
        }

        let outcome = self.script.lock().pop_front().unwrap_or(PayoutOutcome::Succeed);
        match outcome {
            PayoutOutcome::Succeed => {
                let receipt = PayoutReceipt {
                    success: true,
                    payment_id: Some(format!("pay_{}", Uuid::new_v4().simple())),
                    transaction_id: Some(format!("txn_{}", Uuid::new_v4().simple())),
                    error: None,
                };
                self.completed
                    .lock()
                    .insert(request.idempotency_key.clone(), receipt.clone());
                Ok(receipt)
            }
            PayoutOutcome::Reject(reason) => Ok(PayoutReceipt {
                success: false,
                error: Some(reason),
                ..PayoutReceipt::default()
            }),
            PayoutOutcome::TransportError(message) => Err(AppError::ExternalError(message)),
            PayoutOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AppError::ExternalError("sandbox gateway hung".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::fixtures;
    use crate::settlement::models::PeriodType;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mark_settled_is_idempotent() {
        let ledger = SandboxLedger::new();
        let now = Utc::now();
        let tx = fixtures::transaction("user-1", dec!(1000), "KRW", now - ChronoDuration::minutes(5));
        let tx_id = tx.id.clone();
        ledger.record(tx);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        ledger.mark_settled(&[tx_id.clone()], first).await.unwrap();
        ledger.mark_settled(&[tx_id.clone()], second).await.unwrap();

        assert_eq!(ledger.settled_by(&tx_id), Some(first));

        let period = SettlementPeriod::new(PeriodType::Daily, now - ChronoDuration::days(1), now).unwrap();
        assert!(ledger.collect_transactions("user-1", &period).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_respects_half_open_period() {
        let ledger = SandboxLedger::new();
        let now = Utc::now();
        let start = now - ChronoDuration::days(1);
        ledger.record(fixtures::transaction("user-1", dec!(1), "KRW", start));
        ledger.record(fixtures::transaction("user-1", dec!(2), "KRW", now));
        ledger.record(fixtures::transaction("user-2", dec!(3), "KRW", start));

        let period = SettlementPeriod::new(PeriodType::Daily, start, now).unwrap();
        let collected = ledger.collect_transactions("user-1", &period).await.unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].amount, dec!(1));
    }

    #[tokio::test]
    async fn test_gateway_replays_completed_payout() {
        let gateway = SandboxPayoutGateway::new();
        let settlement = fixtures::settlement("user-1", crate::settlement::models::SettlementStatus::Processing);
        let request = PayoutRequest::for_settlement(
            &settlement,
            BankAccount {
                bank_code: "004".to_string(),
                account_number: "1234".to_string(),
                holder_name: "Kim".to_string(),
            },
            "key-1".to_string(),
        );

        let first = gateway.execute_payout(&request).await.unwrap();
        let second = gateway.execute_payout(&request).await.unwrap();
        assert!(first.success);
        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(gateway.completed_count(), 1);
        assert_eq!(gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_strict_profiles_reject_unknown_users() {
        let profiles = SandboxProfiles::new();
        assert!(profiles.get_user_type("ghost").await.is_err());
        assert!(profiles.get_bank_account("ghost").await.unwrap().is_none());

        let permissive = SandboxProfiles::permissive();
        assert_eq!(permissive.get_user_type("ghost").await.unwrap(), UserType::Influencer);
        assert!(permissive.get_bank_account("ghost").await.unwrap().is_some());
    }
}
