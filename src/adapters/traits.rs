use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;
use crate::settlement::models::{
    BankAccount, FeeBreakdown, Settlement, SettlementPeriod, TaxBreakdown, TaxProfile, Transaction, UserType,
};

/// Everything the gateway needs to move money for one settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequest {
    pub settlement_id: Uuid,
    pub user_id: String,
    pub account: BankAccount,
    pub currency: String,
    pub gross_amount: Decimal,
    pub fees: FeeBreakdown,
    pub taxes: TaxBreakdown,
    pub net_amount: Decimal,
    /// Identical on every attempt for the same settlement
    pub idempotency_key: String,
}

impl PayoutRequest {
    pub fn for_settlement(settlement: &Settlement, account: BankAccount, idempotency_key: String) -> Self {
        Self {
            settlement_id: settlement.id,
            user_id: settlement.user_id.clone(),
            account,
            currency: settlement.currency.clone(),
            gross_amount: settlement.gross_amount,
            fees: settlement.fees.clone(),
            taxes: settlement.taxes.clone(),
            net_amount: settlement.net_amount,
            idempotency_key,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutReceipt {
    pub success: bool,
    pub payment_id: Option<String>,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
}

/// System of record for raw platform transactions
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Transactions inside `[period.start_date, period.end_date)`
    async fn collect_transactions(&self, user_id: &str, period: &SettlementPeriod) -> AppResult<Vec<Transaction>>;

    /// Tag transactions as settled. Marking an already settled transaction is a no-op.
    async fn mark_settled(&self, transaction_ids: &[String], settlement_id: Uuid) -> AppResult<()>;
}

#[async_trait]
pub trait ProfileClient: Send + Sync {
    async fn get_user_type(&self, user_id: &str) -> AppResult<UserType>;

    async fn get_tax_profile(&self, user_id: &str) -> AppResult<TaxProfile>;

    async fn get_bank_account(&self, user_id: &str) -> AppResult<Option<BankAccount>>;
}

#[async_trait]
pub trait PayoutGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// A gateway-reported rejection comes back as `success == false`;
    /// `Err` is reserved for transport failures.
    async fn execute_payout(&self, request: &PayoutRequest) -> AppResult<PayoutReceipt>;
}
