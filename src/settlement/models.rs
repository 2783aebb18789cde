use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult, SettlementError};

/// Who is being paid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Business,
    Influencer,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Business => "business",
            UserType::Influencer => "influencer",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
            PeriodType::Custom => "custom",
        }
    }
}

/// Settlement lifecycle status
///
/// Valid transitions:
/// - Pending → Processing, Cancelled
/// - Processing → Completed, Failed
/// - Failed → Processing (scheduled retry)
/// - any → Disputed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Disputed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Processing => "PROCESSING",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Failed => "FAILED",
            SettlementStatus::Cancelled => "CANCELLED",
            SettlementStatus::Disputed => "DISPUTED",
        }
    }

    pub fn all() -> [SettlementStatus; 6] {
        [
            SettlementStatus::Pending,
            SettlementStatus::Processing,
            SettlementStatus::Completed,
            SettlementStatus::Failed,
            SettlementStatus::Cancelled,
            SettlementStatus::Disputed,
        ]
    }

    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        match (self, next) {
            (_, Disputed) => true,
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            (Failed, Processing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SettlementStatus::all()
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown settlement status: {}", value)))
    }
}

/// A raw platform transaction pulled from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    /// Amount expressed in the settlement's base currency
    pub amount: Decimal,
    /// Currency the transaction was originally denominated in
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

/// Half-open interval `[start_date, end_date)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementPeriod {
    #[serde(rename = "type")]
    pub period_type: PeriodType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl SettlementPeriod {
    pub fn new(
        period_type: PeriodType,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> AppResult<Self> {
        if start_date > end_date {
            return Err(AppError::InvalidInput(format!(
                "Period start {} is after end {}",
                start_date, end_date
            )));
        }
        Ok(Self {
            period_type,
            start_date,
            end_date,
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_date && at < self.end_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    PlatformFee,
    ProcessingFee,
    WithdrawalFee,
    InternationalFee,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeLineItem {
    pub kind: FeeKind,
    /// Rate applied to gross; `None` for flat fees
    pub rate: Option<Decimal>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub platform_fee: Decimal,
    pub processing_fee: Decimal,
    pub withdrawal_fee: Decimal,
    pub international_fee: Decimal,
    pub total: Decimal,
    pub items: Vec<FeeLineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxKind {
    Vat,
    IncomeTax,
    BusinessTax,
    WithholdingTax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxLineItem {
    pub kind: TaxKind,
    pub rate: Decimal,
    pub base: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    pub taxable_amount: Decimal,
    pub vat: Decimal,
    pub income_tax: Decimal,
    pub business_tax: Decimal,
    /// Reserved; always zero in the current model
    pub withholding_tax: Decimal,
    pub total: Decimal,
    pub items: Vec<TaxLineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorporateType {
    Individual,
    Corporation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxProfile {
    pub vat_registered: bool,
    pub corporate_type: Option<CorporateType>,
}

impl TaxProfile {
    pub fn is_corporation(&self) -> bool {
        self.corporate_type == Some(CorporateType::Corporation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub bank_code: String,
    pub account_number: String,
    pub holder_name: String,
}

/// Mutated only by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingInfo {
    pub initiated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub payment_id: Option<String>,
    pub external_transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditNote {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfo {
    pub created_by: String,
    pub approved_by: Option<String>,
    pub reviewed_by: Option<String>,
    /// Append-only
    pub notes: Vec<AuditNote>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementMetadata {
    pub dispute_id: Option<Uuid>,
}

/// One payout cycle for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub id: Uuid,
    pub user_id: String,
    pub user_type: UserType,
    pub period: SettlementPeriod,
    pub transaction_ids: Vec<String>,
    pub currency: String,
    pub gross_amount: Decimal,
    pub fees: FeeBreakdown,
    pub taxes: TaxBreakdown,
    /// May be negative when deductions exceed gross
    pub net_amount: Decimal,
    pub status: SettlementStatus,
    pub processing: ProcessingInfo,
    pub audit: AuditInfo,
    pub metadata: SettlementMetadata,
    /// Optimistic concurrency token, bumped on every write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition_to(&mut self, next: SettlementStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SettlementError::InvalidState {
                id: self.id,
                current: self.status,
                expected: format!("a state that can move to {}", next),
            }
            .into());
        }
        self.status = next;
        Ok(())
    }

    pub fn add_note(&mut self, message: impl Into<String>) {
        self.audit.notes.push(AuditNote {
            at: Utc::now(),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispute {
    pub id: Uuid,
    pub settlement_id: Uuid,
    pub reason: String,
    pub description: String,
    pub evidence: Vec<String>,
    pub requested_amount: Option<Decimal>,
    pub status: DisputeStatus,
    /// Settlement status at the moment the dispute was opened
    pub previous_status: SettlementStatus,
    pub raised_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Recurring settlement policy, one per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSchedule {
    pub user_id: String,
    pub period: PeriodType,
    /// 0 = Sunday … 6 = Saturday
    pub day_of_week: u32,
    pub day_of_month: u32,
    pub auto_process: bool,
    pub minimum_amount: Decimal,
    pub enabled: bool,
    pub next_scheduled: DateTime<Utc>,
    pub last_processed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementSchedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_scheduled <= now
    }
}

/// Durable record of a payout retry waiting for its backoff to elapse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    pub settlement_id: Uuid,
    /// Number of failed attempts that led to this retry
    pub attempt: u32,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStats {
    pub total_settlements: u64,
    pub total_amount: Decimal,
    pub completed_settlements: u64,
    pub pending_settlements: u64,
    pub failed_settlements: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub active_settlements: u64,
    pub pending_settlements: u64,
    pub scheduled_users: u64,
    pub pending_retries: u64,
}
