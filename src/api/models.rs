use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::settlement::dispute::CreateDisputeRequest;
use crate::settlement::models::{BankAccount, HealthReport, PeriodType, Transaction, UserType};
use crate::settlement::orchestrator::CreateSettlementRequest;
use crate::settlement::report::ReportFormat;
use crate::settlement::scheduler::UpsertScheduleRequest;

/// Actor recorded when a request does not name one
pub const API_ACTOR: &str = "api";

// ========== REQUEST MODELS ==========

/// Create a settlement for one user and period
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSettlementDto {
    #[validate(length(min = 1, max = 256))]
    pub user_id: String,
    pub user_type: Option<UserType>,
    pub period_type: PeriodType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Pulled from the ledger when omitted
    pub transactions: Option<Vec<Transaction>>,
    #[validate(length(min = 1, max = 256))]
    pub created_by: Option<String>,
}

impl From<CreateSettlementDto> for CreateSettlementRequest {
    fn from(dto: CreateSettlementDto) -> Self {
        Self {
            user_id: dto.user_id,
            user_type: dto.user_type,
            period_type: dto.period_type,
            start_date: dto.start_date,
            end_date: dto.end_date,
            transactions: dto.transactions,
            created_by: dto.created_by.unwrap_or_else(|| API_ACTOR.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BankAccountDto {
    #[validate(length(min = 1, max = 16))]
    pub bank_code: String,
    #[validate(length(min = 1, max = 64))]
    pub account_number: String,
    #[validate(length(min = 1, max = 256))]
    pub holder_name: String,
}

impl From<BankAccountDto> for BankAccount {
    fn from(dto: BankAccountDto) -> Self {
        Self {
            bank_code: dto.bank_code,
            account_number: dto.account_number,
            holder_name: dto.holder_name,
        }
    }
}

/// Pay out a PENDING settlement, optionally to an explicit account
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSettlementDto {
    #[validate]
    pub bank_account: Option<BankAccountDto>,
    #[validate(length(min = 1, max = 256))]
    pub approved_by: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CancelSettlementDto {
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
    #[validate(length(min = 1, max = 256))]
    pub cancelled_by: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDisputeDto {
    #[validate(length(min = 1, max = 256))]
    pub reason: String,
    #[serde(default)]
    #[validate(length(max = 4000))]
    pub description: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub evidence: Vec<String>,
    pub requested_amount: Option<Decimal>,
    #[validate(length(min = 1, max = 256))]
    pub raised_by: Option<String>,
}

impl From<CreateDisputeDto> for CreateDisputeRequest {
    fn from(dto: CreateDisputeDto) -> Self {
        Self {
            reason: dto.reason,
            description: dto.description,
            evidence: dto.evidence,
            requested_amount: dto.requested_amount,
            raised_by: dto.raised_by,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpsertScheduleDto {
    pub period: PeriodType,
    /// 0 = Sunday
    #[validate(range(max = 6))]
    pub day_of_week: Option<u32>,
    #[validate(range(min = 1, max = 31))]
    pub day_of_month: Option<u32>,
    #[serde(default)]
    pub auto_process: bool,
    pub minimum_amount: Option<Decimal>,
    pub enabled: Option<bool>,
}

impl From<UpsertScheduleDto> for UpsertScheduleRequest {
    fn from(dto: UpsertScheduleDto) -> Self {
        Self {
            period: dto.period,
            day_of_week: dto.day_of_week,
            day_of_month: dto.day_of_month,
            auto_process: dto.auto_process,
            minimum_amount: dto.minimum_amount,
            enabled: dto.enabled,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetScheduleEnabledDto {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    pub format: Option<ReportFormat>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub report: HealthReport,
}
