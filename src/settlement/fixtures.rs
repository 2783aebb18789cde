//! Builders shared by unit tests

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::settlement::fees::FeeCalculator;
use crate::settlement::models::*;
use crate::settlement::tax::TaxCalculator;

pub fn transaction(user_id: &str, amount: Decimal, currency: &str, occurred_at: DateTime<Utc>) -> Transaction {
    Transaction {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        amount,
        currency: currency.to_string(),
        occurred_at,
    }
}

/// A 100,000 KRW influencer settlement with default fees and taxes
pub fn settlement(user_id: &str, status: SettlementStatus) -> Settlement {
    let now = Utc::now();
    let gross = dec!(100000);
    let txs = vec![transaction(user_id, gross, "KRW", now - Duration::hours(1))];
    let fees = FeeCalculator::default()
        .calculate(gross, UserType::Influencer, &txs)
        .unwrap();
    let taxes = TaxCalculator::default()
        .calculate(gross, &fees, UserType::Influencer, &TaxProfile {
            vat_registered: false,
            corporate_type: None,
        })
        .unwrap();
    let net_amount = gross - fees.total - taxes.total;

    Settlement {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        user_type: UserType::Influencer,
        period: SettlementPeriod {
            period_type: PeriodType::Daily,
            start_date: now - Duration::days(1),
            end_date: now,
        },
        transaction_ids: txs.into_iter().map(|t| t.id).collect(),
        currency: "KRW".to_string(),
        gross_amount: gross,
        fees,
        taxes,
        net_amount,
        status,
        processing: ProcessingInfo::default(),
        audit: AuditInfo {
            created_by: "test".to_string(),
            ..AuditInfo::default()
        },
        metadata: SettlementMetadata::default(),
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn schedule(user_id: &str, next_scheduled: DateTime<Utc>) -> SettlementSchedule {
    SettlementSchedule {
        user_id: user_id.to_string(),
        period: PeriodType::Daily,
        day_of_week: 1,
        day_of_month: 1,
        auto_process: false,
        minimum_amount: Decimal::ZERO,
        enabled: true,
        next_scheduled,
        last_processed: None,
        created_at: next_scheduled,
        updated_at: next_scheduled,
    }
}
