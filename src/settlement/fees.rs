use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::config::FeeConfig;
use crate::error::{AppResult, SettlementError};
use crate::settlement::models::{FeeBreakdown, FeeKind, FeeLineItem, Transaction, UserType};

/// Round a computed amount to the currency's minor unit
pub(crate) fn round_money(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

pub(crate) fn checked_rate(amount: Decimal, rate: Decimal, what: &str) -> AppResult<Decimal> {
    amount
        .checked_mul(rate)
        .ok_or_else(|| SettlementError::Calculation(format!("{} overflowed for {}", what, amount)).into())
}

pub(crate) fn checked_sum<I>(amounts: I, what: &str) -> AppResult<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    amounts.into_iter().try_fold(Decimal::ZERO, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| SettlementError::Calculation(format!("{} overflowed", what)).into())
    })
}

/// Computes the platform's deductions from a settlement's gross amount
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    config: FeeConfig,
}

impl FeeCalculator {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    pub fn base_currency(&self) -> &str {
        &self.config.base_currency
    }

    pub fn calculate(
        &self,
        gross_amount: Decimal,
        user_type: UserType,
        transactions: &[Transaction],
    ) -> AppResult<FeeBreakdown> {
        let scale = self.config.currency_scale;

        let platform_fee = round_money(
            checked_rate(gross_amount, self.config.platform_fee_rate, "platform fee")?,
            scale,
        );
        let processing_fee = round_money(
            checked_rate(gross_amount, self.config.processing_fee_rate, "processing fee")?,
            scale,
        );
        let withdrawal_fee = round_money(self.config.withdrawal_fee, scale);

        let mut items = vec![
            FeeLineItem {
                kind: FeeKind::PlatformFee,
                rate: Some(self.config.platform_fee_rate),
                amount: platform_fee,
            },
            FeeLineItem {
                kind: FeeKind::ProcessingFee,
                rate: Some(self.config.processing_fee_rate),
                amount: processing_fee,
            },
            FeeLineItem {
                kind: FeeKind::WithdrawalFee,
                rate: None,
                amount: withdrawal_fee,
            },
        ];

        let has_foreign_currency = transactions
            .iter()
            .any(|t| !t.currency.eq_ignore_ascii_case(&self.config.base_currency));

        let international_fee = if has_foreign_currency {
            let fee = round_money(
                checked_rate(gross_amount, self.config.international_fee_rate, "international fee")?,
                scale,
            );
            items.push(FeeLineItem {
                kind: FeeKind::InternationalFee,
                rate: Some(self.config.international_fee_rate),
                amount: fee,
            });
            fee
        } else {
            Decimal::ZERO
        };

        let total = checked_sum(items.iter().map(|item| item.amount), "fee total")?;

        debug!(
            "Fees for {} gross {}: platform={} processing={} withdrawal={} international={} total={}",
            user_type, gross_amount, platform_fee, processing_fee, withdrawal_fee, international_fee, total
        );

        Ok(FeeBreakdown {
            platform_fee,
            processing_fee,
            withdrawal_fee,
            international_fee,
            total,
            items,
        })
    }
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self::new(FeeConfig::default())
    }
}
