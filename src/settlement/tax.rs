use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::{AppResult, SettlementError};
use crate::settlement::fees::{checked_rate, checked_sum, round_money};
use crate::settlement::models::{FeeBreakdown, TaxBreakdown, TaxKind, TaxLineItem, TaxProfile, UserType};

/// One row of a bracket table: amounts up to and including `upper_bound` use `rate`.
/// `None` marks the open-ended top bracket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxBracket {
    pub upper_bound: Option<Decimal>,
    pub rate: Decimal,
}

pub const VAT_RATE: Decimal = dec!(0.10);

/// Personal income tax brackets, ascending
pub const PERSONAL_INCOME_BRACKETS: [TaxBracket; 5] = [
    TaxBracket { upper_bound: Some(dec!(12_000_000)), rate: dec!(0.06) },
    TaxBracket { upper_bound: Some(dec!(46_000_000)), rate: dec!(0.15) },
    TaxBracket { upper_bound: Some(dec!(88_000_000)), rate: dec!(0.24) },
    TaxBracket { upper_bound: Some(dec!(150_000_000)), rate: dec!(0.35) },
    TaxBracket { upper_bound: None, rate: dec!(0.38) },
];

/// Corporate tax brackets, ascending
pub const CORPORATE_BRACKETS: [TaxBracket; 3] = [
    TaxBracket { upper_bound: Some(dec!(200_000_000)), rate: dec!(0.10) },
    TaxBracket { upper_bound: Some(dec!(20_000_000_000)), rate: dec!(0.20) },
    TaxBracket { upper_bound: None, rate: dec!(0.22) },
];

/// Rate of the single bracket `amount` falls into.
///
/// The whole amount is taxed at that rate; this is not a marginal calculation.
pub fn bracket_rate(brackets: &[TaxBracket], amount: Decimal) -> Decimal {
    brackets
        .iter()
        .find(|bracket| bracket.upper_bound.map_or(true, |bound| amount <= bound))
        .or_else(|| brackets.last())
        .map(|bracket| bracket.rate)
        .unwrap_or(Decimal::ZERO)
}

/// Computes statutory taxes on a settlement's taxable amount
#[derive(Debug, Clone)]
pub struct TaxCalculator {
    currency_scale: u32,
}

impl TaxCalculator {
    pub fn new(currency_scale: u32) -> Self {
        Self { currency_scale }
    }

    pub fn calculate(
        &self,
        gross_amount: Decimal,
        fees: &FeeBreakdown,
        user_type: UserType,
        profile: &TaxProfile,
    ) -> AppResult<TaxBreakdown> {
        let taxable_amount = gross_amount
            .checked_sub(fees.total)
            .ok_or_else(|| SettlementError::Calculation("taxable amount overflowed".into()))?;
        // Nothing is owed on a loss; the negative net still surfaces on the settlement
        let base = taxable_amount.max(Decimal::ZERO);

        let mut items = Vec::new();
        let mut vat = Decimal::ZERO;
        let mut income_tax = Decimal::ZERO;
        let mut business_tax = Decimal::ZERO;

        match user_type {
            UserType::Influencer => {
                let rate = bracket_rate(&PERSONAL_INCOME_BRACKETS, base);
                income_tax = self.line(&mut items, TaxKind::IncomeTax, rate, base)?;
            }
            UserType::Business => {
                if profile.vat_registered {
                    vat = self.line(&mut items, TaxKind::Vat, VAT_RATE, base)?;
                }
                let brackets: &[TaxBracket] = if profile.is_corporation() {
                    &CORPORATE_BRACKETS
                } else {
                    &PERSONAL_INCOME_BRACKETS
                };
                let rate = bracket_rate(brackets, base);
                business_tax = self.line(&mut items, TaxKind::BusinessTax, rate, base)?;
            }
        }

        let withholding_tax = Decimal::ZERO;
        let total = checked_sum(items.iter().map(|item| item.amount), "tax total")?;

        debug!(
            "Taxes for {} taxable {}: vat={} income={} business={} total={}",
            user_type, taxable_amount, vat, income_tax, business_tax, total
        );

        Ok(TaxBreakdown {
            taxable_amount,
            vat,
            income_tax,
            business_tax,
            withholding_tax,
            total,
            items,
        })
    }

    fn line(
        &self,
        items: &mut Vec<TaxLineItem>,
        kind: TaxKind,
        rate: Decimal,
        base: Decimal,
    ) -> AppResult<Decimal> {
        let amount = round_money(checked_rate(base, rate, "tax")?, self.currency_scale);
        items.push(TaxLineItem {
            kind,
            rate,
            base,
            amount,
        });
        Ok(amount)
    }
}

impl Default for TaxCalculator {
    fn default() -> Self {
        Self::new(0)
    }
}
