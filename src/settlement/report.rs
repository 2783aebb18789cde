//! Settlement statements: CSV for finance teams, JSON for everything else.

use csv::WriterBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::settlement::models::{FeeKind, Settlement, TaxKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Csv,
    #[default]
    Json,
}

impl ReportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "text/csv; charset=utf-8",
            ReportFormat::Json => "application/json",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }
}

#[derive(Serialize)]
struct ReportRow<'a> {
    section: &'static str,
    item: &'a str,
    rate: Option<Decimal>,
    base: Option<Decimal>,
    value: String,
}

impl<'a> ReportRow<'a> {
    fn summary(item: &'a str, value: impl ToString) -> Self {
        Self {
            section: "summary",
            item,
            rate: None,
            base: None,
            value: value.to_string(),
        }
    }
}

fn fee_label(kind: FeeKind) -> &'static str {
    match kind {
        FeeKind::PlatformFee => "platform_fee",
        FeeKind::ProcessingFee => "processing_fee",
        FeeKind::WithdrawalFee => "withdrawal_fee",
        FeeKind::InternationalFee => "international_fee",
    }
}

fn tax_label(kind: TaxKind) -> &'static str {
    match kind {
        TaxKind::Vat => "vat",
        TaxKind::IncomeTax => "income_tax",
        TaxKind::BusinessTax => "business_tax",
        TaxKind::WithholdingTax => "withholding_tax",
    }
}

pub fn render(settlement: &Settlement, format: ReportFormat) -> AppResult<String> {
    match format {
        ReportFormat::Csv => render_csv(settlement),
        ReportFormat::Json => render_json(settlement),
    }
}

/// Summary rows first, then one row per fee and tax line item
pub fn render_csv(settlement: &Settlement) -> AppResult<String> {
    let mut buf = Vec::new();
    {
        let mut writer = WriterBuilder::new().from_writer(&mut buf);

        let payment_id = settlement.processing.payment_id.as_deref().unwrap_or("");
        let summary = [
            ReportRow::summary("settlement_id", settlement.id),
            ReportRow::summary("user_id", &settlement.user_id),
            ReportRow::summary("user_type", settlement.user_type.as_str()),
            ReportRow::summary("period_type", settlement.period.period_type.as_str()),
            ReportRow::summary("period_start", settlement.period.start_date.to_rfc3339()),
            ReportRow::summary("period_end", settlement.period.end_date.to_rfc3339()),
            ReportRow::summary("status", settlement.status),
            ReportRow::summary("currency", &settlement.currency),
            ReportRow::summary("transactions", settlement.transaction_ids.len()),
            ReportRow::summary("gross_amount", settlement.gross_amount),
            ReportRow::summary("fees_total", settlement.fees.total),
            ReportRow::summary("taxes_total", settlement.taxes.total),
            ReportRow::summary("net_amount", settlement.net_amount),
            ReportRow::summary("payment_id", payment_id),
        ];
        for row in summary {
            writer.serialize(row)?;
        }

        for fee in &settlement.fees.items {
            writer.serialize(ReportRow {
                section: "fee",
                item: fee_label(fee.kind),
                rate: fee.rate,
                base: None,
                value: fee.amount.to_string(),
            })?;
        }

        for tax in &settlement.taxes.items {
            writer.serialize(ReportRow {
                section: "tax",
                item: tax_label(tax.kind),
                rate: Some(tax.rate),
                base: Some(tax.base),
                value: tax.amount.to_string(),
            })?;
        }

        writer.flush().map_err(csv::Error::from)?;
    }

    String::from_utf8(buf).map_err(|e| AppError::Internal(format!("CSV report is not UTF-8: {}", e)))
}

pub fn render_json(settlement: &Settlement) -> AppResult<String> {
    Ok(serde_json::to_string_pretty(settlement)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::fixtures;
    use crate::settlement::models::SettlementStatus;

    #[test]
    fn test_csv_has_summary_then_line_items() {
        let settlement = fixtures::settlement("creator-1", SettlementStatus::Completed);
        let csv = render_csv(&settlement).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "section,item,rate,base,value");
        assert_eq!(lines[1], format!("summary,settlement_id,,,{}", settlement.id));
        assert!(lines.contains(&"summary,net_amount,,,76234"));
        assert!(lines.contains(&"fee,platform_fee,0.15,,15000"));
        assert!(lines.iter().any(|l| l.starts_with("tax,income_tax,")));

        let first_fee = lines.iter().position(|l| l.starts_with("fee,")).unwrap();
        let last_summary = lines.iter().rposition(|l| l.starts_with("summary,")).unwrap();
        assert!(last_summary < first_fee);
    }

    #[test]
    fn test_csv_quotes_awkward_user_ids() {
        let settlement = fixtures::settlement("studio, \"north\"", SettlementStatus::Pending);
        let csv = render_csv(&settlement).unwrap();

        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let user_id = reader
            .records()
            .map(|r| r.unwrap())
            .find(|r| &r[1] == "user_id")
            .unwrap();
        assert_eq!(&user_id[4], "studio, \"north\"");
    }

    #[test]
    fn test_json_report_parses_back() {
        let settlement = fixtures::settlement("creator-1", SettlementStatus::Pending);
        let json = render(&settlement, ReportFormat::Json).unwrap();
        let parsed: Settlement = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settlement);
    }

    #[test]
    fn test_format_from_query_value() {
        let format: ReportFormat = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(format, ReportFormat::Csv);
        assert_eq!(format.content_type(), "text/csv; charset=utf-8");
        assert_eq!(ReportFormat::default(), ReportFormat::Json);
    }
}
