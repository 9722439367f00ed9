use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One scraped exchange-rate observation. Rows are append-only: created once
/// per successful scrape, never updated by this service.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "bcv_exchange_rates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(column_type = "Decimal(Some((10, 4)))")]
    pub usd_rate: Decimal,
    pub value_date: Date,
    pub scraped_at: DateTime,
    pub currency_code: String,
    pub source_url: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub raw_data: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Display form of the rate: two decimals, comma decimal separator,
    /// period thousands separator, `Bs.` suffix.
    pub fn formatted_rate(&self) -> String {
        format_bs(&self.usd_rate)
    }
}

/// Formats a rate the way Venezuelan amounts are displayed, e.g.
/// `1234.5` -> `"1.234,50 Bs."`.
pub fn format_bs(rate: &Decimal) -> String {
    let rounded = rate.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let text = rounded.abs().to_string();
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), format!("{:0<2}", f)),
        None => (text, "00".to_string()),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (idx, c) in digits.iter().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(*c);
    }

    let sign = if rounded.is_sign_negative() { "-" } else { "" };
    format!("{sign}{grouped},{frac_part} Bs.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_format_bs_rounds_to_two_decimals() {
        let rate = Decimal::from_str("105.4527").unwrap();
        assert_eq!(format_bs(&rate), "105,45 Bs.");
    }

    #[test]
    fn test_format_bs_pads_fraction() {
        let rate = Decimal::from_str("36.5").unwrap();
        assert_eq!(format_bs(&rate), "36,50 Bs.");
    }

    #[test]
    fn test_format_bs_thousands_grouping() {
        let rate = Decimal::from_str("1234567.891").unwrap();
        assert_eq!(format_bs(&rate), "1.234.567,89 Bs.");
    }

    #[test]
    fn test_format_bs_small_value() {
        let rate = Decimal::from_str("0.99").unwrap();
        assert_eq!(format_bs(&rate), "0,99 Bs.");
    }
}
