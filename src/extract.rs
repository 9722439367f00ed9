use crate::errors::{ExtractError, Result};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Container the BCV renders the USD reference rate into.
pub const RATE_CONTAINER: &str = "#dolar";
/// Emphasized value element inside the rate container.
pub const RATE_VALUE: &str = "#dolar strong";
/// Element carrying the value date ("Miércoles, 25 Junio 2025").
pub const VALUE_DATE: &str = "span.date-display-single";

static RATE_CONTAINER_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse(RATE_CONTAINER).unwrap());
static RATE_VALUE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse(RATE_VALUE).unwrap());
static VALUE_DATE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse(VALUE_DATE).unwrap());

/// HTML fragments kept alongside each record for diagnosis. Not consumed by
/// any logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawFragments {
    pub dolar_div_html: Option<String>,
    pub date_element_html: Option<String>,
}

/// Extracts the published USD rate from the page.
///
/// The source renders a locale-formatted decimal (comma as the decimal
/// separator, no thousands grouping, 2 to 8 fractional digits). The full
/// precision is preserved here; rounding to the stored scale happens at
/// persistence time.
pub fn extract_rate(html: &str) -> Result<Decimal> {
    let document = Html::parse_document(html);

    let value = document
        .select(&RATE_VALUE_SEL)
        .next()
        .ok_or(ExtractError::NotFound(RATE_VALUE))?;

    let raw: String = value.text().collect();
    let raw = raw.trim();

    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();

    let rate = Decimal::from_str(&cleaned)
        .map_err(|_| ExtractError::InvalidRate(raw.to_string()))?;

    if rate <= Decimal::ZERO {
        return Err(ExtractError::InvalidRate(raw.to_string()).into());
    }

    Ok(rate)
}

/// Extracts the raw value-date text from the page. Parsing the text into a
/// calendar date is the date module's job.
pub fn extract_value_date_text(html: &str) -> Result<String> {
    let document = Html::parse_document(html);

    let element = document
        .select(&VALUE_DATE_SEL)
        .next()
        .ok_or(ExtractError::NotFound(VALUE_DATE))?;

    let text: String = element.text().collect();
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ExtractError::NotFound(VALUE_DATE).into());
    }

    Ok(text)
}

/// Captures the rate container and date element fragments for the record's
/// debug payload. Missing fragments are left as `None` rather than failing;
/// the fragments are never load-bearing.
pub fn extract_raw_fragments(html: &str) -> RawFragments {
    let document = Html::parse_document(html);

    RawFragments {
        dolar_div_html: document
            .select(&RATE_CONTAINER_SEL)
            .next()
            .map(|el| el.inner_html()),
        date_element_html: document
            .select(&VALUE_DATE_SEL)
            .next()
            .map(|el| el.inner_html()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(rate: &str, date: &str) -> String {
        format!(
            r#"<html><body>
            <div class="view-tipo-de-cambio-oficial">
              <span class="date-display-single">{date}</span>
              <div id="dolar"><div class="centrado"><strong> {rate} </strong></div></div>
            </div>
            </body></html>"#
        )
    }

    #[test]
    fn test_extract_rate_long_fraction() {
        let html = page("105,45270000", "Miércoles, 25 Junio 2025");
        assert_eq!(
            extract_rate(&html).unwrap(),
            Decimal::from_str("105.45270000").unwrap()
        );
    }

    #[test]
    fn test_extract_rate_two_decimals() {
        let html = page("75,99", "Lunes, 3 Marzo 2025");
        assert_eq!(extract_rate(&html).unwrap(), Decimal::from_str("75.99").unwrap());
    }

    #[test]
    fn test_extract_rate_strips_inner_spaces() {
        let html = page("  36,42 ", "Lunes, 3 Marzo 2025");
        assert_eq!(extract_rate(&html).unwrap(), Decimal::from_str("36.42").unwrap());
    }

    #[test]
    fn test_extract_rate_missing_container() {
        let err = extract_rate("<html><body><p>mantenimiento</p></body></html>").unwrap_err();
        assert!(err.is_extract());
        assert!(err.to_string().contains("#dolar strong"));
    }

    #[test]
    fn test_extract_rate_non_numeric() {
        let html = page("N/D", "Lunes, 3 Marzo 2025");
        let err = extract_rate(&html).unwrap_err();
        assert!(err.is_extract());
        assert!(err.to_string().contains("N/D"));
    }

    #[test]
    fn test_extract_rate_rejects_non_positive() {
        let html = page("0,00", "Lunes, 3 Marzo 2025");
        assert!(extract_rate(&html).is_err());

        let html = page("-1,50", "Lunes, 3 Marzo 2025");
        assert!(extract_rate(&html).is_err());
    }

    #[test]
    fn test_extract_value_date_text() {
        let html = page("105,4527", "Miércoles, 25 Junio 2025");
        assert_eq!(
            extract_value_date_text(&html).unwrap(),
            "Miércoles, 25 Junio 2025"
        );
    }

    #[test]
    fn test_extract_value_date_missing() {
        let err = extract_value_date_text("<html><body></body></html>").unwrap_err();
        assert!(err.is_extract());
    }

    #[test]
    fn test_raw_fragments_best_effort() {
        let html = page("105,4527", "Miércoles, 25 Junio 2025");
        let fragments = extract_raw_fragments(&html);
        assert!(fragments.dolar_div_html.is_some());
        assert!(fragments.date_element_html.is_some());

        let empty = extract_raw_fragments("<html></html>");
        assert!(empty.dolar_div_html.is_none());
        assert!(empty.date_element_html.is_none());
    }
}
