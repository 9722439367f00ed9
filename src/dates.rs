use crate::errors::{DateError, Result};
use chrono::NaiveDate;

/// Spanish month names as published by the BCV, in calendar order.
const MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// Lowercases and strips the accents that occur in Spanish weekday and month
/// names, so matching is insensitive to both case and accent usage.
fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            'ñ' => 'n',
            _ => c,
        })
        .collect()
}

fn month_number(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|idx| idx as u32 + 1)
}

/// Parses a BCV value-date string such as `"Miércoles, 25 Junio 2025"` into a
/// calendar date. A leading weekday token (everything up to the first comma)
/// is ignored; the remainder must be `day month year`.
pub fn parse_spanish_date(text: &str) -> Result<NaiveDate> {
    let normalized = normalize(text.trim());

    // Drop the weekday prefix when present
    let without_weekday = match normalized.split_once(',') {
        Some((_, rest)) => rest,
        None => normalized.as_str(),
    };

    let tokens: Vec<&str> = without_weekday.split_whitespace().collect();
    let [day_raw, month_raw, year_raw] = tokens.as_slice() else {
        return Err(DateError::UnrecognizedFormat(text.trim().to_string()).into());
    };

    let day: u32 = day_raw
        .parse()
        .map_err(|_| DateError::UnrecognizedFormat(text.trim().to_string()))?;
    let year: i32 = year_raw
        .parse()
        .map_err(|_| DateError::UnrecognizedFormat(text.trim().to_string()))?;
    let month =
        month_number(month_raw).ok_or_else(|| DateError::UnknownMonth(month_raw.to_string()))?;

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| DateError::OutOfRange(text.trim().to_string()).into())
}
