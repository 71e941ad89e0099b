//! Record tags, classification allow-list and field parsers
//!
//! Field positions follow the EFD layout: a line `|C170|1|ITEM|...|` splits
//! on `|` into `["", "C170", "1", "ITEM", ...]`, so the tag sits at index 1
//! and the first data field at index 2.

use chrono::{Datelike, NaiveDate};

use crate::types::OperationCategory;

/// Record tags the dispatcher acts on. Every other tag is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTag {
    /// `0000` file header
    FileHeader,
    /// `0140` establishment
    Establishment,
    /// `0150` participant
    Participant,
    /// `C010` block-C establishment switch
    BlockEstablishment,
    /// `C100` document header
    DocumentHeader,
    /// `C170` document item
    DocumentItem,
    /// `C990` block-C terminator
    BlockEnd,
}

impl RecordTag {
    pub fn code(&self) -> &'static str {
        match self {
            RecordTag::FileHeader => "0000",
            RecordTag::Establishment => "0140",
            RecordTag::Participant => "0150",
            RecordTag::BlockEstablishment => "C010",
            RecordTag::DocumentHeader => "C100",
            RecordTag::DocumentItem => "C170",
            RecordTag::BlockEnd => "C990",
        }
    }

    /// Prefix check on raw bytes, before the line is decoded or split.
    pub fn from_line(line: &[u8]) -> Option<Self> {
        let line = line.strip_prefix(UTF8_BOM).unwrap_or(line);
        if line.len() < 6 || line[0] != b'|' || line[5] != b'|' {
            return None;
        }
        match &line[1..5] {
            b"0000" => Some(RecordTag::FileHeader),
            b"0140" => Some(RecordTag::Establishment),
            b"0150" => Some(RecordTag::Participant),
            b"C010" => Some(RecordTag::BlockEstablishment),
            b"C100" => Some(RecordTag::DocumentHeader),
            b"C170" => Some(RecordTag::DocumentItem),
            b"C990" => Some(RecordTag::BlockEnd),
            _ => None,
        }
    }

    /// Minimum number of split tokens for the line to be usable
    pub fn min_fields(&self) -> usize {
        match self {
            RecordTag::FileHeader => 10,
            RecordTag::Establishment => 5,
            RecordTag::Participant => 4,
            RecordTag::BlockEstablishment => 3,
            RecordTag::DocumentHeader => 11,
            RecordTag::DocumentItem => 12,
            RecordTag::BlockEnd => 2,
        }
    }
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// ==========================================================================
// Classification allow-list
// ==========================================================================

/// Category for an accepted CFOP, `None` when the code is not relevant
pub fn cfop_category(cfop: &str) -> Option<OperationCategory> {
    let code: u16 = cfop.trim().parse().ok()?;
    let category = match code {
        1407 | 1556 | 2407 | 2556 | 3556 => OperationCategory::UsoConsumo,
        1406 | 1551 | 2406 | 2551 | 3551 => OperationCategory::AtivoImobilizado,
        1251..=1257 | 2251..=2257 => OperationCategory::EnergiaEletrica,
        1301..=1306 | 2301..=2306 => OperationCategory::Comunicacao,
        1351..=1356 | 2351..=2356 => OperationCategory::Transporte,
        1651..=1653 | 2651..=2653 => OperationCategory::Combustivel,
        _ => return None,
    };
    Some(category)
}

// ==========================================================================
// Field parsers
// ==========================================================================

/// Non-empty trimmed field at `index`
pub fn field<'a>(fields: &[&'a str], index: usize) -> Option<&'a str> {
    fields
        .get(index)
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
}

/// `ddmmyyyy` date
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day = raw[0..2].parse().ok()?;
    let month = raw[2..4].parse().ok()?;
    let year = raw[4..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// First day of the date's month
pub fn competence_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Monetary field to integer cents.
///
/// Comma is the decimal separator (dots before it are grouping); a lone dot
/// is accepted as decimal point. Empty fields are zero. Extra fraction
/// digits are rounded half-up.
pub fn parse_cents(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(0);
    }

    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let normalized: String = if digits.contains(',') {
        digits.chars().filter(|c| *c != '.').collect()
    } else {
        digits.replace('.', ",")
    };

    let mut parts = normalized.splitn(2, ',');
    let whole = parts.next().unwrap_or("");
    let fraction = parts.next().unwrap_or("");

    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_bytes = fraction.as_bytes();
    let digit = |i: usize| frac_bytes.get(i).map(|b| i64::from(b - b'0')).unwrap_or(0);
    let mut cents = digit(0) * 10 + digit(1);
    if digit(2) >= 5 {
        cents += 1;
    }

    let value = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_check_accepts_known_tags_only() {
        assert_eq!(RecordTag::from_line(b"|C170|1|X|"), Some(RecordTag::DocumentItem));
        assert_eq!(RecordTag::from_line(b"|0000|006|"), Some(RecordTag::FileHeader));
        assert_eq!(RecordTag::from_line(b"\xEF\xBB\xBF|0000|006|"), Some(RecordTag::FileHeader));
        assert_eq!(RecordTag::from_line(b"|C190|000|"), None);
        assert_eq!(RecordTag::from_line(b"|9999|100|"), None);
        assert_eq!(RecordTag::from_line(b"C170|1|"), None);
        assert_eq!(RecordTag::from_line(b"|C17"), None);
    }

    #[test]
    fn test_cfop_allow_list() {
        assert_eq!(cfop_category("1556"), Some(OperationCategory::UsoConsumo));
        assert_eq!(cfop_category("2551"), Some(OperationCategory::AtivoImobilizado));
        assert_eq!(cfop_category("1253"), Some(OperationCategory::EnergiaEletrica));
        assert_eq!(cfop_category("2353"), Some(OperationCategory::Transporte));
        assert_eq!(cfop_category("1102"), None);
        assert_eq!(cfop_category("5102"), None);
        assert_eq!(cfop_category("abc"), None);
    }

    #[test]
    fn test_parse_date_day_month_year() {
        assert_eq!(parse_date("15032024"), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(parse_date("31022024"), None);
        assert_eq!(parse_date("2024-03-15"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_competence_month_is_first_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(competence_month(date), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("1500,00"), Some(150_000));
        assert_eq!(parse_cents("1500.00"), Some(150_000));
        assert_eq!(parse_cents("1.500,50"), Some(150_050));
        assert_eq!(parse_cents("270"), Some(27_000));
        assert_eq!(parse_cents("0,5"), Some(50));
        assert_eq!(parse_cents("10,005"), Some(1_001));
        assert_eq!(parse_cents("-3,10"), Some(-310));
        assert_eq!(parse_cents(""), Some(0));
        assert_eq!(parse_cents("12a,00"), None);
        assert_eq!(parse_cents(","), None);
    }
}
