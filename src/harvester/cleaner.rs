use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

// Dates

const DATE_FORMATS: [&str; 4] = ["%Y/%m/%d", "%Y-%m-%d", "%Y年%m月%d日", "%Y.%m.%d"];

/// Parse listing dates: "2024/02/01", "2024-02-01", "2024年2月1日"
pub fn parse_listing_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// "15:00" | "9:30" | "15:00:12"
pub fn parse_listing_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Combine a date cell and an optional time cell. When there is no separate
/// time cell the date cell may carry both ("2024/02/01 15:00"). A missing or
/// unparseable time falls back to midnight; a bad date is `None`.
pub fn parse_listing_datetime(date_cell: &str, time_cell: Option<&str>) -> Option<NaiveDateTime> {
    let date_cell = normalize_digits(date_cell);
    let mut parts = date_cell.split_whitespace();
    let date = parse_listing_date(parts.next()?)?;

    let time = match time_cell {
        Some(t) => parse_listing_time(&normalize_digits(t)),
        None => parts.next().and_then(parse_listing_time),
    };

    Some(date.and_time(time.unwrap_or(NaiveTime::MIN)))
}

// Text

/// Fold full-width digits to ASCII: "２０２４" → "2024"
pub fn normalize_digits(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            _ => c,
        })
        .collect()
}

/// Digits folded to ASCII, whitespace (incl. ideographic spaces) collapsed.
pub fn normalize_title(s: &str) -> String {
    normalize_digits(s).split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Securities code: trimmed, upper-cased, 4-5 alphanumerics. "12340" | "130A"
pub fn normalize_code(s: &str) -> Option<String> {
    let code = normalize_digits(s.trim()).to_uppercase();
    let valid = (4..=5).contains(&code.chars().count())
        && code.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(code)
}

// Scaled amounts

/// Every unit suffix the listings use, longest first so "百万" wins over "万".
const UNIT_SUFFIXES: [(&str, f64); 9] = [
    ("百万", 1e6),
    ("兆", 1e12),
    ("億", 1e8),
    ("万", 1e4),
    ("千", 1e3),
    ("T", 1e12),
    ("B", 1e9),
    ("M", 1e6),
    ("K", 1e3),
];

/// Parse an amount with an optional unit suffix.
/// "1.2M" → 1,200,000 | "3億円" → 300,000,000 | "1,234百万" → 1,234,000,000
pub fn parse_scaled_amount(s: &str) -> Option<f64> {
    let s = normalize_digits(s.trim()).replace([',', '，'], "");
    let s = s.trim_end_matches('円').trim().to_uppercase();

    if s.is_empty() || s == "N/A" || s == "-" || s == "—" {
        return None;
    }

    let (num_str, multiplier) = UNIT_SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|rest| (rest, *mult)))
        .unwrap_or((s.as_str(), 1.0));

    let num: f64 = num_str.trim().parse().ok()?;
    Some(num * multiplier)
}
