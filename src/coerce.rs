//! Typed coercion of captured strings.
//!
//! A placeholder may declare a type (`{Rate:number}`) and, for dates, an
//! explicit format (`{When:datetime:dd-MM-yyyy H:mm}`). Coercion is
//! best-effort: anything that fails to parse comes back as the raw string.
//! All parsing is locale-independent - fixed decimal point, English month
//! tokens - so output is deterministic.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::expr::number_value;

static DECIMAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("valid pattern"));
static INTEGER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-+]?\d+").expect("valid pattern"));

/// Fixed battery for general date/time parsing, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%I:%M:%S %p", "%I:%M %p", "%I %p"];

/// Convert a raw captured string to a typed value.
///
/// Without a declared type the string passes through unchanged. Type keywords
/// are case-insensitive; an unrecognized keyword also passes the raw string
/// through. Numeric types fall back to the first number-looking substring
/// before giving up.
pub fn coerce(raw: &str, value_type: Option<&str>, format: Option<&str>) -> Value {
    let ty = match value_type {
        Some(t) => t.trim().to_ascii_lowercase(),
        None => return Value::String(raw.to_string()),
    };
    let trimmed = raw.trim();
    match ty.as_str() {
        "number" | "decimal" => coerce_number(raw, trimmed),
        "integer" | "int" => coerce_integer(raw, trimmed),
        "datetime" => coerce_datetime(raw, trimmed, format),
        "date" => coerce_date(raw, trimmed, format),
        "time" => coerce_time(raw, trimmed),
        _ => Value::String(raw.to_string()),
    }
}

fn coerce_number(raw: &str, trimmed: &str) -> Value {
    if let Ok(n) = trimmed.parse::<f64>() {
        return number_value(n);
    }
    if let Some(m) = DECIMAL_RE.find(trimmed) {
        if let Ok(n) = m.as_str().parse::<f64>() {
            return number_value(n);
        }
    }
    Value::String(raw.to_string())
}

fn coerce_integer(raw: &str, trimmed: &str) -> Value {
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Some(m) = INTEGER_RE.find(trimmed) {
        if let Ok(n) = m.as_str().parse::<i64>() {
            return Value::from(n);
        }
    }
    Value::String(raw.to_string())
}

fn coerce_datetime(raw: &str, trimmed: &str, format: Option<&str>) -> Value {
    let parsed = match format {
        Some(fmt) => parse_with_format(trimmed, fmt),
        None => parse_datetime_general(trimmed),
    };
    match parsed {
        Some(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => Value::String(raw.to_string()),
    }
}

fn coerce_date(raw: &str, trimmed: &str, format: Option<&str>) -> Value {
    let parsed = match format {
        Some(fmt) => parse_with_format(trimmed, fmt).map(|dt| dt.date()),
        None => parse_date_general(trimmed),
    };
    match parsed {
        Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        None => Value::String(raw.to_string()),
    }
}

fn coerce_time(raw: &str, trimmed: &str) -> Value {
    for fmt in TIME_FORMATS {
        if let Ok(t) = NaiveTime::parse_from_str(trimmed, fmt) {
            return Value::String(t.format("%H:%M:%S").to_string());
        }
    }
    Value::String(raw.to_string())
}

/// Parse `text` exactly against a declared format in date-token notation
/// (`dd-MM-yyyy H:mm`). A date-only format gets a midnight time.
pub(crate) fn parse_with_format(text: &str, fmt: &str) -> Option<NaiveDateTime> {
    let strf = format_to_strftime(fmt);
    NaiveDateTime::parse_from_str(text, &strf).ok().or_else(|| {
        NaiveDate::parse_from_str(text, &strf)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

/// General date/time parse against the fixed battery, datetimes first.
pub(crate) fn parse_datetime_general(text: &str) -> Option<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn parse_date_general(text: &str) -> Option<NaiveDate> {
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return Some(d);
        }
    }
    parse_datetime_general(text).map(|dt| dt.date())
}

/// Translate a date-token format string (`dd-MM-yyyy H:mm`) into the
/// strftime notation chrono expects. Unrecognized characters pass through as
/// literals.
pub(crate) fn format_to_strftime(fmt: &str) -> String {
    let chars: Vec<char> = fmt.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        match c {
            'y' => out.push_str(if run >= 4 { "%Y" } else { "%y" }),
            'M' => out.push_str(match run {
                r if r >= 4 => "%B",
                3 => "%b",
                _ => "%m",
            }),
            'd' => out.push_str(match run {
                r if r >= 4 => "%A",
                3 => "%a",
                _ => "%d",
            }),
            'H' => out.push_str("%H"),
            'h' => out.push_str("%I"),
            'm' => out.push_str("%M"),
            's' => out.push_str("%S"),
            't' => out.push_str("%p"),
            'f' => out.push_str("%f"),
            '%' => out.push_str("%%"),
            _ => {
                for _ in 0..run {
                    out.push(c);
                }
            }
        }
        i += run;
    }
    out
}
