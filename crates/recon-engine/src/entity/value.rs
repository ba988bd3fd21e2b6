//! Typed field values and lenient deserializers for raw CRM and local payloads

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Declared or observed type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
        }
    }

    /// Infer the type of a raw JSON value; `None` for null
    ///
    /// Strings that parse as ISO dates or timestamps are reported as such, since
    /// JSON has no native date type.
    pub fn of_json(value: &Value) -> Option<FieldType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            // The CRM renders whole-number fields as `12.0`
            Value::Number(n) if n.as_f64().is_some_and(|f| f.fract() == 0.0) => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Decimal),
            Value::String(s) => {
                if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                    Some(FieldType::Date)
                } else if parse_datetime(s).is_some() {
                    Some(FieldType::DateTime)
                } else {
                    Some(FieldType::Text)
                }
            },
            Value::Array(_) | Value::Object(_) => Some(FieldType::Text),
        }
    }

    /// Whether values observed as `observed` satisfy a field declared as `self`
    ///
    /// Text accepts date-shaped strings, decimals accept whole numbers.
    pub fn accepts(&self, observed: FieldType) -> bool {
        *self == observed
            || matches!(
                (self, observed),
                (FieldType::Decimal, FieldType::Integer)
                    | (FieldType::Text, FieldType::Date)
                    | (FieldType::Text, FieldType::DateTime)
            )
    }

    /// Whether tolerance rules can apply to this type
    pub fn is_numeric_like(&self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::Decimal | FieldType::Date | FieldType::DateTime
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Joins `name=value` pairs in a canonical record string
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// Canonical form of a null field
pub const NULL_MARKER: char = '\u{2400}';

/// A normalized field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Null, or text with nothing but whitespace
    ///
    /// Only completeness treats blank text as missing; comparisons and hashes
    /// see the text as delivered.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Numeric projection used by tolerance checks
    ///
    /// Dates project to days since the common era, timestamps to seconds since
    /// the Unix epoch.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Decimal(d) => Some(*d),
            FieldValue::Date(d) => Some(chrono::Datelike::num_days_from_ce(d) as f64),
            FieldValue::DateTime(dt) => Some(dt.timestamp_millis() as f64 / 1000.0),
            FieldValue::Null | FieldValue::Text(_) | FieldValue::Boolean(_) => None,
        }
    }

    /// Stable textual form used for hashing
    ///
    /// Fails for values with no stable representation (non-finite decimals).
    /// Text escapes the backslash, the unit separator and the null marker, so
    /// no text value renders the same as a null or spans two hashed fields.
    pub fn canonical(&self) -> Result<String, String> {
        match self {
            FieldValue::Null => Ok(NULL_MARKER.to_string()),
            FieldValue::Text(s) => Ok(escape_text(s)),
            FieldValue::Integer(i) => Ok(i.to_string()),
            FieldValue::Decimal(d) if !d.is_finite() => Err(format!("non-finite decimal {d}")),
            FieldValue::Decimal(d) if *d == 0.0 => Ok("0".to_string()),
            FieldValue::Decimal(d) => Ok(d.to_string()),
            FieldValue::Boolean(b) => Ok(b.to_string()),
            FieldValue::Date(d) => Ok(d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => Ok(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        }
    }
}

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            FIELD_SEPARATOR => out.push_str("\\u001f"),
            NULL_MARKER => out.push_str("\\u2400"),
            c => out.push(c),
        }
    }
    out
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Text(s) => f.write_str(s),
            other => match other.canonical() {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{other:?}"),
            },
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Text)
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Integer)
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Decimal)
    }
}

impl From<Option<bool>> for FieldValue {
    fn from(value: Option<bool>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Boolean)
    }
}

impl From<Option<NaiveDate>> for FieldValue {
    fn from(value: Option<NaiveDate>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Date)
    }
}

impl From<Option<DateTime<Utc>>> for FieldValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::DateTime)
    }
}

/// Parse the timestamp shapes seen in CRM and Postgres JSON output
///
/// Accepts RFC 3339, the CRM's `+0000` offset form, and naive timestamps (UTC).
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Lenient deserializers shared by the typed entity structs
///
/// Text is kept exactly as delivered. Typed fields (numbers, booleans, dates)
/// accept an empty string as null, since neither side can render one otherwise.
pub(crate) mod de {
    use super::*;
    use serde::de::Error;

    fn non_empty(value: Option<Value>) -> Option<Value> {
        match value {
            Some(Value::Null) | None => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            other => other,
        }
    }

    pub fn record_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) if !s.trim().is_empty() => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(D::Error::custom(format!("invalid primary key {other}"))),
        }
    }

    pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(D::Error::custom(format!("expected text, got {other}"))),
        }
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        match non_empty(Option::<Value>::deserialize(d)?) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected integer, got {n}"))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected integer, got '{s}'"))),
            Some(other) => Err(D::Error::custom(format!("expected integer, got {other}"))),
        }
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match non_empty(Option::<Value>::deserialize(d)?) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected decimal, got {n}"))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected decimal, got '{s}'"))),
            Some(other) => Err(D::Error::custom(format!("expected decimal, got {other}"))),
        }
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        match non_empty(Option::<Value>::deserialize(d)?) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(D::Error::custom(format!("expected boolean, got '{s}'"))),
            },
            Some(other) => Err(D::Error::custom(format!("expected boolean, got {other}"))),
        }
    }

    pub fn opt_date<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        match non_empty(Option::<Value>::deserialize(d)?) {
            None => Ok(None),
            Some(Value::String(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .or_else(|| parse_datetime(&s).map(|dt| dt.date_naive()))
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected date, got '{s}'"))),
            Some(other) => Err(D::Error::custom(format!("expected date, got {other}"))),
        }
    }

    pub fn opt_datetime<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match non_empty(Option::<Value>::deserialize(d)?) {
            None => Ok(None),
            Some(Value::String(s)) => parse_datetime(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected timestamp, got '{s}'"))),
            Some(other) => Err(D::Error::custom(format!("expected timestamp, got {other}"))),
        }
    }
}
