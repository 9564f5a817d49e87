use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value;

/// Category a declared column type falls into. `Others` is never a
/// validation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Number,
    DateTime,
    Others,
}

/// How a string value's size is measured against `max_length`:
/// UTF-8 byte count or character count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCriterion {
    Bytes,
    Chars,
}

/// Outcome of validating a single value against a column's rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    NoError,
    LengthOver,
    NotNumber,
    IntegerOver,
    DecimalOver,
    NotPermittedNull,
    NotDateTime,
    DetectMultiByteChar,
    NotDefinedError,
}

impl RuleKind {
    pub fn message(&self) -> &'static str {
        match self {
            RuleKind::NoError => "No Error",
            RuleKind::LengthOver => "Character Length Overflow",
            RuleKind::NotNumber => "Not Number",
            RuleKind::IntegerOver => "Number of Digits of Integer Part Exceeded",
            RuleKind::DecimalOver => "Number of Digits of Decimal Part Exceeded",
            RuleKind::NotPermittedNull => "Null Not Permitted",
            RuleKind::NotDateTime => "Not DateTime",
            RuleKind::DetectMultiByteChar => "Multi-Byte Character Detected",
            RuleKind::NotDefinedError => "Unknown Error",
        }
    }
}

/// One validation or operation failure. Immutable once built; `"-"`
/// stands in for a missing column name or value.
#[derive(Debug, Clone)]
pub struct RowError {
    pub name: String,
    pub value: String,
    pub kind: RuleKind,
    custom_message: Option<String>,
}

impl RowError {
    pub fn new(name: impl Into<String>, value: impl Into<String>, kind: RuleKind) -> Self {
        RowError {
            name: name.into(),
            value: value.into(),
            kind,
            custom_message: None,
        }
    }

    /// Generic operational failure with a caller-supplied message.
    pub fn custom(message: impl Into<String>) -> Self {
        RowError {
            name: "-".into(),
            value: "-".into(),
            kind: RuleKind::NotDefinedError,
            custom_message: Some(message.into()),
        }
    }

    pub fn for_column(name: impl Into<String>, message: impl Into<String>) -> Self {
        RowError {
            name: name.into(),
            value: "-".into(),
            kind: RuleKind::NotDefinedError,
            custom_message: Some(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        match &self.custom_message {
            Some(m) => m,
            None => self.kind.message(),
        }
    }
}

/// Metadata for one table column: type category, size budgets, nullability
/// and primary-key flag. Derived once at model construction and immutable
/// thereafter. `max_integer`/`max_decimal` are -1 unless the column is a
/// Number; `max_length` is -1 for `Others`.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub max_length: i64,
    pub max_integer: i64,
    pub max_decimal: i64,
    pub column_type: ColumnType,
    pub is_primary_key: bool,
    pub is_nullable: bool,
    pub size_criterion: SizeCriterion,
    pub allow_multi_byte: bool,
}

impl Column {
    pub fn new(
        name: impl Into<String>,
        max_length: i64,
        max_integer: i64,
        max_decimal: i64,
        column_type: ColumnType,
        is_primary_key: bool,
        is_nullable: bool,
    ) -> Self {
        Column {
            name: name.into(),
            max_length,
            max_integer,
            max_decimal,
            column_type,
            is_primary_key,
            is_nullable,
            size_criterion: SizeCriterion::Bytes,
            // Multi-byte text is fine by default for string columns only.
            allow_multi_byte: column_type == ColumnType::String,
        }
    }

    /// Validate a raw value against this column's rules.
    ///
    /// A null on a nullable column passes without further checks; size and
    /// format rules only ever apply to the matching type category.
    pub fn validate(&self, value: &Value) -> RuleKind {
        if matches!(value, Value::Null) {
            return if self.is_nullable {
                RuleKind::NoError
            } else {
                RuleKind::NotPermittedNull
            };
        }

        let text = text_of(value);

        match self.column_type {
            ColumnType::String => {
                let size = match self.size_criterion {
                    SizeCriterion::Bytes => text.len(),
                    SizeCriterion::Chars => text.chars().count(),
                };
                if size as i64 > self.max_length {
                    return RuleKind::LengthOver;
                }
                if !self.allow_multi_byte && text.len() != text.chars().count() {
                    return RuleKind::DetectMultiByteChar;
                }
                RuleKind::NoError
            }
            ColumnType::Number => {
                // Empty text on a non-null value: nothing to verify.
                if text.is_empty() {
                    return RuleKind::NoError;
                }
                if !is_decimal_text(&text) {
                    return RuleKind::NotNumber;
                }
                match text.find('.') {
                    None => {
                        // Whole number: digit count of the absolute value.
                        if integer_digits(&text) as i64 > self.max_integer {
                            return RuleKind::IntegerOver;
                        }
                        RuleKind::NoError
                    }
                    Some(dot) => {
                        // Fractional number: the integer part is measured as
                        // floor of the absolute value, the fraction as the
                        // raw digit run after the point.
                        if integer_digits(&text[..dot]) as i64 > self.max_integer {
                            return RuleKind::IntegerOver;
                        }
                        if (text.len() - dot - 1) as i64 > self.max_decimal {
                            return RuleKind::DecimalOver;
                        }
                        RuleKind::NoError
                    }
                }
            }
            ColumnType::DateTime => {
                if parse_datetime(&text).is_some() {
                    RuleKind::NoError
                } else {
                    RuleKind::NotDateTime
                }
            }
            ColumnType::Others => RuleKind::NoError,
        }
    }

    /// Render a value as an SQL literal for this column. Nulls and values
    /// that fail validation render as the literal `null`.
    pub fn sql_value(&self, value: &Value) -> String {
        if matches!(value, Value::Null) {
            return "null".into();
        }
        if self.validate(value) != RuleKind::NoError {
            return "null".into();
        }

        let text = text_of(value);

        match self.column_type {
            ColumnType::String => sql_quote(&text),
            ColumnType::DateTime => match parse_datetime(&text) {
                Some(dt) => sql_quote(&dt.format("%Y-%m-%d %H:%M:%S").to_string()),
                None => "null".into(),
            },
            // Numbers: strip thousands-separator commas and pass through.
            _ => text.replace(',', ""),
        }
    }

    /// `(name = <literal>)`, or without the parentheses for SET clauses.
    pub fn sql_formula(&self, value: &Value, add_brackets: bool) -> String {
        let (open, close) = if add_brackets { ("(", ")") } else { ("", "") };
        format!("{}{} = {}{}", open, self.name, self.sql_value(value), close)
    }
}

/// String form of a raw value; null renders as the empty string.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(t) => t.clone(),
        Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// Quote a string literal, doubling embedded quote characters.
pub(crate) fn sql_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Decimal-ish text: optional sign, ASCII digits with optional
/// thousands-separator commas, at most one decimal point. A non-empty
/// integer part must carry at least one digit and cannot end on a
/// separator, so bare or trailing commas do not pass as numbers.
fn is_decimal_text(text: &str) -> bool {
    let t = text.strip_prefix(['-', '+']).unwrap_or(text);
    if t.is_empty() {
        return false;
    }
    let (int_part, frac_part) = match t.split_once('.') {
        Some((i, f)) => (i, f),
        None => (t, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return false;
    }
    if !int_part.is_empty()
        && (!int_part.chars().any(|c| c.is_ascii_digit()) || int_part.ends_with(','))
    {
        return false;
    }
    int_part.chars().all(|c| c.is_ascii_digit() || c == ',')
        && frac_part.chars().all(|c| c.is_ascii_digit())
}

/// Decimal digit count of the absolute value of an integer-part string:
/// sign, separator commas and leading zeros do not count, zero counts as
/// one digit.
fn integer_digits(text: &str) -> usize {
    let t = text.strip_prefix(['-', '+']).unwrap_or(text);
    let digits: String = t.chars().filter(|c| c.is_ascii_digit()).collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        1
    } else {
        trimmed.len()
    }
}

/// Lenient date/time parse covering the formats the layer accepts as
/// user input or reads back from SQLite.
pub(crate) fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M",
    ];
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

    let text = text.trim();
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
