use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::{fmt, str::FromStr, sync::Arc};
use thiserror::Error;

/// External reference id: the remote server's stable identity for a point or
/// entity, independent of local naming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HsRef(Arc<str>);

impl HsRef {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Parse a ref from user input, tolerating the `@` display prefix.
    pub fn parse(s: &str) -> Self {
        Self(Arc::from(s.strip_prefix('@').unwrap_or(s)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A strongly-typed scalar decoded once at the protocol boundary.
///
/// The remote protocol's wire encoding is owned by the client implementation;
/// everything above that boundary works on this closed set of variants rather
/// than dispatching on kind strings.
#[derive(Clone, Debug, PartialEq)]
pub enum HsValue {
    Bool(bool),
    Num { val: f64, unit: Option<Arc<str>> },
    Str(Arc<str>),
    Ref(HsRef),
    Uri(Arc<str>),
    Marker,
    Remove,
    Date(NaiveDate),
    Time(NaiveTime),
    /// Unix milliseconds plus the remote zone's UTC offset in seconds.
    DateTime {
        ms: i64,
        tz_offset_secs: i32,
        tz: Option<Arc<str>>,
    },
}

impl HsValue {
    pub fn num(val: f64) -> Self {
        Self::Num { val, unit: None }
    }

    pub fn num_with_unit(val: f64, unit: impl Into<Arc<str>>) -> Self {
        Self::Num {
            val,
            unit: Some(unit.into()),
        }
    }

    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Num { .. } => "number",
            Self::Str(_) => "str",
            Self::Ref(_) => "ref",
            Self::Uri(_) => "uri",
            Self::Marker => "marker",
            Self::Remove => "remove",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::DateTime { .. } => "dateTime",
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker)
    }

    pub fn as_ref_id(&self) -> Option<&HsRef> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Num { val, .. } => Some(*val),
            _ => None,
        }
    }

    /// Convert to the local tree's value space: numbers stay numbers, bools
    /// stay bools, date-times render with their original zone offset, and
    /// everything else falls back to its display text.
    pub fn to_tree_value(&self) -> TreeValue {
        match self {
            Self::Bool(b) => TreeValue::Bool(*b),
            Self::Num { val, .. } => TreeValue::Number(*val),
            Self::DateTime {
                ms,
                tz_offset_secs,
                ..
            } => TreeValue::String(format_datetime(*ms, *tz_offset_secs)),
            other => TreeValue::String(other.to_string()),
        }
    }
}

impl fmt::Display for HsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Num { val, unit: None } => write!(f, "{val}"),
            Self::Num {
                val,
                unit: Some(u),
            } => write!(f, "{val}{u}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Ref(r) => write!(f, "{r}"),
            Self::Uri(u) => write!(f, "{u}"),
            Self::Marker => write!(f, "marker"),
            Self::Remove => write!(f, "remove"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Self::DateTime {
                ms,
                tz_offset_secs,
                ..
            } => write!(f, "{}", format_datetime(*ms, *tz_offset_secs)),
        }
    }
}

/// Render a date-time as local wall-clock text with an explicit offset
/// suffix, `Z` when the offset is zero.
fn format_datetime(ms: i64, tz_offset_secs: i32) -> String {
    let shifted = ms + i64::from(tz_offset_secs) * 1000;
    let base = DateTime::<Utc>::from_timestamp_millis(shifted).unwrap_or_default();
    let mut out = if ms % 1000 == 0 {
        base.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        base.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    };
    if tz_offset_secs == 0 {
        out.push('Z');
    } else {
        let mut offset = tz_offset_secs;
        if offset < 0 {
            out.push('-');
            offset = -offset;
        } else {
            out.push('+');
        }
        let zh = offset / 3600;
        let zm = (offset % 3600) / 60;
        out.push_str(&format!("{zh:02}{zm:02}"));
    }
    out
}

/// Value space of the local node tree.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl TreeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for TreeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Error converting a tree value into a protocol value of a declared kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueCastError {
    #[error("unknown value kind: {0}")]
    UnknownKind(String),
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("failed to parse {target} from: {value}")]
    ParseError {
        target: &'static str,
        value: String,
    },
}

/// Declared kind of a writable point, decoded from a row's `kind` cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Number,
    Str,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Number => "number",
            Self::Str => "str",
        }
    }

    /// Coerce a tree value into a protocol value of this kind.
    pub fn coerce(&self, value: &TreeValue) -> Result<HsValue, ValueCastError> {
        match self {
            Self::Bool => match value {
                TreeValue::Bool(b) => Ok(HsValue::Bool(*b)),
                TreeValue::Number(n) => Ok(HsValue::Bool(*n != 0.0)),
                TreeValue::String(s) => match s.trim() {
                    "true" => Ok(HsValue::Bool(true)),
                    "false" => Ok(HsValue::Bool(false)),
                    other => Err(ValueCastError::ParseError {
                        target: "bool",
                        value: other.to_string(),
                    }),
                },
            },
            Self::Number => match value {
                TreeValue::Number(n) => Ok(HsValue::num(*n)),
                TreeValue::Bool(_) => Err(ValueCastError::TypeMismatch {
                    expected: "number",
                    actual: "bool",
                }),
                TreeValue::String(s) => {
                    let (val, unit) = parse_number_with_unit(s)?;
                    Ok(match unit {
                        Some(u) => HsValue::num_with_unit(val, u),
                        None => HsValue::num(val),
                    })
                }
            },
            Self::Str => Ok(HsValue::str(value.to_string())),
        }
    }
}

impl FromStr for ValueKind {
    type Err = ValueCastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(Self::Bool),
            "number" => Ok(Self::Number),
            "str" => Ok(Self::Str),
            other => Err(ValueCastError::UnknownKind(other.to_string())),
        }
    }
}

/// Split user input like `72.5 °F` into a numeric value and an optional unit.
pub fn parse_number_with_unit(s: &str) -> Result<(f64, Option<String>), ValueCastError> {
    let mut num = String::new();
    let mut unit = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' || (c == '-' && num.is_empty() && unit.is_empty()) {
            num.push(c);
        } else if c != ' ' {
            unit.push(c);
        }
    }
    let val = num
        .parse::<f64>()
        .map_err(|_| ValueCastError::ParseError {
            target: "number",
            value: s.to_string(),
        })?;
    let unit = if unit.is_empty() { None } else { Some(unit) };
    Ok((val, unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_parse_strips_display_prefix() {
        assert_eq!(HsRef::parse("@site.a").as_str(), "site.a");
        assert_eq!(HsRef::parse("site.a").as_str(), "site.a");
        assert_eq!(HsRef::parse("@x").to_string(), "@x");
    }

    #[test]
    fn tree_value_conversion_table() {
        assert_eq!(HsValue::num(1.5).to_tree_value(), TreeValue::Number(1.5));
        assert_eq!(HsValue::Bool(true).to_tree_value(), TreeValue::Bool(true));
        assert_eq!(
            HsValue::Marker.to_tree_value(),
            TreeValue::String("marker".into())
        );
        assert_eq!(
            HsValue::Ref(HsRef::new("a")).to_tree_value(),
            TreeValue::String("@a".into())
        );
    }

    #[test]
    fn datetime_renders_offset_suffix() {
        let utc = HsValue::DateTime {
            ms: 0,
            tz_offset_secs: 0,
            tz: None,
        };
        assert_eq!(utc.to_tree_value(), TreeValue::String("1970-01-01T00:00:00Z".into()));

        let ny = HsValue::DateTime {
            ms: 0,
            tz_offset_secs: -5 * 3600,
            tz: Some("New_York".into()),
        };
        assert_eq!(
            ny.to_tree_value(),
            TreeValue::String("1969-12-31T19:00:00-0500".into())
        );
    }

    #[test]
    fn kind_coercion() {
        let kind: ValueKind = "number".parse().unwrap();
        assert_eq!(
            kind.coerce(&TreeValue::Number(72.5)).unwrap(),
            HsValue::num(72.5)
        );
        assert_eq!(
            kind.coerce(&TreeValue::String("72.5 °F".into())).unwrap(),
            HsValue::num_with_unit(72.5, "°F")
        );
        assert!(ValueKind::from_str("grid").is_err());

        let kind: ValueKind = "bool".parse().unwrap();
        assert_eq!(
            kind.coerce(&TreeValue::String("true".into())).unwrap(),
            HsValue::Bool(true)
        );
    }
}
