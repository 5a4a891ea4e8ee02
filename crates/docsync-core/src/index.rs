//! Fixed-width sortable index strings
//!
//! Each indexed field renders to a fixed number of characters so the
//! concatenation of all fields of an index sorts (bytewise) like the tuple
//! of field values:
//!
//! - strings are right-padded with spaces to `maxLength`
//! - booleans become `0` / `1`
//! - numbers are clamped to `[minimum, maximum]`, offset by the floored
//!   minimum, zero-padded to the digit count of the span, then followed by
//!   the decimals implied by `multipleOf`
//!
//! Range bounds use [`IndexBound::Min`] / [`IndexBound::Max`] sentinels for
//! fields the query does not constrain.

use crate::document::DocumentData;
use crate::schema::{FieldType, Schema};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lowest character, fills open string lower bounds
pub const MIN_CHAR: char = '\u{0}';
/// Highest character, fills open string upper bounds
///
/// Index strings compare as UTF-8 bytes, so anything below `char::MAX`
/// would cut off keys outside the basic multilingual plane.
pub const MAX_CHAR: char = char::MAX;

/// One component of an index range bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexBound {
    /// Lowest possible value of the field
    Min,
    /// Highest possible value of the field
    Max,
    /// A concrete field value
    Value(Value),
}

impl IndexBound {
    /// Whether this bound is one of the open sentinels
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Min | Self::Max)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FieldEncoding {
    String {
        max_length: usize,
    },
    Boolean,
    Number {
        minimum: f64,
        maximum: f64,
        non_decimals: usize,
        decimals: usize,
    },
}

impl FieldEncoding {
    fn width(&self) -> usize {
        match self {
            Self::String { max_length } => *max_length,
            Self::Boolean => 1,
            Self::Number {
                non_decimals,
                decimals,
                ..
            } => non_decimals + decimals,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String { .. } => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Number { .. } => value.is_number(),
        }
    }

    /// Whether `value` encodes without truncation, clamping or rounding
    fn is_exact(&self, value: &Value) -> bool {
        match self {
            Self::String { max_length } => value
                .as_str()
                .is_some_and(|s| s.chars().count() <= *max_length),
            Self::Boolean => value.is_boolean(),
            Self::Number {
                minimum,
                maximum,
                decimals,
                ..
            } => value.as_f64().is_some_and(|v| {
                let scaled = (v - v.floor()) * 10f64.powi(*decimals as i32);
                (*minimum..=*maximum).contains(&v) && (scaled - scaled.round()).abs() < 1e-6
            }),
        }
    }

    fn encode(&self, value: Option<&Value>) -> String {
        match self {
            Self::String { max_length } => {
                let s = value.and_then(Value::as_str).unwrap_or("");
                pad_string(s, *max_length)
            }
            Self::Boolean => match value.and_then(Value::as_bool) {
                Some(true) => "1".to_string(),
                _ => "0".to_string(),
            },
            Self::Number { .. } => self.encode_number(value.and_then(Value::as_f64).unwrap_or(0.0)),
        }
    }

    fn encode_number(&self, value: f64) -> String {
        let Self::Number {
            minimum,
            maximum,
            non_decimals,
            decimals,
        } = self
        else {
            return String::new();
        };
        let value = value.clamp(*minimum, *maximum);
        let whole = (value.floor() - minimum) as u64;
        let mut out = format!("{whole:0width$}", width = *non_decimals);
        if *decimals > 0 {
            let scale = 10u64.pow(*decimals as u32);
            let fraction = ((value - value.floor()) * scale as f64).round() as u64;
            let fraction = fraction.min(scale - 1);
            out.push_str(&format!("{fraction:0width$}", width = *decimals));
        }
        out
    }

    fn bound(&self, bound: &IndexBound) -> String {
        match (self, bound) {
            (Self::String { max_length }, IndexBound::Min) => {
                std::iter::repeat_n(MIN_CHAR, *max_length).collect()
            }
            (Self::String { max_length }, IndexBound::Max) => {
                std::iter::repeat_n(MAX_CHAR, *max_length).collect()
            }
            (Self::Boolean, IndexBound::Min) => "0".to_string(),
            (Self::Boolean, IndexBound::Max) => "1".to_string(),
            (Self::Number { .. }, IndexBound::Min) => "0".repeat(self.width()),
            (Self::Number { .. }, IndexBound::Max) => "9".repeat(self.width()),
            (_, IndexBound::Value(value)) => self.encode(Some(value)),
        }
    }
}

fn pad_string(s: &str, max_length: usize) -> String {
    let mut out: String = s.chars().take(max_length).collect();
    let len = out.chars().count();
    out.extend(std::iter::repeat_n(' ', max_length - len));
    out
}

/// Renders documents and range bounds of one index as sortable strings
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEncoder {
    fields: Vec<String>,
    encodings: Vec<FieldEncoding>,
}

impl IndexEncoder {
    /// Build the encoder for `fields` of `schema`
    pub fn new(schema: &Schema, fields: &[String]) -> Result<Self> {
        let encodings = fields
            .iter()
            .map(|field| {
                let def = schema
                    .field(field)
                    .ok_or_else(|| Error::schema(format!("unknown index field '{field}'")))?;
                match def.field_type {
                    Some(FieldType::String) => Ok(FieldEncoding::String {
                        max_length: def.max_length.ok_or_else(|| {
                            Error::schema(format!("index field '{field}' has no maxLength"))
                        })?,
                    }),
                    Some(FieldType::Boolean) => Ok(FieldEncoding::Boolean),
                    Some(FieldType::Number) | Some(FieldType::Integer) => {
                        let (Some(min), Some(max)) = (def.minimum, def.maximum) else {
                            return Err(Error::schema(format!(
                                "index field '{field}' has no numeric range"
                            )));
                        };
                        let minimum = min.floor();
                        let maximum = max.ceil();
                        let non_decimals = format!("{}", (maximum - minimum) as u64).len();
                        let decimals = def
                            .multiple_of
                            .map(|step| {
                                let rendered = format!("{step}");
                                rendered.split_once('.').map_or(0, |(_, frac)| frac.len())
                            })
                            .unwrap_or(0);
                        Ok(FieldEncoding::Number {
                            minimum,
                            maximum,
                            non_decimals,
                            decimals,
                        })
                    }
                    other => Err(Error::schema(format!(
                        "index field '{field}' has unindexable type {other:?}"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            fields: fields.to_vec(),
            encodings,
        })
    }

    /// Indexed fields, in order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Total width of an index string, in characters
    pub fn width(&self) -> usize {
        self.encodings.iter().map(FieldEncoding::width).sum()
    }

    /// Whether `value` can be used as a concrete bound for field `position`
    pub fn accepts(&self, position: usize, value: &Value) -> bool {
        self.encodings
            .get(position)
            .is_some_and(|encoding| encoding.accepts(value))
    }

    /// Whether `value` as a bound for field `position` selects exactly the
    /// documents holding it
    ///
    /// Strings longer than `maxLength`, numbers outside the declared range
    /// and numbers finer than `multipleOf` collapse onto neighbouring
    /// stored values.
    pub fn is_exact(&self, position: usize, value: &Value) -> bool {
        self.encodings
            .get(position)
            .is_some_and(|encoding| encoding.is_exact(value))
    }

    /// Index string of a stored document
    pub fn encode(&self, doc: &DocumentData) -> String {
        self.fields
            .iter()
            .zip(&self.encodings)
            .map(|(field, encoding)| encoding.encode(doc.get_path(field).as_deref()))
            .collect()
    }

    /// Index string of a range bound; missing trailing keys count as `Min`
    pub fn lower_bound(&self, keys: &[IndexBound]) -> String {
        self.bound(keys, IndexBound::Min)
    }

    /// Index string of a range bound; missing trailing keys count as `Max`
    pub fn upper_bound(&self, keys: &[IndexBound]) -> String {
        self.bound(keys, IndexBound::Max)
    }

    fn bound(&self, keys: &[IndexBound], fill: IndexBound) -> String {
        self.encodings
            .iter()
            .enumerate()
            .map(|(i, encoding)| encoding.bound(keys.get(i).unwrap_or(&fill)))
            .collect()
    }
}
