//! Values and the total order over them.
//!
//! A value is one of null, boolean, finite number, UTF-8 string, or nested
//! JSON (arrays and objects of values). Values are structurally shared and
//! immutable once frozen; the engine passes them by reference through the
//! operator graph without copying.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single column value.
///
/// Numbers are finite by construction: the freeze helpers reject NaN and
/// infinities, so `PartialEq` and `compare_values` are total over frozen
/// values. Comparing values of distinct non-null types is a programmer
/// error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<Vec<Value>>),
    Object(Rc<BTreeMap<Box<str>, Value>>),
}

// Numbers are finite by construction.
impl Eq for Value {}

/// Freezing rejects what the engine cannot admit into a row.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FreezeError {
    /// An absent value. Only `freeze_allow_undefined` admits one, and only
    /// as its top-level argument.
    #[error("cannot freeze an absent value")]
    Undefined,
    /// NaN or an infinity.
    #[error("cannot freeze a non-finite number")]
    NonFinite,
}

/// Converts a JSON value into a frozen [`Value`].
///
/// The absent value (`None`) is rejected; use [`freeze_allow_undefined`]
/// where absence is legal. Non-finite numbers are rejected at every depth.
pub fn freeze(value: Option<serde_json::Value>) -> Result<Value, FreezeError> {
    value.map_or(Err(FreezeError::Undefined), freeze_json)
}

/// Variant of [`freeze`] that admits the absent value, but only as the
/// top-level argument.
pub fn freeze_allow_undefined(
    value: Option<serde_json::Value>,
) -> Result<Option<Value>, FreezeError> {
    value.map(freeze_json).transpose()
}

fn freeze_json(value: serde_json::Value) -> Result<Value, FreezeError> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => Ok(Value::Number(f)),
            _ => Err(FreezeError::NonFinite),
        },
        serde_json::Value::String(s) => Ok(Value::String(Rc::from(s.as_str()))),
        serde_json::Value::Array(items) => {
            let frozen = items
                .into_iter()
                .map(freeze_json)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(Rc::new(frozen)))
        }
        serde_json::Value::Object(entries) => {
            let frozen = entries
                .into_iter()
                .map(|(k, v)| Ok((Box::from(k.as_str()), freeze_json(v)?)))
                .collect::<Result<BTreeMap<_, _>, FreezeError>>()?;
            Ok(Value::Object(Rc::new(frozen)))
        }
    }
}

impl Value {
    /// Renders the value back out as JSON, e.g. for view export or scratch
    /// storage.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(f)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Number(i as f64)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Number(f64::from(i))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s.as_str()))
    }
}

/// The total order over values.
///
/// Nulls are equal to each other and strictly less than every non-null
/// value. All other comparisons require identical types; a mismatch is a
/// programmer error. Strings compare by UTF-8 code-unit order, arrays
/// lexicographically, and objects by their sorted `(key, value)` entries.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            a.partial_cmp(b).expect("frozen numbers are finite")
        }
        (Value::String(a), Value::String(b)) => a.as_ref().cmp(b.as_ref()),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match compare_values(x, y) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                match ka.cmp(kb) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match compare_values(va, vb) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
        (a, b) => panic!("cannot compare values of different types: {a:?} vs {b:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_sorts_first() {
        for v in [
            Value::from(false),
            Value::from(-1e9),
            Value::from(""),
            Value::from("a"),
        ] {
            assert_eq!(compare_values(&Value::Null, &v), Ordering::Less);
            assert_eq!(compare_values(&v, &Value::Null), Ordering::Greater);
        }
        assert_eq!(compare_values(&Value::Null, &Value::Null), Ordering::Equal);
    }

    #[test]
    fn same_type_ordering() {
        let cases = vec![
            (Value::from(false), Value::from(true), Ordering::Less),
            (Value::from(2.0), Value::from(10.0), Ordering::Less),
            (Value::from("b"), Value::from("a"), Ordering::Greater),
            (Value::from("a"), Value::from("a"), Ordering::Equal),
            // UTF-8 code-unit order, not locale order.
            (Value::from("Z"), Value::from("a"), Ordering::Less),
        ];
        for (a, b, expected) in cases {
            assert_eq!(compare_values(&a, &b), expected, "{a:?} vs {b:?}");
        }
    }

    #[test]
    #[should_panic(expected = "cannot compare values of different types")]
    fn type_mismatch_panics() {
        compare_values(&Value::from(1.0), &Value::from("1"));
    }

    #[test]
    fn freeze_rejects_undefined() {
        assert_eq!(freeze(None), Err(FreezeError::Undefined));
        assert_eq!(freeze_allow_undefined(None), Ok(None));
        assert_eq!(
            freeze_allow_undefined(Some(json!(1))),
            Ok(Some(Value::from(1)))
        );
    }

    #[test]
    fn freeze_round_trips() {
        let frozen = freeze(Some(json!({"a": [1, "two", null], "b": {"c": true}}))).unwrap();
        assert_eq!(
            frozen.to_json(),
            json!({"a": [1, "two", null], "b": {"c": true}})
        );
        // Freezing is structural sharing: clones are cheap and compare equal.
        assert_eq!(frozen.clone(), frozen);
    }
}
