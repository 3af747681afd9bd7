//! Rows: immutable, structurally shared column/value mappings.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::value::{freeze, Value};

/// A mapping from column name to value.
///
/// Rows are deeply immutable once observed downstream and cheap to clone:
/// the column map is behind an `Rc` and is shared by reference across the
/// operator graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row(Rc<BTreeMap<Box<str>, Value>>);

impl Row {
    pub fn new(columns: BTreeMap<Box<str>, Value>) -> Row {
        Row(Rc::new(columns))
    }

    /// Freezes a JSON object into a row. Anything but an object is a
    /// programmer error.
    pub fn from_json(value: serde_json::Value) -> Row {
        let serde_json::Value::Object(entries) = value else {
            panic!("a row must be a JSON object, got {value:?}");
        };
        let columns = entries
            .into_iter()
            .map(|(k, v)| {
                let frozen = freeze(Some(v)).expect("row values must be freezable");
                (Box::from(k.as_str()), frozen)
            })
            .collect();
        Row(Rc::new(columns))
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// The value of `column`, with absent columns reading as null.
    pub fn value(&self, column: &str) -> Value {
        self.0.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// The set of columns whose values differ between `self` and `other`.
    pub fn changed_columns<'a>(&'a self, other: &'a Row) -> Vec<&'a str> {
        let mut changed = Vec::new();
        for (column, value) in self.columns() {
            if other.get(column) != Some(value) {
                changed.push(column);
            }
        }
        for (column, _) in other.columns() {
            if self.get(column).is_none() {
                changed.push(column);
            }
        }
        changed
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect(),
        )
    }
}

/// JSON-encodes a list of values, e.g. primary-key values in schema order.
/// This form identifies rows downstream and keys operator scratch state.
pub fn encode_values(values: &[Value]) -> String {
    serde_json::to_string(values).expect("frozen values serialize")
}
