//! Source schemas and sort specifications.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::row::{encode_values, Row};
use crate::value::{compare_values, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub column: Box<str>,
    pub direction: Direction,
}

/// An ordering over rows: a sequence of columns with directions.
///
/// Orderings used to connect a source must include every primary-key
/// column, which makes the induced comparator a total order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec(pub Vec<SortField>);

impl SortSpec {
    pub fn asc(columns: &[&str]) -> SortSpec {
        SortSpec(
            columns
                .iter()
                .map(|c| SortField {
                    column: Box::from(*c),
                    direction: Direction::Asc,
                })
                .collect(),
        )
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|f| f.column.as_ref() == column)
    }

    /// Appends any missing `primary_key` columns, ascending, so the
    /// comparator becomes total.
    pub fn complete(&self, primary_key: &[Box<str>]) -> SortSpec {
        let mut fields = self.0.clone();
        for column in primary_key {
            if !self.contains(column) {
                fields.push(SortField {
                    column: column.clone(),
                    direction: Direction::Asc,
                });
            }
        }
        SortSpec(fields)
    }

    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for field in &self.0 {
            let ord = compare_values(&a.value(&field.column), &b.value(&field.column));
            let ord = match field.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Classifies a source by the side of the system it lives on. Permission
/// sources are given smaller EXISTS child limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum System {
    Client,
    Server,
    Permissions,
}

pub type SchemaRef = Rc<Schema>;

/// Shape of the rows an operator emits: table identity, primary key, the
/// iteration order, and the relationships grafted on by joins above the
/// source.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    pub table_name: Box<str>,
    pub primary_key: Vec<Box<str>>,
    pub sort: SortSpec,
    pub relationships: BTreeMap<Box<str>, SchemaRef>,
    pub system: System,
    pub is_hidden: bool,
}

impl Schema {
    pub fn new(table_name: &str, primary_key: &[&str], sort: SortSpec) -> Schema {
        let primary_key: Vec<Box<str>> = primary_key.iter().map(|c| Box::from(*c)).collect();
        let sort = sort.complete(&primary_key);
        Schema {
            table_name: Box::from(table_name),
            primary_key,
            sort,
            relationships: BTreeMap::new(),
            system: System::Server,
            is_hidden: false,
        }
    }

    pub fn with_system(mut self, system: System) -> Schema {
        self.system = system;
        self
    }

    /// The row comparator induced by `sort`.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        self.sort.compare(a, b)
    }

    /// JSON-encoded primary-key values in schema order; the downstream
    /// identity of a row.
    pub fn primary_key_string(&self, row: &Row) -> String {
        let values: SmallVec<[Value; 4]> =
            self.primary_key.iter().map(|c| row.value(c)).collect();
        encode_values(&values)
    }

    pub fn same_primary_key(&self, a: &Row, b: &Row) -> bool {
        self.primary_key.iter().all(|c| a.value(c) == b.value(c))
    }

    /// A copy of this schema with `name` grafted on as a relationship to
    /// `child`, as a join does.
    pub fn with_relationship(&self, name: &str, child: SchemaRef) -> SchemaRef {
        let mut schema = self.clone();
        schema.relationships.insert(Box::from(name), child);
        Rc::new(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        Row::from_json(v)
    }

    #[test]
    fn complete_appends_missing_primary_key_columns() {
        let sort = SortSpec::asc(&["created"]).complete(&[Box::from("id")]);
        assert!(sort.contains("created"));
        assert!(sort.contains("id"));
        // Already-present columns are not duplicated.
        let again = sort.complete(&[Box::from("id")]);
        assert_eq!(again.0.len(), 2);
    }

    #[test]
    fn desc_fields_reverse_and_ties_fall_through() {
        let sort = SortSpec(vec![
            SortField {
                column: Box::from("n"),
                direction: Direction::Desc,
            },
            SortField {
                column: Box::from("id"),
                direction: Direction::Asc,
            },
        ]);
        let a = row(json!({"id": "a", "n": 1}));
        let b = row(json!({"id": "b", "n": 2}));
        assert_eq!(sort.compare(&a, &b), Ordering::Greater);
        let tie = row(json!({"id": "b", "n": 1}));
        assert_eq!(sort.compare(&a, &tie), Ordering::Less);
    }

    #[test]
    fn primary_key_string_uses_schema_order() {
        let schema = Schema::new("t", &["b", "a"], SortSpec::asc(&[]));
        let r = row(json!({"a": 1, "b": "x"}));
        assert_eq!(schema.primary_key_string(&r), r#"["x",1.0]"#);
    }
}
