//! The query plan consumed by the builder.
//!
//! The engine does not plan queries: it receives a declarative plan — a
//! tree of table scans, structural filters, correlated subqueries, skips,
//! and limits — and turns it into an operator graph. Flip decisions arrive
//! pre-marked on EXISTS conditions; choosing them is the planner's job.

use serde::{Deserialize, Serialize};

use crate::row::Row;
use crate::schema::SortSpec;
use crate::value::{compare_values, Value};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ast {
    pub table: Box<str>,
    pub alias: Option<Box<str>>,
    pub where_clause: Option<Condition>,
    /// Offset cursor, applied by a Skip operator.
    pub start: Option<Bound>,
    /// Row limit, applied by a partition-aware Take operator.
    pub limit: Option<usize>,
    pub order_by: Option<SortSpec>,
    /// Nested result subqueries, each attached by a Join.
    pub related: Vec<CorrelatedSubquery>,
}

impl Ast {
    pub fn table(table: &str) -> Ast {
        Ast {
            table: Box::from(table),
            alias: None,
            where_clause: None,
            start: None,
            limit: None,
            order_by: None,
            related: Vec::new(),
        }
    }

    pub fn with_where(mut self, condition: Condition) -> Ast {
        self.where_clause = Some(condition);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Ast {
        self.limit = Some(limit);
        self
    }

    pub fn with_related(mut self, subquery: CorrelatedSubquery) -> Ast {
        self.related.push(subquery);
        self
    }
}

/// A skip cursor: rows up to `row` are dropped; `exclusive` keeps the
/// reference row itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bound {
    pub row: Row,
    pub exclusive: bool,
}

/// Pairs parent columns with the child columns they join on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub parent_field: Vec<Box<str>>,
    pub child_field: Vec<Box<str>>,
}

impl Correlation {
    pub fn new(parent: &[&str], child: &[&str]) -> Correlation {
        assert_eq!(
            parent.len(),
            child.len(),
            "correlation fields must pair up"
        );
        Correlation {
            parent_field: parent.iter().map(|c| Box::from(*c)).collect(),
            child_field: child.iter().map(|c| Box::from(*c)).collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelatedSubquery {
    pub correlation: Correlation,
    pub subquery: Ast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistsOp {
    Exists,
    NotExists,
}

/// A structural filter condition. The engine evaluates comparisons against
/// literals only; anything richer belongs upstream of the plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Condition {
    Compare {
        field: Box<str>,
        op: CompareOp,
        value: Value,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Exists(Box<ExistsCondition>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExistsCondition {
    pub op: ExistsOp,
    pub related: CorrelatedSubquery,
    /// Planner decision: run this subquery child-driven through a flipped
    /// inner join instead of an EXISTS filter.
    pub flip: bool,
}

impl Condition {
    pub fn compare(field: &str, op: CompareOp, value: impl Into<Value>) -> Condition {
        Condition::Compare {
            field: Box::from(field),
            op,
            value: value.into(),
        }
    }

    /// Evaluates a subquery-free condition against a row. Hitting an
    /// EXISTS here is a programmer error: the builder resolves subquery
    /// conditions into operators before anything evaluates them.
    pub fn evaluate(&self, row: &Row) -> bool {
        match self {
            Condition::Compare { field, op, value } => {
                let ord = compare_values(&row.value(field), value);
                match op {
                    CompareOp::Eq => ord.is_eq(),
                    CompareOp::Ne => ord.is_ne(),
                    CompareOp::Lt => ord.is_lt(),
                    CompareOp::Le => ord.is_le(),
                    CompareOp::Gt => ord.is_gt(),
                    CompareOp::Ge => ord.is_ge(),
                }
            }
            Condition::And(conditions) => conditions.iter().all(|c| c.evaluate(row)),
            Condition::Or(conditions) => conditions.iter().any(|c| c.evaluate(row)),
            Condition::Exists(_) => {
                panic!("subquery conditions must be resolved by the builder")
            }
        }
    }

    pub fn contains_subquery(&self) -> bool {
        match self {
            Condition::Compare { .. } => false,
            Condition::And(cs) | Condition::Or(cs) => {
                cs.iter().any(Condition::contains_subquery)
            }
            Condition::Exists(_) => true,
        }
    }

    pub fn contains_flip(&self) -> bool {
        match self {
            Condition::Compare { .. } => false,
            Condition::And(cs) | Condition::Or(cs) => cs.iter().any(Condition::contains_flip),
            Condition::Exists(e) => e.flip,
        }
    }

    pub fn contains_not_exists(&self) -> bool {
        match self {
            Condition::Compare { .. } => false,
            Condition::And(cs) | Condition::Or(cs) => {
                cs.iter().any(Condition::contains_not_exists)
            }
            Condition::Exists(e) => {
                e.op == ExistsOp::NotExists || e.related.subquery.where_clause.as_ref()
                    .is_some_and(Condition::contains_not_exists)
            }
        }
    }

    /// The subquery-free weakening of this condition, suitable for pushing
    /// down to a source as a prefilter. Returns `(condition, fully_applied)`
    /// where `fully_applied` is true when nothing was weakened away.
    pub fn source_filter(&self) -> (Option<Condition>, bool) {
        match self {
            Condition::Compare { .. } => (Some(self.clone()), true),
            Condition::And(cs) => {
                let mut kept = Vec::new();
                let mut fully = true;
                for c in cs {
                    let (filter, applied) = c.source_filter();
                    fully &= applied;
                    if let Some(filter) = filter {
                        kept.push(filter);
                    }
                }
                match kept.len() {
                    0 => (None, fully),
                    1 => (Some(kept.pop().expect("one element")), fully),
                    _ => (Some(Condition::And(kept)), fully),
                }
            }
            // A disjunct that cannot be evaluated at the source poisons the
            // whole disjunction: dropping it would narrow the condition.
            Condition::Or(cs) => {
                if cs.iter().any(Condition::contains_subquery) {
                    (None, false)
                } else {
                    (Some(self.clone()), true)
                }
            }
            Condition::Exists(_) => (None, false),
        }
    }
}
