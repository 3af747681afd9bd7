//! The two operator protocols: `fetch` (pull) and `push` (incremental
//! update).
//!
//! Operators own their inputs (`Rc<dyn Input>`) and are held by those
//! inputs as non-owning `Weak<dyn Output>` back-references, so the graph
//! stays acyclic under reference counting. Destruction cascades from the
//! root toward the sources.

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::node::Change;
use crate::row::Row;
use crate::schema::SchemaRef;
use crate::stream::{empty_push, NodeStream, PushStream};
use crate::value::Value;

/// An equality constraint over a set of columns, as induced by join keys
/// and primary-key probes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Constraint(pub BTreeMap<Box<str>, Value>);

impl Constraint {
    pub fn new<const N: usize>(entries: [(&str, Value); N]) -> Constraint {
        Constraint(
            entries
                .into_iter()
                .map(|(k, v)| (Box::from(k), v))
                .collect(),
        )
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|(column, value)| &row.value(column) == value)
    }

    /// The conjunction of two constraints. Conflicting values make the
    /// constraint unsatisfiable, which the caller surfaces as an empty
    /// fetch; here the stricter of the two is kept.
    pub fn merge(mut self, other: &Constraint) -> Constraint {
        for (column, value) in &other.0 {
            self.0.insert(column.clone(), value.clone());
        }
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Basis {
    At,
    After,
}

/// A fetch cursor: resume iteration at or after `row`.
#[derive(Clone, Debug)]
pub struct Start {
    pub row: Row,
    pub basis: Basis,
}

#[derive(Clone, Debug, Default)]
pub struct FetchRequest {
    pub constraint: Option<Constraint>,
    pub start: Option<Start>,
    pub reverse: bool,
}

impl FetchRequest {
    pub fn constrained(constraint: Constraint) -> FetchRequest {
        FetchRequest {
            constraint: Some(constraint),
            start: None,
            reverse: false,
        }
    }
}

/// The pull half of an operator: a lazy ordered sequence of nodes.
pub trait Input {
    fn schema(&self) -> SchemaRef;

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream;

    /// Registers the downstream operator this input pushes into. The
    /// reference is non-owning; a dropped output simply stops receiving.
    fn set_output(&self, output: Weak<dyn Output>);

    /// Tears the operator down, cascading to its own inputs. Branch points
    /// are reference counted and panic on over-destruction.
    fn destroy(&self);
}

/// The push half of an operator: receives a change, transforms it, and
/// returns the yielding stream of its own downstream propagation.
pub trait Output {
    fn push(self: Rc<Self>, change: Change) -> PushStream;
}

/// Pushes into a registered output, or discards the change when none is
/// attached (nothing downstream is listening).
pub fn push_to(output: &Weak<dyn Output>, change: Change) -> PushStream {
    match output.upgrade() {
        Some(output) => output.push(change),
        None => empty_push(),
    }
}
