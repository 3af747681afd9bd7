//! Nodes and changes: the units of pull- and push-stream data.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::row::Row;
use crate::stream::{empty_nodes, NodeStream};

/// A zero-argument function yielding a lazy stream of child nodes.
///
/// Thunks are re-entrant safe: invoking one repeatedly during a single
/// fetch yields the same sequence of rows.
pub type RelationshipThunk = Rc<dyn Fn() -> NodeStream>;

/// A row plus its lazy child relationships; the unit flowing through pull
/// streams. Cloning is cheap: the row and the relationship map are shared.
#[derive(Clone)]
pub struct Node {
    row: Row,
    relationships: Rc<BTreeMap<Box<str>, RelationshipThunk>>,
}

impl Node {
    /// A node with no relationships, as emitted at a source.
    pub fn new(row: Row) -> Node {
        Node {
            row,
            relationships: Rc::new(BTreeMap::new()),
        }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Materializes the named relationship, or `None` if this node does not
    /// carry it.
    pub fn relationship(&self, name: &str) -> Option<NodeStream> {
        self.relationships.get(name).map(|thunk| thunk())
    }

    pub fn relationship_names(&self) -> impl Iterator<Item = &str> {
        self.relationships.keys().map(|k| k.as_ref())
    }

    /// A copy of this node with `name` bound to `thunk`. Joins use this to
    /// graft child streams onto parent rows.
    pub fn with_relationship(&self, name: &str, thunk: RelationshipThunk) -> Node {
        let mut relationships = (*self.relationships).clone();
        relationships.insert(Box::from(name), thunk);
        Node {
            row: self.row.clone(),
            relationships: Rc::new(relationships),
        }
    }

    /// A copy of this node whose `name` relationship yields nothing. Used
    /// when a change must not expose a child that was never visible
    /// downstream.
    pub fn with_empty_relationship(&self, name: &str) -> Node {
        self.with_relationship(name, Rc::new(empty_nodes))
    }

    /// A copy of this node with a different row and the same relationships.
    pub fn with_row(&self, row: Row) -> Node {
        Node {
            row,
            relationships: self.relationships.clone(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("row", &self.row)
            .field(
                "relationships",
                &self.relationships.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A row-level change travelling root-ward through the graph.
#[derive(Clone, Debug)]
pub enum Change {
    Add(Node),
    Remove(Node),
    /// Same identity, possibly new column values. For joins the key columns
    /// must be identical between `old` and `node`.
    Edit { old: Node, node: Node },
    /// A recursive change applied inside a relationship; `node` identifies
    /// the containing parent row.
    Child { node: Node, child: ChildChange },
}

#[derive(Clone, Debug)]
pub struct ChildChange {
    pub relationship_name: Box<str>,
    pub change: Box<Change>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
    Edit,
    Child,
}

impl Change {
    /// The principal node of the change: the post-state node for edits, the
    /// containing parent for child changes.
    pub fn node(&self) -> &Node {
        match self {
            Change::Add(node) | Change::Remove(node) => node,
            Change::Edit { node, .. } => node,
            Change::Child { node, .. } => node,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Add(_) => ChangeKind::Add,
            Change::Remove(_) => ChangeKind::Remove,
            Change::Edit { .. } => ChangeKind::Edit,
            Change::Child { .. } => ChangeKind::Child,
        }
    }

    /// Rebuilds the change with every constituent node passed through `f`.
    /// Joins use this to wrap child streams onto the nodes they forward.
    pub fn map_nodes(self, f: &impl Fn(Node) -> Node) -> Change {
        match self {
            Change::Add(node) => Change::Add(f(node)),
            Change::Remove(node) => Change::Remove(f(node)),
            Change::Edit { old, node } => Change::Edit {
                old: f(old),
                node: f(node),
            },
            Change::Child { node, child } => Change::Child {
                node: f(node),
                child,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{consume, from_nodes};
    use serde_json::json;

    #[test]
    fn with_relationship_is_persistent() {
        let base = Node::new(Row::from_json(json!({"id": "p1"})));
        let child = Node::new(Row::from_json(json!({"id": "c1"})));
        let wrapped = base.with_relationship(
            "comments",
            Rc::new(move || from_nodes(vec![child.clone()])),
        );
        assert!(base.relationship("comments").is_none());
        let drained = consume(wrapped.relationship("comments").unwrap());
        assert_eq!(drained.len(), 1);
        // Thunks are re-entrant: a second materialization sees the same rows.
        let again = consume(wrapped.relationship("comments").unwrap());
        assert_eq!(again[0].row(), drained[0].row());
    }

    #[test]
    fn masked_relationship_yields_nothing() {
        let base = Node::new(Row::from_json(json!({"id": "p1"})));
        let child = Node::new(Row::from_json(json!({"id": "c1"})));
        let wrapped = base
            .with_relationship("comments", Rc::new(move || from_nodes(vec![child.clone()])))
            .with_empty_relationship("comments");
        assert!(consume(wrapped.relationship("comments").unwrap()).is_empty());
    }
}
