//! The view materializer: applies pushed changes to a reference-counted
//! hierarchical entry tree.
//!
//! Each materialized row carries a hidden reference count (a row reachable
//! through several branches is stored once) and is identified by its
//! primary key. Relationship slots follow the query's format tree:
//! singular slots hold at most one row, lists stay ordered by the source's
//! sort.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::input::{FetchRequest, Input, Output};
use crate::node::{Change, Node};
use crate::row::Row;
use crate::schema::Schema;
use crate::stream::{skip_yields, yield_once, PushStream};

/// Singular/plural shape of the materialized output, per relationship.
#[derive(Clone, Debug, Default)]
pub struct ViewFormat {
    pub singular: bool,
    pub relationships: BTreeMap<Box<str>, ViewFormat>,
}

impl ViewFormat {
    pub fn list() -> ViewFormat {
        ViewFormat::default()
    }

    pub fn singular() -> ViewFormat {
        ViewFormat {
            singular: true,
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_relationship(mut self, name: &str, format: ViewFormat) -> ViewFormat {
        self.relationships.insert(Box::from(name), format);
        self
    }
}

struct Entry {
    row: Row,
    refcount: usize,
    children: BTreeMap<Box<str>, EntryChildren>,
}

enum EntryChildren {
    List(Vec<Entry>),
    Singular(Option<Box<Entry>>),
}

impl EntryChildren {
    fn new(format: &ViewFormat) -> EntryChildren {
        if format.singular {
            EntryChildren::Singular(None)
        } else {
            EntryChildren::List(Vec::new())
        }
    }
}

pub struct View {
    input: Rc<dyn Input>,
    format: ViewFormat,
    root: RefCell<EntryChildren>,
    port: RefCell<Option<Rc<ViewPort>>>,
}

struct ViewPort(Weak<View>);

impl Output for ViewPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        if let Some(view) = self.0.upgrade() {
            view.apply(&change);
        }
        yield_once()
    }
}

impl View {
    /// Materializes the initial result set and subscribes to pushes.
    pub fn connect(input: Rc<dyn Input>, format: ViewFormat) -> Rc<View> {
        let view = Rc::new(View {
            input: input.clone(),
            root: RefCell::new(EntryChildren::new(&format)),
            format,
            port: RefCell::new(None),
        });
        let port = Rc::new(ViewPort(Rc::downgrade(&view)));
        let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
        input.set_output(weak);
        *view.port.borrow_mut() = Some(port);

        {
            let mut root = view.root.borrow_mut();
            let schema = view.input.schema();
            for node in skip_yields(view.input.clone().fetch(FetchRequest::default())) {
                add_node(&mut root, &node, &schema, &view.format);
            }
        }
        view
    }

    fn apply(&self, change: &Change) {
        let schema = self.input.schema();
        apply_change(&mut self.root.borrow_mut(), change, &schema, &self.format);
    }

    pub fn to_json(&self) -> serde_json::Value {
        children_to_json(&self.root.borrow(), &self.format)
    }

    pub fn destroy(&self) {
        self.input.destroy();
    }
}

fn apply_change(children: &mut EntryChildren, change: &Change, schema: &Schema, format: &ViewFormat) {
    match change {
        Change::Add(node) => add_node(children, node, schema, format),
        Change::Remove(node) => remove_node(children, node.row(), schema),
        Change::Edit { old, node } => edit_node(children, old.row(), node.row(), schema),
        Change::Child { node, child } => {
            // Relationships outside the format tree (EXISTS plumbing) are
            // not materialized.
            let Some(child_format) = format.relationships.get(&child.relationship_name) else {
                return;
            };
            let child_schema = schema
                .relationships
                .get(&child.relationship_name)
                .unwrap_or_else(|| {
                    panic!(
                        "change targets unknown relationship {:?}",
                        child.relationship_name
                    )
                })
                .clone();
            let entry = find_entry_mut(children, node.row(), schema).unwrap_or_else(|| {
                panic!(
                    "child change for a row missing from the view: {:?}",
                    node.row()
                )
            });
            let slot = entry
                .children
                .get_mut(&child.relationship_name)
                .expect("entries carry a slot per formatted relationship");
            apply_change(slot, &child.change, &child_schema, child_format);
        }
    }
}

/// Builds a fresh entry, draining the node's formatted relationships.
fn entry_from_node(node: &Node, schema: &Schema, format: &ViewFormat) -> Entry {
    let mut children = BTreeMap::new();
    for (name, child_format) in &format.relationships {
        let mut slot = EntryChildren::new(child_format);
        let child_schema = schema
            .relationships
            .get(name)
            .unwrap_or_else(|| panic!("node lacks schema for relationship {name:?}"));
        if let Some(stream) = node.relationship(name) {
            for child in skip_yields(stream) {
                add_node(&mut slot, &child, child_schema, child_format);
            }
        }
        children.insert(name.clone(), slot);
    }
    Entry {
        row: node.row().clone(),
        refcount: 1,
        children,
    }
}

fn add_node(children: &mut EntryChildren, node: &Node, schema: &Schema, format: &ViewFormat) {
    match children {
        EntryChildren::Singular(slot) => match slot {
            None => *slot = Some(Box::new(entry_from_node(node, schema, format))),
            Some(entry) if schema.same_primary_key(&entry.row, node.row()) => {
                entry.refcount += 1;
            }
            Some(entry) => panic!(
                "singular relationship already holds {:?}, refusing to add {:?}",
                entry.row,
                node.row()
            ),
        },
        EntryChildren::List(entries) => {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| schema.same_primary_key(&e.row, node.row()))
            {
                entry.refcount += 1;
                return;
            }
            let at = entries
                .partition_point(|e| schema.compare_rows(&e.row, node.row()).is_lt());
            entries.insert(at, entry_from_node(node, schema, format));
        }
    }
}

fn remove_node(children: &mut EntryChildren, row: &Row, schema: &Schema) {
    match children {
        EntryChildren::Singular(slot) => {
            let entry = slot
                .as_mut()
                .filter(|e| schema.same_primary_key(&e.row, row))
                .unwrap_or_else(|| panic!("removing a row missing from the view: {row:?}"));
            entry.refcount -= 1;
            if entry.refcount == 0 {
                // Dropping the entry drops its children with it.
                *slot = None;
            }
        }
        EntryChildren::List(entries) => {
            let at = entries
                .iter()
                .position(|e| schema.same_primary_key(&e.row, row))
                .unwrap_or_else(|| panic!("removing a row missing from the view: {row:?}"));
            entries[at].refcount -= 1;
            if entries[at].refcount == 0 {
                entries.remove(at);
            }
        }
    }
}

/// Updates the identity-tagged entry in place; a changed primary key or
/// sort position moves the entry, transferring its reference count and
/// children.
fn edit_node(children: &mut EntryChildren, old_row: &Row, new_row: &Row, schema: &Schema) {
    match children {
        EntryChildren::Singular(slot) => {
            let entry = slot
                .as_mut()
                .filter(|e| schema.same_primary_key(&e.row, old_row))
                .unwrap_or_else(|| panic!("editing a row missing from the view: {old_row:?}"));
            entry.row = new_row.clone();
        }
        EntryChildren::List(entries) => {
            let at = entries
                .iter()
                .position(|e| schema.same_primary_key(&e.row, old_row))
                .unwrap_or_else(|| panic!("editing a row missing from the view: {old_row:?}"));
            let mut entry = entries.remove(at);
            entry.row = new_row.clone();
            let at = entries
                .partition_point(|e| schema.compare_rows(&e.row, new_row).is_lt());
            entries.insert(at, entry);
        }
    }
}

fn find_entry_mut<'a>(
    children: &'a mut EntryChildren,
    row: &Row,
    schema: &Schema,
) -> Option<&'a mut Entry> {
    match children {
        EntryChildren::Singular(slot) => slot
            .as_deref_mut()
            .filter(|e| schema.same_primary_key(&e.row, row)),
        EntryChildren::List(entries) => entries
            .iter_mut()
            .find(|e| schema.same_primary_key(&e.row, row)),
    }
}

fn children_to_json(children: &EntryChildren, format: &ViewFormat) -> serde_json::Value {
    match children {
        EntryChildren::Singular(slot) => slot
            .as_ref()
            .map(|e| entry_to_json(e, format))
            .unwrap_or(serde_json::Value::Null),
        EntryChildren::List(entries) => serde_json::Value::Array(
            entries.iter().map(|e| entry_to_json(e, format)).collect(),
        ),
    }
}

fn entry_to_json(entry: &Entry, format: &ViewFormat) -> serde_json::Value {
    let serde_json::Value::Object(mut object) = entry.row.to_json() else {
        unreachable!("rows render as objects");
    };
    for (name, child_format) in &format.relationships {
        let slot = entry
            .children
            .get(name)
            .expect("entries carry a slot per formatted relationship");
        object.insert(name.to_string(), children_to_json(slot, child_format));
    }
    serde_json::Value::Object(object)
}
