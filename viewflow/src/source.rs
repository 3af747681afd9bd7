//! An ordered mutable set of rows keyed by primary key.
//!
//! A source hands out *connected inputs*: each connection iterates the rows
//! in its requested ordering and receives every subsequent change through
//! its registered output. `push` mutates the source first and then fans the
//! change out connection by connection; connections that have not yet been
//! notified keep observing the pre-change state through an overlay, so the
//! graph sees at most one view of the change at a time.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use fnv::FnvHashMap;
use tracing::{debug, trace};

use crate::ast::Condition;
use crate::error::PlannerError;
use crate::input::{push_to, Basis, FetchRequest, Input, Output};
use crate::node::{Change, Node};
use crate::overlay::{apply_overlay, OverlayFix};
use crate::row::Row;
use crate::schema::{Schema, SchemaRef, SortSpec};
use crate::stream::{
    chain_pushes, drain, empty_push, interleave_yields, NodeStream, PushStream, PushThunk,
    RowComparator,
};

const YIELD_INTERVAL: usize = 64;

/// A row-level mutation accepted at the source boundary.
#[derive(Clone, Debug)]
pub enum SourceChange {
    Add(Row),
    Remove(Row),
    Edit { old: Row, new: Row },
}

#[derive(Debug)]
struct SourceIndex {
    sort: SortSpec,
    rows: RefCell<Rc<Vec<Row>>>,
}

impl SourceIndex {
    fn new(sort: SortSpec, mut rows: Vec<Row>) -> SourceIndex {
        rows.sort_by(|a, b| sort.compare(a, b));
        SourceIndex {
            sort,
            rows: RefCell::new(Rc::new(rows)),
        }
    }

    /// A cheap snapshot; pushes copy-on-write the shared vector, so open
    /// fetches keep the rows they started with.
    fn snapshot(&self) -> Rc<Vec<Row>> {
        self.rows.borrow().clone()
    }

    fn insert(&self, row: Row) {
        let mut shared = self.rows.borrow_mut();
        let rows = Rc::make_mut(&mut shared);
        let at = rows.partition_point(|r| self.sort.compare(r, &row).is_lt());
        rows.insert(at, row);
    }

    fn remove(&self, row: &Row) {
        let mut shared = self.rows.borrow_mut();
        let rows = Rc::make_mut(&mut shared);
        let at = rows.partition_point(|r| self.sort.compare(r, row).is_lt());
        assert!(
            at < rows.len() && self.sort.compare(&rows[at], row).is_eq(),
            "row to remove is not present in index"
        );
        rows.remove(at);
    }
}

/// Pre-state compensation for the connection fan-out: connections that have
/// not been notified yet un-apply the in-flight change on fetch.
struct PushOverlay {
    change: SourceChange,
}

pub struct Source {
    schema: SchemaRef,
    weak_self: RefCell<Weak<Source>>,
    rows_by_key: RefCell<FnvHashMap<String, Row>>,
    indexes: RefCell<Vec<Rc<SourceIndex>>>,
    connections: RefCell<Vec<Rc<SourceConnection>>>,
    overlay: RefCell<Option<PushOverlay>>,
}

impl Source {
    pub fn new(schema: Schema) -> Rc<Source> {
        let schema = Rc::new(schema);
        let primary = Rc::new(SourceIndex::new(schema.sort.clone(), Vec::new()));
        let source = Rc::new(Source {
            schema,
            weak_self: RefCell::new(Weak::new()),
            rows_by_key: RefCell::new(FnvHashMap::default()),
            indexes: RefCell::new(vec![primary]),
            connections: RefCell::new(Vec::new()),
            overlay: RefCell::new(None),
        });
        *source.weak_self.borrow_mut() = Rc::downgrade(&source);
        source
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Returns a connected input iterating in `ordering`.
    ///
    /// The ordering must include every primary-key column: that is what
    /// makes iteration deterministic. `split_edit_keys` lists the columns
    /// whose change rewrites an incoming edit into remove-plus-add for this
    /// connection.
    pub fn connect(
        &self,
        ordering: SortSpec,
        filter: Option<Condition>,
        split_edit_keys: BTreeSet<Box<str>>,
    ) -> Result<Rc<SourceConnection>, PlannerError> {
        for column in &self.schema.primary_key {
            if !ordering.contains(column) {
                return Err(PlannerError::OrderingMissingPrimaryKey {
                    table: self.schema.table_name.to_string(),
                    column: column.to_string(),
                });
            }
        }
        trace!(table = %self.schema.table_name, ?ordering, "connect");

        let index = self.index_for(&ordering);
        let mut schema = (*self.schema).clone();
        schema.sort = ordering;
        let connection = Rc::new(SourceConnection {
            source: self.weak_self.borrow().clone(),
            schema: Rc::new(schema),
            index,
            filter,
            split_edit_keys,
            output: RefCell::new(None),
            notified: Cell::new(false),
        });
        self.connections.borrow_mut().push(connection.clone());
        Ok(connection)
    }

    fn index_for(&self, ordering: &SortSpec) -> Rc<SourceIndex> {
        let mut indexes = self.indexes.borrow_mut();
        if let Some(index) = indexes.iter().find(|i| &i.sort == ordering) {
            return index.clone();
        }
        let rows = indexes[0].snapshot().as_ref().clone();
        let index = Rc::new(SourceIndex::new(ordering.clone(), rows));
        indexes.push(index.clone());
        index
    }

    fn disconnect(&self, connection: &SourceConnection) {
        let mut connections = self.connections.borrow_mut();
        let before = connections.len();
        connections.retain(|c| !std::ptr::eq(c.as_ref(), connection));
        assert_eq!(
            connections.len(),
            before - 1,
            "source connection for table {:?} destroyed twice",
            self.schema.table_name
        );
    }

    /// Mutates the source and drives the change through every connected
    /// input's downstream graph, returning once every output has finished
    /// consuming.
    pub fn push(&self, change: SourceChange) {
        drain(self.gen_push(change));
    }

    /// The cooperative form of [`Source::push`]: mutates immediately, and
    /// returns the yielding stream of in-graph propagation for the caller
    /// to drive.
    pub fn gen_push(&self, change: SourceChange) -> PushStream {
        debug!(table = %self.schema.table_name, change = ?change_kind(&change), "push");
        self.apply(&change);

        let connections: Vec<_> = self.connections.borrow().clone();
        for connection in &connections {
            connection.notified.set(false);
        }
        *self.overlay.borrow_mut() = Some(PushOverlay {
            change: change.clone(),
        });

        Box::new(PushFan {
            source: self.weak_self.borrow().upgrade().expect("source is alive"),
            connections,
            change,
            next: 0,
            current: None,
        })
    }

    fn apply(&self, change: &SourceChange) {
        let mut by_key = self.rows_by_key.borrow_mut();
        match change {
            SourceChange::Add(row) => {
                let key = self.schema.primary_key_string(row);
                assert!(
                    !by_key.contains_key(&key),
                    "row with primary key {key} already exists in table {:?}",
                    self.schema.table_name
                );
                by_key.insert(key, row.clone());
                for index in self.indexes.borrow().iter() {
                    index.insert(row.clone());
                }
            }
            SourceChange::Remove(row) => {
                let key = self.schema.primary_key_string(row);
                let stored = by_key.remove(&key).unwrap_or_else(|| {
                    panic!(
                        "row with primary key {key} is not present in table {:?}",
                        self.schema.table_name
                    )
                });
                assert!(
                    &stored == row,
                    "removed row does not match the stored row for key {key}"
                );
                for index in self.indexes.borrow().iter() {
                    index.remove(row);
                }
            }
            SourceChange::Edit { old, new } => {
                let old_key = self.schema.primary_key_string(old);
                let stored = by_key.remove(&old_key).unwrap_or_else(|| {
                    panic!(
                        "row with primary key {old_key} is not present in table {:?}",
                        self.schema.table_name
                    )
                });
                assert!(
                    &stored == old,
                    "edited row does not match the stored row for key {old_key}"
                );
                let new_key = self.schema.primary_key_string(new);
                assert!(
                    new_key == old_key || !by_key.contains_key(&new_key),
                    "edit moves row onto existing primary key {new_key} in table {:?}",
                    self.schema.table_name
                );
                by_key.insert(new_key, new.clone());
                for index in self.indexes.borrow().iter() {
                    index.remove(old);
                    index.insert(new.clone());
                }
            }
        }
    }

    fn clear_overlay(&self) {
        *self.overlay.borrow_mut() = None;
    }
}

fn change_kind(change: &SourceChange) -> &'static str {
    match change {
        SourceChange::Add(_) => "add",
        SourceChange::Remove(_) => "remove",
        SourceChange::Edit { .. } => "edit",
    }
}

/// Fans an in-flight change out to the connections, one at a time, marking
/// each as notified immediately before delivery so concurrent fetches pick
/// the right side of the overlay.
struct PushFan {
    source: Rc<Source>,
    connections: Vec<Rc<SourceConnection>>,
    change: SourceChange,
    next: usize,
    current: Option<PushStream>,
}

impl Iterator for PushFan {
    type Item = ();

    fn next(&mut self) -> Option<()> {
        loop {
            if let Some(current) = &mut self.current {
                match current.next() {
                    Some(y) => return Some(y),
                    None => self.current = None,
                }
            }
            if self.next >= self.connections.len() {
                self.source.clear_overlay();
                return None;
            }
            let connection = self.connections[self.next].clone();
            self.next += 1;
            connection.notified.set(true);
            let changes = connection.transform(&self.change);
            if changes.is_empty() {
                continue;
            }
            let thunks: Vec<PushThunk> = changes
                .into_iter()
                .map(|change| {
                    let connection = connection.clone();
                    let thunk: PushThunk = Box::new(move || {
                        match connection.output.borrow().clone() {
                            Some(output) => push_to(&output, change),
                            None => empty_push(),
                        }
                    });
                    thunk
                })
                .collect();
            self.current = Some(Box::new(std::iter::once(()).chain(chain_pushes(thunks))));
        }
    }
}

impl Drop for PushFan {
    fn drop(&mut self) {
        self.source.clear_overlay();
    }
}

#[derive(Debug)]
pub struct SourceConnection {
    source: Weak<Source>,
    schema: SchemaRef,
    index: Rc<SourceIndex>,
    filter: Option<Condition>,
    split_edit_keys: BTreeSet<Box<str>>,
    output: RefCell<Option<Weak<dyn Output>>>,
    notified: Cell<bool>,
}

impl SourceConnection {
    /// True when every structural filter condition passed at connect time
    /// is enforced at the source; this implementation enforces them all.
    pub fn fully_applied_filters(&self) -> bool {
        true
    }

    fn passes(&self, row: &Row) -> bool {
        self.filter.as_ref().map_or(true, |f| f.evaluate(row))
    }

    /// Rewrites an incoming change for this connection: edits touching a
    /// split key become remove-plus-add, and the connection filter is
    /// applied with the usual edge splitting.
    fn transform(&self, change: &SourceChange) -> Vec<Change> {
        let split = match change {
            SourceChange::Edit { old, new }
                if old
                    .changed_columns(new)
                    .iter()
                    .any(|c| self.split_edit_keys.contains(*c)) =>
            {
                vec![
                    SourceChange::Remove(old.clone()),
                    SourceChange::Add(new.clone()),
                ]
            }
            other => vec![other.clone()],
        };

        let mut out = Vec::new();
        for change in split {
            match change {
                SourceChange::Add(row) => {
                    if self.passes(&row) {
                        out.push(Change::Add(Node::new(row)));
                    }
                }
                SourceChange::Remove(row) => {
                    if self.passes(&row) {
                        out.push(Change::Remove(Node::new(row)));
                    }
                }
                SourceChange::Edit { old, new } => {
                    match (self.passes(&old), self.passes(&new)) {
                        (true, true) => out.push(Change::Edit {
                            old: Node::new(old),
                            node: Node::new(new),
                        }),
                        (true, false) => out.push(Change::Remove(Node::new(old))),
                        (false, true) => out.push(Change::Add(Node::new(new))),
                        (false, false) => {}
                    }
                }
            }
        }
        out
    }

    /// The pre-state fix for fetches racing an in-flight push this
    /// connection has not seen yet.
    fn overlay_fix(&self, req: &FetchRequest) -> Option<OverlayFix> {
        let source = self.source.upgrade()?;
        let overlay = source.overlay.borrow();
        let overlay = overlay.as_ref()?;
        if self.notified.get() {
            return None;
        }
        let visible = |row: &Row| {
            self.passes(row)
                && req.constraint.as_ref().map_or(true, |c| c.matches(row))
                && self.in_start_range(row, req)
        };
        match &overlay.change {
            SourceChange::Add(row) => Some(OverlayFix::Hide(row.clone())),
            SourceChange::Remove(row) => {
                visible(row).then(|| OverlayFix::Insert(row.clone()))
            }
            SourceChange::Edit { old, new } => match visible(old) {
                true => Some(OverlayFix::Replace {
                    hide: new.clone(),
                    insert: old.clone(),
                }),
                false => Some(OverlayFix::Hide(new.clone())),
            },
        }
    }

    fn in_start_range(&self, row: &Row, req: &FetchRequest) -> bool {
        let Some(start) = &req.start else { return true };
        let ord = self.schema.sort.compare(row, &start.row);
        let ord = if req.reverse { ord.reverse() } else { ord };
        match start.basis {
            Basis::At => ord.is_ge(),
            Basis::After => ord.is_gt(),
        }
    }
}

impl Input for SourceConnection {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        let snapshot = self.index.snapshot();
        let sort = self.index.sort.clone();
        let fix = self.overlay_fix(&req);

        let bounds = |row: &Row| self.in_start_range(row, &req);
        let constraint = req.constraint.clone();
        let this = self.clone();
        let keep = move |row: &Row| {
            this.passes(row)
                && constraint.as_ref().map_or(true, |c| c.matches(row))
                && bounds(row)
        };

        let rows: Vec<Row> = if req.reverse {
            snapshot.iter().rev().filter(|&r| keep(r)).cloned().collect()
        } else {
            snapshot.iter().filter(|&r| keep(r)).cloned().collect()
        };

        let reverse = req.reverse;
        let stream = interleave_yields(rows.into_iter().map(Node::new), YIELD_INTERVAL);
        match fix {
            None => stream,
            Some(fix) => {
                let cmp: RowComparator = Rc::new(move |a, b| {
                    let ord = sort.compare(a, b);
                    if reverse {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                apply_overlay(stream, fix, cmp)
            }
        }
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        if let Some(source) = self.source.upgrade() {
            source.disconnect(self);
        }
    }
}
