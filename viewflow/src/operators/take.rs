//! Take: a stateful limit operator with optional partitioning.
//!
//! Each partition keeps `{size, bound}` in external storage under the key
//! `["take", ...partitionValues]`; after every push the materialized window
//! for a partition is exactly the first `limit` rows of the underlying
//! input in its sort order.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::input::{Basis, Constraint, FetchRequest, Input, Output, Start};
use crate::node::{Change, Node};
use crate::operators::push_output;
use crate::row::Row;
use crate::schema::SchemaRef;
use crate::storage::Storage;
use crate::stream::{
    chain_pushes, empty_nodes, empty_push, first, skip_yields, NodeStream, PushStream,
    PushThunk, StreamItem,
};
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TakeState {
    size: usize,
    bound: Option<Row>,
}

pub struct Take {
    input: Rc<dyn Input>,
    storage: Rc<dyn Storage>,
    limit: usize,
    partition_key: Option<Vec<Box<str>>>,
    /// The maximum bound across all partitions; rows sorting past it cannot
    /// sit in any window, which lets removes and child changes be dropped
    /// without consulting state.
    max_bound: RefCell<Option<Row>>,
    output: RefCell<Option<Weak<dyn Output>>>,
    port: RefCell<Option<Rc<TakePort>>>,
    weak_self: Weak<Take>,
}

struct TakePort(Weak<Take>);

impl Output for TakePort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(take) => take.push(change),
            None => empty_push(),
        }
    }
}

impl Take {
    pub fn connect(
        input: Rc<dyn Input>,
        storage: Rc<dyn Storage>,
        limit: usize,
        partition_key: Option<Vec<Box<str>>>,
    ) -> Rc<Take> {
        let take = Rc::new_cyclic(|weak: &Weak<Take>| Take {
            input: input.clone(),
            storage,
            limit,
            partition_key,
            max_bound: RefCell::new(None),
            output: RefCell::new(None),
            port: RefCell::new(None),
            weak_self: weak.clone(),
        });
        let port = Rc::new(TakePort(take.weak_self.clone()));
        let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
        input.set_output(weak);
        *take.port.borrow_mut() = Some(port);
        take
    }

    fn state_key(partition: &[Value]) -> String {
        let mut key = vec![serde_json::Value::String("take".to_string())];
        key.extend(partition.iter().map(Value::to_json));
        serde_json::to_string(&key).expect("state keys serialize")
    }

    fn partition_of_row(&self, row: &Row) -> Vec<Value> {
        self.partition_key
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|c| row.value(c))
            .collect()
    }

    fn partition_of_constraint(&self, constraint: Option<&Constraint>) -> Vec<Value> {
        let Some(key) = self.partition_key.as_deref() else {
            return Vec::new();
        };
        let constraint =
            constraint.expect("a partitioned take must be fetched with its partition key");
        key.iter()
            .map(|column| {
                constraint
                    .0
                    .get(column)
                    .unwrap_or_else(|| {
                        panic!("fetch constraint is missing partition column {column:?}")
                    })
                    .clone()
            })
            .collect()
    }

    fn partition_constraint(&self, partition: &[Value]) -> Option<Constraint> {
        let key = self.partition_key.as_deref()?;
        Some(Constraint(
            key.iter()
                .zip(partition.iter())
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect(),
        ))
    }

    fn load_state(&self, partition: &[Value]) -> Option<TakeState> {
        self.storage
            .get(&Take::state_key(partition))
            .map(|value| serde_json::from_value(value).expect("take state deserializes"))
    }

    fn save_state(&self, partition: &[Value], state: &TakeState) {
        self.storage.set(
            &Take::state_key(partition),
            serde_json::to_value(state).expect("take state serializes"),
        );
        if let Some(bound) = &state.bound {
            let mut max_bound = self.max_bound.borrow_mut();
            let grows = max_bound
                .as_ref()
                .map_or(true, |max| self.schema().compare_rows(bound, max).is_gt());
            if grows {
                *max_bound = Some(bound.clone());
            }
        }
    }

    fn window_contains(&self, state: &TakeState, row: &Row) -> bool {
        state
            .bound
            .as_ref()
            .is_some_and(|bound| self.schema().compare_rows(row, bound).is_le())
    }

    /// The current window: the first `limit` rows of the input, post-state.
    fn fetch_window(&self, partition: &[Value]) -> Vec<Node> {
        let req = FetchRequest {
            constraint: self.partition_constraint(partition),
            start: None,
            reverse: false,
        };
        skip_yields(self.input.clone().fetch(req))
            .take(self.limit)
            .collect()
    }

    fn fetch_from(&self, partition: &[Value], row: &Row, basis: Basis) -> Option<Node> {
        let req = FetchRequest {
            constraint: self.partition_constraint(partition),
            start: Some(Start {
                row: row.clone(),
                basis,
            }),
            reverse: false,
        };
        first(self.input.clone().fetch(req))
    }

    fn emit(&self, changes: Vec<Change>) -> PushStream {
        let thunks: Vec<PushThunk> = changes
            .into_iter()
            .map(|change| {
                let take = self.weak_self.upgrade().expect("take is alive");
                let thunk: PushThunk =
                    Box::new(move || push_output(&take.output, change));
                thunk
            })
            .collect();
        chain_pushes(thunks)
    }

    fn push(&self, change: Change) -> PushStream {
        if self.limit == 0 {
            return empty_push();
        }
        let row = change.node().row().clone();

        // Fast path: rows past the maximum bound sit in no window.
        if matches!(change, Change::Remove(_) | Change::Child { .. }) {
            let past_max = self
                .max_bound
                .borrow()
                .as_ref()
                .is_some_and(|max| self.schema().compare_rows(&row, max).is_gt());
            if past_max {
                return empty_push();
            }
        }

        let partition = self.partition_of_row(&row);
        // A partition with no recorded state has never been hydrated;
        // nothing downstream is watching it.
        let Some(state) = self.load_state(&partition) else {
            return empty_push();
        };

        match change {
            Change::Add(node) => self.push_add(state, partition, node),
            Change::Remove(node) => self.push_remove(state, partition, node),
            Change::Edit { old, node } => self.push_edit(state, partition, old, node),
            Change::Child { node, child } => {
                if self.window_contains(&state, node.row()) {
                    self.emit(vec![Change::Child { node, child }])
                } else {
                    empty_push()
                }
            }
        }
    }

    fn push_add(&self, mut state: TakeState, partition: Vec<Value>, node: Node) -> PushStream {
        let schema = self.schema();
        if state.size < self.limit {
            state.size += 1;
            let extends = state
                .bound
                .as_ref()
                .map_or(true, |bound| schema.compare_rows(node.row(), bound).is_gt());
            if extends {
                state.bound = Some(node.row().clone());
            }
            self.save_state(&partition, &state);
            return self.emit(vec![Change::Add(node)]);
        }

        let bound = state.bound.clone().expect("a full window has a bound");
        if schema.compare_rows(node.row(), &bound).is_lt() {
            // The new row displaces the window's maximum.
            let evicted = self
                .fetch_from(&partition, &bound, Basis::At)
                .expect("the bound row is present in the input");
            let window = self.fetch_window(&partition);
            state.bound = window.last().map(|n| n.row().clone());
            self.save_state(&partition, &state);
            self.emit(vec![Change::Remove(evicted), Change::Add(node)])
        } else {
            empty_push()
        }
    }

    fn push_remove(
        &self,
        mut state: TakeState,
        partition: Vec<Value>,
        node: Node,
    ) -> PushStream {
        if !self.window_contains(&state, node.row()) {
            return empty_push();
        }
        let schema = self.schema();
        let old_bound = state.bound.clone().expect("window containment implies a bound");
        let was_bound = schema.compare_rows(node.row(), &old_bound).is_eq();
        let mut changes = vec![Change::Remove(node)];

        if state.size == self.limit {
            // Backfill the next row past the old bound, if any.
            match self.fetch_from(&partition, &old_bound, Basis::After) {
                Some(next) => {
                    state.bound = Some(next.row().clone());
                    changes.push(Change::Add(next));
                }
                None => {
                    state.size -= 1;
                    if was_bound {
                        let window = self.fetch_window(&partition);
                        state.bound = window.last().map(|n| n.row().clone());
                    }
                }
            }
        } else {
            state.size -= 1;
            if was_bound {
                let window = self.fetch_window(&partition);
                state.bound = window.last().map(|n| n.row().clone());
            }
        }
        self.save_state(&partition, &state);
        self.emit(changes)
    }

    fn push_edit(
        &self,
        state: TakeState,
        partition: Vec<Value>,
        old: Node,
        node: Node,
    ) -> PushStream {
        let schema = self.schema();
        if !self.window_contains(&state, old.row()) {
            // Outside the window before the edit; the add rules decide
            // whether the new row enters.
            return self.push_add(state, partition, node);
        }

        // Membership after the edit comes from the refreshed window.
        let window = self.fetch_window(&partition);
        let now_in = window
            .iter()
            .any(|n| schema.same_primary_key(n.row(), node.row()));
        let mut state = state;
        state.size = window.len();
        state.bound = window.last().map(|n| n.row().clone());
        self.save_state(&partition, &state);

        if now_in {
            self.emit(vec![Change::Edit { old, node }])
        } else {
            // Moved past the bound: the row leaves and the window backfills.
            let mut changes = vec![Change::Remove(old)];
            if let Some(last) = window.last() {
                changes.push(Change::Add(last.clone()));
            }
            self.emit(changes)
        }
    }
}

impl Input for Take {
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        assert!(!req.reverse, "take does not support reverse fetches");
        if self.limit == 0 {
            return empty_nodes();
        }
        let partition = self.partition_of_constraint(req.constraint.as_ref());
        match self.load_state(&partition) {
            Some(state) => {
                let Some(bound) = state.bound else {
                    return empty_nodes();
                };
                let schema = self.schema();
                let stream = self.input.clone().fetch(req);
                Box::new(stream.take_while(move |item| match item {
                    StreamItem::Yield => true,
                    StreamItem::Item(node) => schema.compare_rows(node.row(), &bound).is_le(),
                }))
            }
            None => {
                assert!(
                    req.start.is_none(),
                    "take hydrates from the beginning of its window"
                );
                Box::new(Hydrate {
                    take: self.clone(),
                    inner: self.input.clone().fetch(req),
                    partition,
                    count: 0,
                    last: None,
                    complete: false,
                })
            }
        }
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        self.input.destroy();
    }
}

/// Initial hydration of one partition. The window state is recorded when
/// the stream completes; abandoning it early would leave the window
/// unbounded and is fatal.
struct Hydrate {
    take: Rc<Take>,
    inner: NodeStream,
    partition: Vec<Value>,
    count: usize,
    last: Option<Row>,
    complete: bool,
}

impl Hydrate {
    fn finish(&mut self) {
        if !self.complete {
            self.complete = true;
            self.take.save_state(
                &self.partition,
                &TakeState {
                    size: self.count,
                    bound: self.last.clone(),
                },
            );
        }
    }
}

impl Iterator for Hydrate {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        if self.count == self.take.limit {
            self.finish();
            return None;
        }
        match self.inner.next() {
            None => {
                self.finish();
                None
            }
            Some(StreamItem::Yield) => Some(StreamItem::Yield),
            Some(StreamItem::Item(node)) => {
                self.count += 1;
                self.last = Some(node.row().clone());
                Some(StreamItem::Item(node))
            }
        }
    }
}

impl Drop for Hydrate {
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        if self.count == self.take.limit {
            // The consumer stopped exactly at the window edge; the state is
            // fully determined.
            self.finish();
        } else if !std::thread::panicking() {
            panic!("Unexpected early return prevented full hydration");
        }
    }
}
