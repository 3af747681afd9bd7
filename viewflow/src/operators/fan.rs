//! FanOut/FanIn: a disjunction's branches inside the filter chain.
//!
//! FanOut duplicates every push to all branches without deduplication; the
//! paired FanIn accumulates whatever the branches emit and collapses it
//! into at most one output change per fan-out input change, once the
//! fan-out signals that all branches have been pushed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::node::{Change, ChangeKind, Node};
use crate::operators::filter::FilterStage;
use crate::schema::SchemaRef;
use crate::stream::{chain_pushes, empty_push, PushStream, PushThunk};

pub struct FanOut {
    branches: Vec<Rc<dyn FilterStage>>,
    fan_in: Rc<FanIn>,
}

impl FanOut {
    /// Wires the pair. Every branch chain must terminate at `fan_in`; the
    /// branch schemas must be structurally identical to the fan-out's own.
    pub fn new(
        fan_in: Rc<FanIn>,
        branches: Vec<Rc<dyn FilterStage>>,
        branch_schemas: Vec<SchemaRef>,
    ) -> Rc<FanOut> {
        for schema in &branch_schemas {
            assert!(
                **schema == *fan_in.schema,
                "fan-in schema differs from a branch schema for table {:?}",
                fan_in.schema.table_name
            );
        }
        fan_in.branch_count.set(branches.len());
        Rc::new(FanOut { branches, fan_in })
    }
}

impl FilterStage for FanOut {
    fn begin_filter(&self) {
        for branch in &self.branches {
            branch.begin_filter();
        }
    }

    fn filter(&self, node: &Node) -> bool {
        self.branches.iter().any(|branch| branch.filter(node))
    }

    fn end_filter(&self) {
        for branch in &self.branches {
            branch.end_filter();
        }
    }

    fn push(self: Rc<Self>, change: Change) -> PushStream {
        let fan_in = self.fan_in.clone();
        fan_in.begin_accumulate();
        let kind = change.kind();
        let mut thunks: Vec<PushThunk> = self
            .branches
            .iter()
            .map(|branch| {
                let branch = branch.clone();
                let change = change.clone();
                let thunk: PushThunk = Box::new(move || branch.push(change));
                thunk
            })
            .collect();
        thunks.push(Box::new(move || {
            fan_in.fan_out_done_pushing_to_all_branches(kind)
        }));
        chain_pushes(thunks)
    }

    fn destroy(&self) {
        for branch in &self.branches {
            branch.destroy();
        }
    }
}

pub struct FanIn {
    schema: SchemaRef,
    next: Rc<dyn FilterStage>,
    accumulated: RefCell<Vec<Change>>,
    accumulating: Cell<bool>,
    /// begin/end arrive once per branch; only the outermost pair forwards.
    scan_depth: Cell<usize>,
    branch_count: Cell<usize>,
    destroys: Cell<usize>,
}

impl FanIn {
    pub fn new(schema: SchemaRef, next: Rc<dyn FilterStage>) -> Rc<FanIn> {
        Rc::new(FanIn {
            schema,
            next,
            accumulated: RefCell::new(Vec::new()),
            accumulating: Cell::new(false),
            scan_depth: Cell::new(0),
            branch_count: Cell::new(0),
            destroys: Cell::new(0),
        })
    }

    fn begin_accumulate(&self) {
        self.accumulated.borrow_mut().clear();
        self.accumulating.set(true);
    }

    /// Accumulated pushes are processed exactly once per outer push: the
    /// fan-out calls this after the last branch has been pushed.
    fn fan_out_done_pushing_to_all_branches(&self, kind: ChangeKind) -> PushStream {
        self.accumulating.set(false);
        let changes = std::mem::take(&mut *self.accumulated.borrow_mut());
        match collapse(kind, changes) {
            Some(change) => self.next.clone().push(change),
            None => empty_push(),
        }
    }
}

/// Collapses the branches' accumulated changes into at most one change.
///
/// Identical forwards from multiple branches collapse to the first; a
/// branch split into an add and another into a remove means the row was
/// visible before and after, which reads as an edit.
fn collapse(kind: ChangeKind, changes: Vec<Change>) -> Option<Change> {
    if changes.is_empty() {
        return None;
    }
    match kind {
        ChangeKind::Add | ChangeKind::Remove => changes.into_iter().next(),
        ChangeKind::Edit | ChangeKind::Child => {
            if let Some(keep) = changes
                .iter()
                .find(|c| c.kind() == kind)
            {
                return Some(keep.clone());
            }
            let add = changes.iter().find(|c| c.kind() == ChangeKind::Add);
            let remove = changes.iter().find(|c| c.kind() == ChangeKind::Remove);
            match (add, remove) {
                (Some(add), Some(remove)) => Some(Change::Edit {
                    old: remove.node().clone(),
                    node: add.node().clone(),
                }),
                _ => changes.into_iter().next(),
            }
        }
    }
}

impl FilterStage for FanIn {
    fn begin_filter(&self) {
        let depth = self.scan_depth.get();
        if depth == 0 {
            self.next.begin_filter();
        }
        self.scan_depth.set(depth + 1);
    }

    fn filter(&self, node: &Node) -> bool {
        self.next.filter(node)
    }

    fn end_filter(&self) {
        let depth = self.scan_depth.get();
        assert!(depth > 0, "end_filter without matching begin_filter");
        self.scan_depth.set(depth - 1);
        if depth == 1 {
            self.next.end_filter();
        }
    }

    fn push(self: Rc<Self>, change: Change) -> PushStream {
        assert!(
            self.accumulating.get(),
            "fan-in received a push outside a fan-out push"
        );
        self.accumulated.borrow_mut().push(change);
        empty_push()
    }

    fn destroy(&self) {
        let destroys = self.destroys.get() + 1;
        self.destroys.set(destroys);
        assert!(
            destroys <= self.branch_count.get(),
            "fan-in destroyed more times than it has branches"
        );
        if destroys == self.branch_count.get() {
            self.next.destroy();
        }
    }
}
