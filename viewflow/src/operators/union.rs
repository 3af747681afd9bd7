//! UnionFanOut/UnionFanIn: the boundary around flip-containing
//! disjunction sub-graphs.
//!
//! Branches between the pair are whole operator sub-graphs (each may hold a
//! flipped inner join), so the fan-in merges *fetches* as well as pushes:
//! fetch is a sorted distinct merge of the branches, and pushed adds and
//! removes are deduplicated by probing the other branches for the row.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::input::{push_to, Constraint, FetchRequest, Input, Output};
use crate::node::Change;
use crate::operators::push_output;
use crate::row::Row;
use crate::schema::SchemaRef;
use crate::stream::{
    chain_pushes, empty_push, first, merge_distinct, NodeStream, PushStream, PushThunk,
    RowComparator,
};

/// Duplicates its input's stream of pushes to every branch sub-graph.
///
/// Each branch owns this operator as its input, so destruction is
/// reference counted: the underlying input is destroyed only after every
/// branch has been destroyed, and over-destruction is fatal.
pub struct UnionFanOut {
    input: Rc<dyn Input>,
    branches: RefCell<Vec<Weak<dyn Output>>>,
    expected_branches: Cell<usize>,
    destroys: Cell<usize>,
    port: RefCell<Option<Rc<FanOutPort>>>,
}

struct FanOutPort(Weak<UnionFanOut>);

impl Output for FanOutPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(fan_out) => fan_out.push(change),
            None => empty_push(),
        }
    }
}

impl UnionFanOut {
    pub fn connect(input: Rc<dyn Input>) -> Rc<UnionFanOut> {
        let fan_out = Rc::new(UnionFanOut {
            input: input.clone(),
            branches: RefCell::new(Vec::new()),
            expected_branches: Cell::new(0),
            destroys: Cell::new(0),
            port: RefCell::new(None),
        });
        let port = Rc::new(FanOutPort(Rc::downgrade(&fan_out)));
        let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
        input.set_output(weak);
        *fan_out.port.borrow_mut() = Some(port);
        fan_out
    }

    fn push(&self, change: Change) -> PushStream {
        let thunks: Vec<PushThunk> = self
            .branches
            .borrow()
            .iter()
            .cloned()
            .map(|branch| {
                let change = change.clone();
                let thunk: PushThunk = Box::new(move || push_to(&branch, change));
                thunk
            })
            .collect();
        chain_pushes(thunks)
    }
}

impl Input for UnionFanOut {
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        self.input.clone().fetch(req)
    }

    /// Branches register themselves here; every branch receives every push.
    fn set_output(&self, output: Weak<dyn Output>) {
        self.branches.borrow_mut().push(output);
    }

    fn destroy(&self) {
        let destroys = self.destroys.get() + 1;
        self.destroys.set(destroys);
        let expected = self.expected_branches.get();
        assert!(
            destroys <= expected,
            "union fan-out destroyed more times than it has branches"
        );
        if destroys == expected {
            self.input.destroy();
        }
    }
}

/// Merges the branch sub-graphs back into one ordered relation.
pub struct UnionFanIn {
    branches: Vec<Rc<dyn Input>>,
    schema: SchemaRef,
    output: RefCell<Option<Weak<dyn Output>>>,
    ports: RefCell<Vec<Rc<BranchPort>>>,
}

struct BranchPort {
    fan_in: Weak<UnionFanIn>,
    index: usize,
}

impl Output for BranchPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.fan_in.upgrade() {
            Some(fan_in) => fan_in.push_from(self.index, change),
            None => empty_push(),
        }
    }
}

impl UnionFanIn {
    pub fn connect(fan_out: &Rc<UnionFanOut>, branches: Vec<Rc<dyn Input>>) -> Rc<UnionFanIn> {
        assert!(!branches.is_empty(), "union fan-in requires branches");
        fan_out.expected_branches.set(branches.len());

        let mut schema = (*branches[0].schema()).clone();
        for branch in &branches[1..] {
            for (name, child) in &branch.schema().relationships {
                match schema.relationships.get(name) {
                    None => {
                        schema.relationships.insert(name.clone(), child.clone());
                    }
                    Some(existing) => assert!(
                        existing == child,
                        "duplicate relationship name {name:?} in union fan-in"
                    ),
                }
            }
        }

        let fan_in = Rc::new(UnionFanIn {
            branches,
            schema: Rc::new(schema),
            output: RefCell::new(None),
            ports: RefCell::new(Vec::new()),
        });
        let mut ports = Vec::new();
        for (index, branch) in fan_in.branches.iter().enumerate() {
            let port = Rc::new(BranchPort {
                fan_in: Rc::downgrade(&fan_in),
                index,
            });
            let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
            branch.set_output(weak);
            ports.push(port);
        }
        *fan_in.ports.borrow_mut() = ports;
        fan_in
    }

    /// True when some branch other than `skip` produces `row`, looked up by
    /// primary-key constraint.
    fn another_branch_produces(&self, skip: usize, row: &Row) -> bool {
        let constraint = Constraint(
            self.schema
                .primary_key
                .iter()
                .map(|c| (c.clone(), row.value(c)))
                .collect(),
        );
        self.branches.iter().enumerate().any(|(index, branch)| {
            index != skip
                && first(
                    branch
                        .clone()
                        .fetch(FetchRequest::constrained(constraint.clone())),
                )
                .is_some()
        })
    }

    fn push_from(self: Rc<Self>, index: usize, change: Change) -> PushStream {
        match &change {
            // An add is suppressed when another branch can already produce
            // the row; a remove when another branch still produces it.
            Change::Add(node) | Change::Remove(node) => {
                if self.another_branch_produces(index, node.row()) {
                    empty_push()
                } else {
                    push_output(&self.output, change)
                }
            }
            // Branches inside the sub-graph are row-disjoint for children;
            // child changes (and edits) pass through.
            Change::Edit { .. } | Change::Child { .. } => push_output(&self.output, change),
        }
    }
}

impl Input for UnionFanIn {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        let streams: Vec<NodeStream> = self
            .branches
            .iter()
            .map(|branch| branch.clone().fetch(req.clone()))
            .collect();
        let schema = self.schema.clone();
        let reverse = req.reverse;
        let cmp: RowComparator = Rc::new(move |a, b| {
            let ord = schema.compare_rows(a, b);
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        });
        merge_distinct(streams, cmp)
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        for branch in &self.branches {
            branch.destroy();
        }
    }
}
