//! FlippedJoin: the child-driven inner join.
//!
//! The algorithm is the reverse of [`Join`](super::join::Join): stream the
//! children first, gather each child's parent candidates, and coalesce
//! parents that share a child set, emitting them in parent order with the
//! same node shape a Join produces. Parents with zero children are dropped.
//! The planner chooses this operator when the child side is the smaller or
//! better-indexed one.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use crate::input::{Basis, FetchRequest, Input, Output};
use crate::node::{Change, ChangeKind, ChildChange, Node};
use crate::operators::join::JoinCore;
use crate::operators::push_output;
use crate::schema::SchemaRef;
use crate::stream::{
    empty_push, first, from_nodes, skip_yields, squelch_yields, NodeStream, PushStream,
    StreamItem,
};

pub struct FlippedJoin {
    core: Rc<JoinCore>,
    output: RefCell<Option<Weak<dyn Output>>>,
    ports: RefCell<Option<(Rc<ParentPort>, Rc<ChildPort>)>>,
    weak_self: Weak<FlippedJoin>,
}

struct ParentPort(Weak<FlippedJoin>);

impl Output for ParentPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(join) => join.push_parent(change),
            None => empty_push(),
        }
    }
}

struct ChildPort(Weak<FlippedJoin>);

impl Output for ChildPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(join) => join.push_child(change),
            None => empty_push(),
        }
    }
}

impl FlippedJoin {
    pub fn connect(
        parent: Rc<dyn Input>,
        child: Rc<dyn Input>,
        relationship_name: &str,
        parent_key: Vec<Box<str>>,
        child_key: Vec<Box<str>>,
    ) -> Rc<FlippedJoin> {
        let core = JoinCore::new(parent, child, relationship_name, parent_key, child_key);
        let join = Rc::new_cyclic(|weak: &Weak<FlippedJoin>| FlippedJoin {
            core: core.clone(),
            output: RefCell::new(None),
            ports: RefCell::new(None),
            weak_self: weak.clone(),
        });
        let parent_port = Rc::new(ParentPort(join.weak_self.clone()));
        let child_port = Rc::new(ChildPort(join.weak_self.clone()));
        let weak_parent: Weak<dyn Output> = Rc::downgrade(&(parent_port.clone() as Rc<dyn Output>));
        let weak_child: Weak<dyn Output> = Rc::downgrade(&(child_port.clone() as Rc<dyn Output>));
        core.parent.set_output(weak_parent);
        core.child.set_output(weak_child);
        *join.ports.borrow_mut() = Some((parent_port, child_port));
        join
    }

    fn exists(&self, parent: &Node) -> bool {
        first(self.core.child_stream(parent.row())).is_some()
    }

    fn push_parent(&self, change: Change) -> PushStream {
        let core = &self.core;
        match change {
            Change::Add(node) => {
                if self.exists(&node) {
                    push_output(&self.output, Change::Add(core.wrap(node)))
                } else {
                    empty_push()
                }
            }
            Change::Remove(node) => {
                if self.exists(&node) {
                    push_output(&self.output, Change::Remove(core.wrap(node)))
                } else {
                    empty_push()
                }
            }
            Change::Edit { old, node } => {
                core.assert_edit_keeps_keys(&core.parent_key, &old, &node);
                if self.exists(&node) {
                    push_output(
                        &self.output,
                        Change::Edit {
                            old: core.wrap(old),
                            node: core.wrap(node),
                        },
                    )
                } else {
                    empty_push()
                }
            }
            Change::Child { node, child } => {
                if self.exists(&node) {
                    push_output(
                        &self.output,
                        Change::Child {
                            node: core.wrap(node),
                            child,
                        },
                    )
                } else {
                    empty_push()
                }
            }
        }
    }

    fn push_child(&self, change: Change) -> PushStream {
        if let Change::Edit { old, node } = &change {
            self.core.assert_edit_keeps_keys(&self.core.child_key, old, node);
        }
        let key_row = change.node().row().clone();
        let constraint = self.core.parent_constraint(&key_row);
        let parents = self
            .core
            .parent
            .clone()
            .fetch(FetchRequest::constrained(constraint));
        Box::new(PushChildWalk {
            join: self.weak_self.upgrade().expect("flipped join is alive"),
            parents,
            change,
            current: None,
        })
    }
}

impl Input for FlippedJoin {
    fn schema(&self) -> SchemaRef {
        self.core.schema.clone()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        // Prune the child scan with whatever part of the parent constraint
        // translates across the correlation.
        let child_constraint = req.constraint.as_ref().map(|constraint| {
            let mut translated = crate::input::Constraint::default();
            for (pk, ck) in self.core.parent_key.iter().zip(self.core.child_key.iter()) {
                if let Some(value) = constraint.0.get(pk) {
                    translated.0.insert(ck.clone(), value.clone());
                }
            }
            translated
        });
        let children = self.core.child.clone().fetch(FetchRequest {
            constraint: child_constraint.filter(|c| !c.0.is_empty()),
            start: None,
            reverse: false,
        });
        squelch_yields(Box::new(FlippedFetch {
            core: self.core.clone(),
            children,
            req,
            seen: HashSet::new(),
            collected: Vec::new(),
            emit: None,
        }))
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        self.core.parent.destroy();
        self.core.child.destroy();
    }
}

/// Scan children, gather parent candidates, then emit the distinct parents
/// in parent order, keeping only those that still have at least one child.
struct FlippedFetch {
    core: Rc<JoinCore>,
    children: NodeStream,
    req: FetchRequest,
    seen: HashSet<String>,
    collected: Vec<Node>,
    emit: Option<std::vec::IntoIter<Node>>,
}

impl FlippedFetch {
    fn gather(&mut self, child: &Node) {
        let constraint = self.core.parent_constraint(child.row());
        let constraint = match &self.req.constraint {
            Some(outer) => constraint.merge(outer),
            None => constraint,
        };
        let parents = self
            .core
            .parent
            .clone()
            .fetch(FetchRequest::constrained(constraint));
        for parent in skip_yields(parents) {
            let key = self.core.schema.primary_key_string(parent.row());
            if self.seen.insert(key) {
                self.collected.push(parent);
            }
        }
    }

    fn finish_scan(&mut self) {
        // An in-flight remove takes its child out of the scan, but parents
        // past the push's position must still surface pre-remove; seed the
        // removed row as one more child so they stay candidates.
        let extra = {
            let in_progress = self.core.in_progress.borrow();
            in_progress.as_ref().and_then(|ip| {
                match &ip.change {
                    super::join::InProgressChange::Remove(row) => Some(Node::new(row.clone())),
                    _ => None,
                }
            })
        };
        if let Some(extra) = extra {
            self.gather(&extra);
        }

        let core = &self.core;
        self.collected
            .sort_by(|a, b| core.schema.compare_rows(a.row(), b.row()));
        if let Some(start) = &self.req.start {
            let schema = core.schema.clone();
            let reverse = self.req.reverse;
            let basis = start.basis;
            let start_row = start.row.clone();
            self.collected.retain(|node| {
                let ord = schema.compare_rows(node.row(), &start_row);
                let ord = if reverse { ord.reverse() } else { ord };
                match basis {
                    Basis::At => ord.is_ge(),
                    Basis::After => ord.is_gt(),
                }
            });
        }
        if self.req.reverse {
            self.collected.reverse();
        }
        self.emit = Some(std::mem::take(&mut self.collected).into_iter());
    }
}

impl Iterator for FlippedFetch {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        loop {
            if let Some(emit) = &mut self.emit {
                let parent = emit.next()?;
                // Inner join: a parent without children does not surface.
                if first(self.core.child_stream(parent.row())).is_some() {
                    return Some(StreamItem::Item(self.core.wrap(parent)));
                }
                continue;
            }
            match self.children.next() {
                None => self.finish_scan(),
                Some(StreamItem::Yield) => return Some(StreamItem::Yield),
                Some(StreamItem::Item(child)) => self.gather(&child),
            }
        }
    }
}

/// One parent at a time, like the parent-driven join's walk, but with the
/// inner-join flips: a first child adds the parent, a last child's removal
/// falls through to a change of the original kind carrying the parent node
/// with a single-element relationship.
struct PushChildWalk {
    join: Rc<FlippedJoin>,
    parents: NodeStream,
    change: Change,
    current: Option<PushStream>,
}

impl PushChildWalk {
    fn change_for(&self, parent: Node) -> Change {
        let core = &self.join.core;
        let children = skip_yields(core.child_stream(parent.row()));
        let count = children.take(2).count();

        if self.change.kind() == ChangeKind::Add && count == 1 {
            // The added child is the parent's first: the parent joins the
            // result.
            return Change::Add(core.wrap(parent));
        }
        if count == 0 {
            return self.fall_through(parent);
        }
        Change::Child {
            node: core.wrap(parent),
            child: ChildChange {
                relationship_name: core.relationship_name.clone(),
                change: Box::new(self.change.clone()),
            },
        }
    }

    /// The zero-children fall-through: emit the original change kind with
    /// the parent node, whose relationship yields just the changed child.
    fn fall_through(&self, parent: Node) -> Change {
        let core = &self.join.core;
        let single = |node: &Node| {
            let child = node.clone();
            parent.with_relationship(
                &core.relationship_name,
                Rc::new(move || from_nodes(vec![child.clone()])),
            )
        };
        match &self.change {
            Change::Add(node) => Change::Add(single(node)),
            Change::Remove(node) => Change::Remove(single(node)),
            Change::Edit { old, node } => Change::Edit {
                old: single(old),
                node: single(node),
            },
            Change::Child { child, .. } => Change::Child {
                node: core.wrap(parent.clone()),
                child: child.clone(),
            },
        }
    }
}

impl Iterator for PushChildWalk {
    type Item = ();

    fn next(&mut self) -> Option<()> {
        loop {
            if let Some(current) = &mut self.current {
                match current.next() {
                    Some(y) => return Some(y),
                    None => self.current = None,
                }
            }
            match self.parents.next() {
                None => {
                    self.join.core.clear_in_progress();
                    return None;
                }
                Some(StreamItem::Yield) => return Some(()),
                Some(StreamItem::Item(parent)) => {
                    self.join
                        .core
                        .set_in_progress(JoinCore::summarize(&self.change), parent.row());
                    let change = self.change_for(parent);
                    self.current = Some(push_output(&self.join.output, change));
                }
            }
        }
    }
}

impl Drop for PushChildWalk {
    fn drop(&mut self) {
        self.join.core.clear_in_progress();
    }
}
