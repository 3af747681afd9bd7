//! Join: the parent-driven, hierarchical left join.
//!
//! Output nodes carry the parent's row plus a new relationship whose thunk
//! lazily streams the matching children. Child-side pushes locate the
//! affected parents and are re-emitted as `child` changes, one parent at a
//! time; for the duration of that walk the join annotates itself with the
//! in-progress change so that concurrent child-stream materialization for
//! parents that have not been notified yet still observes the pre-change
//! state.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::input::{Constraint, FetchRequest, Input, Output};
use crate::node::{Change, ChildChange, Node};
use crate::operators::push_output;
use crate::overlay::{apply_overlay, OverlayFix};
use crate::row::Row;
use crate::schema::SchemaRef;
use crate::stream::{empty_push, NodeStream, PushStream, RowComparator, StreamItem};

/// The child rows of an in-flight child-side push.
#[derive(Clone, Debug)]
pub(crate) enum InProgressChange {
    Add(Row),
    Remove(Row),
    Edit { old: Row, new: Row },
}

impl InProgressChange {
    /// A row carrying the change's join-key values.
    fn key_row(&self) -> &Row {
        match self {
            InProgressChange::Add(row) | InProgressChange::Remove(row) => row,
            InProgressChange::Edit { new, .. } => new,
        }
    }

    /// The pre-state compensation for a not-yet-notified parent.
    fn pre_state_fix(&self) -> OverlayFix {
        match self {
            InProgressChange::Add(row) => OverlayFix::Hide(row.clone()),
            InProgressChange::Remove(row) => OverlayFix::Insert(row.clone()),
            InProgressChange::Edit { old, new } => OverlayFix::Replace {
                hide: new.clone(),
                insert: old.clone(),
            },
        }
    }
}

pub(crate) struct InProgress {
    pub change: InProgressChange,
    /// The parent currently being pushed; parents ordered after it have
    /// not seen the change yet.
    pub position: Row,
}

/// State and behavior shared by [`Join`] and the flipped variant: key
/// translation, node wrapping, and the overlay discipline.
pub(crate) struct JoinCore {
    pub parent: Rc<dyn Input>,
    pub child: Rc<dyn Input>,
    pub relationship_name: Box<str>,
    pub parent_key: Vec<Box<str>>,
    pub child_key: Vec<Box<str>>,
    pub schema: SchemaRef,
    pub in_progress: RefCell<Option<InProgress>>,
    weak_self: Weak<JoinCore>,
}

impl JoinCore {
    pub fn new(
        parent: Rc<dyn Input>,
        child: Rc<dyn Input>,
        relationship_name: &str,
        parent_key: Vec<Box<str>>,
        child_key: Vec<Box<str>>,
    ) -> Rc<JoinCore> {
        assert_eq!(parent_key.len(), child_key.len(), "join keys must pair up");
        let schema = parent
            .schema()
            .with_relationship(relationship_name, child.schema());
        Rc::new_cyclic(|weak| JoinCore {
            parent,
            child,
            relationship_name: Box::from(relationship_name),
            parent_key,
            child_key,
            schema,
            in_progress: RefCell::new(None),
            weak_self: weak.clone(),
        })
    }

    fn rc(&self) -> Rc<JoinCore> {
        self.weak_self.upgrade().expect("join core is alive")
    }

    pub fn child_constraint(&self, parent_row: &Row) -> Constraint {
        Constraint(
            self.child_key
                .iter()
                .zip(self.parent_key.iter())
                .map(|(ck, pk)| (ck.clone(), parent_row.value(pk)))
                .collect(),
        )
    }

    pub fn parent_constraint(&self, child_row: &Row) -> Constraint {
        Constraint(
            self.parent_key
                .iter()
                .zip(self.child_key.iter())
                .map(|(pk, ck)| (pk.clone(), child_row.value(ck)))
                .collect(),
        )
    }

    fn joins_to(&self, parent_row: &Row, child_row: &Row) -> bool {
        self.parent_key
            .iter()
            .zip(self.child_key.iter())
            .all(|(pk, ck)| parent_row.value(pk) == child_row.value(ck))
    }

    /// The matching children of one parent, compensated for any in-flight
    /// child change this parent has not been notified of.
    pub fn child_stream(&self, parent_row: &Row) -> NodeStream {
        let constraint = self.child_constraint(parent_row);
        let stream = self
            .child
            .clone()
            .fetch(FetchRequest::constrained(constraint));

        let fix = {
            let in_progress = self.in_progress.borrow();
            in_progress.as_ref().and_then(|ip| {
                let affected = self.joins_to(parent_row, ip.change.key_row());
                let not_yet_notified =
                    self.schema.compare_rows(parent_row, &ip.position).is_gt();
                (affected && not_yet_notified).then(|| ip.change.pre_state_fix())
            })
        };
        match fix {
            None => stream,
            Some(fix) => {
                let child_schema = self.child.schema();
                let cmp: RowComparator =
                    Rc::new(move |a, b| child_schema.compare_rows(a, b));
                apply_overlay(stream, fix, cmp)
            }
        }
    }

    /// Grafts the relationship thunk onto a parent node.
    pub fn wrap(&self, node: Node) -> Node {
        let core = self.rc();
        let parent_row = node.row().clone();
        node.with_relationship(
            &self.relationship_name,
            Rc::new(move || core.child_stream(&parent_row)),
        )
    }

    pub fn assert_edit_keeps_keys(&self, keys: &[Box<str>], old: &Node, new: &Node) {
        for key in keys {
            assert!(
                old.row().value(key) == new.row().value(key),
                "edit changed join key {key:?} for relationship {:?}",
                self.relationship_name
            );
        }
    }

    pub fn summarize(change: &Change) -> Option<InProgressChange> {
        match change {
            Change::Add(node) => Some(InProgressChange::Add(node.row().clone())),
            Change::Remove(node) => Some(InProgressChange::Remove(node.row().clone())),
            Change::Edit { old, node } => Some(InProgressChange::Edit {
                old: old.row().clone(),
                new: node.row().clone(),
            }),
            Change::Child { .. } => None,
        }
    }

    pub fn set_in_progress(&self, change: Option<InProgressChange>, position: &Row) {
        *self.in_progress.borrow_mut() = change.map(|change| InProgress {
            change,
            position: position.clone(),
        });
    }

    pub fn clear_in_progress(&self) {
        *self.in_progress.borrow_mut() = None;
    }
}

pub struct Join {
    core: Rc<JoinCore>,
    output: RefCell<Option<Weak<dyn Output>>>,
    ports: RefCell<Option<(Rc<ParentPort>, Rc<ChildPort>)>>,
    weak_self: Weak<Join>,
}

struct ParentPort(Weak<Join>);

impl Output for ParentPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(join) => join.push_parent(change),
            None => empty_push(),
        }
    }
}

struct ChildPort(Weak<Join>);

impl Output for ChildPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(join) => join.push_child(change),
            None => empty_push(),
        }
    }
}

impl Join {
    pub fn connect(
        parent: Rc<dyn Input>,
        child: Rc<dyn Input>,
        relationship_name: &str,
        parent_key: Vec<Box<str>>,
        child_key: Vec<Box<str>>,
    ) -> Rc<Join> {
        let core = JoinCore::new(parent, child, relationship_name, parent_key, child_key);
        let join = Rc::new_cyclic(|weak: &Weak<Join>| Join {
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

    fn push_parent(&self, change: Change) -> PushStream {
        if let Change::Edit { old, node } = &change {
            self.core.assert_edit_keeps_keys(&self.core.parent_key, old, node);
        }
        let core = self.core.clone();
        let wrap = move |node| core.wrap(node);
        push_output(&self.output, change.map_nodes(&wrap))
    }

    /// Re-emits a child-side change as a `child` change on every matching
    /// parent, annotating the in-progress position as it walks.
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
            join: self.weak_self.upgrade().expect("join is alive"),
            parents,
            change,
            current: None,
        })
    }
}

impl Input for Join {
    fn schema(&self) -> SchemaRef {
        self.core.schema.clone()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        let core = self.core.clone();
        let parents = core.parent.clone().fetch(req);
        Box::new(parents.map(move |item| item.map(|node| core.wrap(node))))
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        self.core.parent.destroy();
        self.core.child.destroy();
    }
}

/// One parent at a time: annotate, wrap, deliver, move on. The annotation
/// is cleared when the walk completes or is abandoned.
struct PushChildWalk {
    join: Rc<Join>,
    parents: NodeStream,
    change: Change,
    current: Option<PushStream>,
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
                    let wrapped = self.join.core.wrap(parent);
                    let child = ChildChange {
                        relationship_name: self.join.core.relationship_name.clone(),
                        change: Box::new(self.change.clone()),
                    };
                    self.current = Some(push_output(
                        &self.join.output,
                        Change::Child {
                            node: wrapped,
                            child,
                        },
                    ));
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
