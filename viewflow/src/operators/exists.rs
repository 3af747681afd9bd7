//! EXISTS / NOT EXISTS: gates parents on a correlated relationship.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::ast::ExistsOp;
use crate::node::{Change, ChangeKind, Node};
use crate::operators::filter::FilterStage;
use crate::row::encode_values;
use crate::schema::SchemaRef;
use crate::stream::{empty_push, skip_yields, PushStream};

/// Filters parents by whether the gated relationship holds any children.
///
/// The relationship is fed by a limited join beneath this pipeline, so
/// counting drains at most a handful of rows; the count is still a full
/// drain because the limit operator cannot short-circuit during its own
/// hydration.
pub struct Exists {
    relationship_name: Box<str>,
    op: ExistsOp,
    parent_join_key: Vec<Box<str>>,
    schema: SchemaRef,
    /// Per-scan cache: JSON-encoded parent join-key values to existence.
    cache: RefCell<FnvHashMap<String, bool>>,
    in_scan: Cell<bool>,
    pushing: Cell<bool>,
    next: Rc<dyn FilterStage>,
}

impl Exists {
    pub fn new(
        relationship_name: &str,
        op: ExistsOp,
        parent_join_key: Vec<Box<str>>,
        schema: SchemaRef,
        next: Rc<dyn FilterStage>,
    ) -> Rc<Exists> {
        Rc::new(Exists {
            relationship_name: Box::from(relationship_name),
            op,
            parent_join_key,
            schema,
            cache: RefCell::new(FnvHashMap::default()),
            in_scan: Cell::new(false),
            pushing: Cell::new(false),
            next,
        })
    }

    fn size(&self, node: &Node) -> usize {
        let stream = node.relationship(&self.relationship_name).unwrap_or_else(|| {
            panic!(
                "node does not carry the gated relationship {:?}",
                self.relationship_name
            )
        });
        skip_yields(stream).count()
    }

    /// When the parent join key is the primary key, the cache key would be
    /// the parent's own identity and a lookup buys nothing.
    fn cacheable(&self) -> bool {
        let mut key: Vec<&str> = self.parent_join_key.iter().map(AsRef::as_ref).collect();
        let mut pk: Vec<&str> = self.schema.primary_key.iter().map(AsRef::as_ref).collect();
        key.sort_unstable();
        pk.sort_unstable();
        key != pk
    }

    fn exists(&self, node: &Node) -> bool {
        if self.in_scan.get() && self.cacheable() {
            let values: SmallVec<[crate::value::Value; 4]> = self
                .parent_join_key
                .iter()
                .map(|c| node.row().value(c))
                .collect();
            let key = encode_values(&values);
            if let Some(&hit) = self.cache.borrow().get(&key) {
                return hit;
            }
            let exists = self.size(node) > 0;
            self.cache.borrow_mut().insert(key, exists);
            exists
        } else {
            self.size(node) > 0
        }
    }

    fn passes(&self, node: &Node) -> bool {
        match self.op {
            ExistsOp::Exists => self.exists(node),
            ExistsOp::NotExists => !self.exists(node),
        }
    }

}

struct PushGuard {
    exists: Rc<Exists>,
    inner: PushStream,
}

impl Iterator for PushGuard {
    type Item = ();

    fn next(&mut self) -> Option<()> {
        self.inner.next()
    }
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        self.exists.pushing.set(false);
    }
}

impl FilterStage for Exists {
    fn begin_filter(&self) {
        self.in_scan.set(true);
        self.next.begin_filter();
    }

    fn filter(&self, node: &Node) -> bool {
        self.passes(node) && self.next.filter(node)
    }

    fn end_filter(&self) {
        self.cache.borrow_mut().clear();
        self.in_scan.set(false);
        self.next.end_filter();
    }

    fn push(self: Rc<Self>, change: Change) -> PushStream {
        assert!(
            !self.pushing.replace(true),
            "re-entrant push into Exists operator"
        );
        let next = self.next.clone();
        let stream = match change {
            // A change inside the gated relationship may flip existence.
            Change::Child { node, child }
                if child.relationship_name == self.relationship_name =>
            {
                self.cache.borrow_mut().clear();
                match child.change.kind() {
                    ChangeKind::Add => {
                        if self.size(&node) == 1 {
                            // First child: the parent flips into (or out of)
                            // the result. The child is masked out of the
                            // remove because it was never visible downstream.
                            match self.op {
                                ExistsOp::Exists => next.push(Change::Add(node)),
                                ExistsOp::NotExists => {
                                    let masked =
                                        node.with_empty_relationship(&self.relationship_name);
                                    next.push(Change::Remove(masked))
                                }
                            }
                        } else if self.passes(&node) {
                            next.push(Change::Child { node, child })
                        } else {
                            empty_push()
                        }
                    }
                    ChangeKind::Remove => {
                        if self.size(&node) == 0 {
                            match self.op {
                                ExistsOp::Exists => next.push(Change::Remove(node)),
                                ExistsOp::NotExists => next.push(Change::Add(node)),
                            }
                        } else if self.passes(&node) {
                            next.push(Change::Child { node, child })
                        } else {
                            empty_push()
                        }
                    }
                    // Edits and nested child changes cannot flip existence.
                    ChangeKind::Edit | ChangeKind::Child => {
                        if self.passes(&node) {
                            next.push(Change::Child { node, child })
                        } else {
                            empty_push()
                        }
                    }
                }
            }
            // Row-level changes cannot flip existence for the relationship
            // this operator gates; standard filter rules apply.
            Change::Add(node) => {
                if self.passes(&node) {
                    next.push(Change::Add(node))
                } else {
                    empty_push()
                }
            }
            Change::Remove(node) => {
                if self.passes(&node) {
                    next.push(Change::Remove(node))
                } else {
                    empty_push()
                }
            }
            Change::Edit { old, node } => {
                // Join keys cannot change across an edit, so old and new
                // agree on existence.
                if self.passes(&node) {
                    next.push(Change::Edit { old, node })
                } else {
                    empty_push()
                }
            }
            Change::Child { node, child } => {
                if self.passes(&node) {
                    next.push(Change::Child { node, child })
                } else {
                    empty_push()
                }
            }
        };
        Box::new(PushGuard {
            exists: self.clone(),
            inner: stream,
        })
    }

    fn destroy(&self) {
        self.next.destroy();
    }
}
