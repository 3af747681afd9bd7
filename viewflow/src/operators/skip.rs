//! Skip: drops every node up to a reference row.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::ast::Bound;
use crate::input::{Basis, FetchRequest, Input, Output, Start};
use crate::node::Change;
use crate::operators::push_output;
use crate::row::Row;
use crate::schema::SchemaRef;
use crate::stream::{empty_push, NodeStream, PushStream, StreamItem};

/// Drops all nodes up to and including the reference row, or up to but not
/// including it when the bound is exclusive. Downstream fetch cursors still
/// apply on top of the skip bound.
pub struct Skip {
    input: Rc<dyn Input>,
    bound: Bound,
    output: RefCell<Option<Weak<dyn Output>>>,
    port: RefCell<Option<Rc<SkipPort>>>,
}

struct SkipPort(Weak<Skip>);

impl Output for SkipPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(skip) => skip.push(change),
            None => empty_push(),
        }
    }
}

impl Skip {
    pub fn connect(input: Rc<dyn Input>, bound: Bound) -> Rc<Skip> {
        let skip = Rc::new(Skip {
            input: input.clone(),
            bound,
            output: RefCell::new(None),
            port: RefCell::new(None),
        });
        let port = Rc::new(SkipPort(Rc::downgrade(&skip)));
        let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
        input.set_output(weak);
        *skip.port.borrow_mut() = Some(port);
        skip
    }

    fn in_range(&self, row: &Row) -> bool {
        match self.schema().compare_rows(row, &self.bound.row) {
            Ordering::Greater => true,
            Ordering::Equal => self.bound.exclusive,
            Ordering::Less => false,
        }
    }

    /// The later of the skip bound and the caller's own cursor.
    fn merge_start(&self, requested: Option<Start>) -> Start {
        let own = Start {
            row: self.bound.row.clone(),
            basis: if self.bound.exclusive {
                Basis::At
            } else {
                Basis::After
            },
        };
        match requested {
            None => own,
            Some(start) => match self.schema().compare_rows(&start.row, &own.row) {
                Ordering::Greater => start,
                Ordering::Less => own,
                Ordering::Equal => {
                    if matches!(start.basis, Basis::After) || matches!(own.basis, Basis::After) {
                        Start {
                            row: own.row,
                            basis: Basis::After,
                        }
                    } else {
                        own
                    }
                }
            },
        }
    }

    fn push(&self, change: Change) -> PushStream {
        match change {
            Change::Add(node) => {
                if self.in_range(node.row()) {
                    push_output(&self.output, Change::Add(node))
                } else {
                    empty_push()
                }
            }
            Change::Remove(node) => {
                if self.in_range(node.row()) {
                    push_output(&self.output, Change::Remove(node))
                } else {
                    empty_push()
                }
            }
            Change::Edit { old, node } => {
                match (self.in_range(old.row()), self.in_range(node.row())) {
                    (true, true) => push_output(&self.output, Change::Edit { old, node }),
                    (true, false) => push_output(&self.output, Change::Remove(old)),
                    (false, true) => push_output(&self.output, Change::Add(node)),
                    (false, false) => empty_push(),
                }
            }
            Change::Child { node, child } => {
                if self.in_range(node.row()) {
                    push_output(&self.output, Change::Child { node, child })
                } else {
                    empty_push()
                }
            }
        }
    }
}

impl Input for Skip {
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        if req.reverse {
            // Reversed iteration runs back toward the bound and stops there.
            let this = self.clone();
            let stream = self.input.clone().fetch(req);
            Box::new(stream.take_while(move |item| match item {
                StreamItem::Yield => true,
                StreamItem::Item(node) => this.in_range(node.row()),
            }))
        } else {
            let start = self.merge_start(req.start);
            self.input.clone().fetch(FetchRequest {
                constraint: req.constraint,
                start: Some(start),
                reverse: false,
            })
        }
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        self.input.destroy();
    }
}
