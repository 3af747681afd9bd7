//! The WHERE sub-pipeline and its auxiliary filter protocol.
//!
//! Between [`FilterStart`] and [`FilterEnd`] sits a chain of stages that
//! speak two protocols at once: pushes travel through every stage and are
//! transformed by the usual add/remove/edit rules, while fetches bypass the
//! chain's data path entirely — the pipeline pulls nodes straight from its
//! input and asks the chain "should I keep this node?" through
//! `begin_filter` / `filter` / `end_filter`. The bracketing calls delimit
//! one logical scan so stateful stages (Exists) may cache per-scan results.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::ast::Condition;
use crate::input::{FetchRequest, Input, Output};
use crate::node::{Change, Node};
use crate::operators::push_output;
use crate::schema::SchemaRef;
use crate::stream::{empty_push, squelch_yields, NodeStream, PushStream, StreamItem};

/// A stage of the filter chain. `filter` answers for the whole suffix of
/// the chain from this stage on; `push` transforms and forwards likewise.
pub trait FilterStage {
    fn begin_filter(&self);
    fn filter(&self, node: &Node) -> bool;
    fn end_filter(&self);
    fn push(self: Rc<Self>, change: Change) -> PushStream;
    fn destroy(&self);
}

/// Head adapter: receives the input's pushes and hands them to the chain.
pub struct FilterStart {
    input: Rc<dyn Input>,
    next: RefCell<Option<Rc<dyn FilterStage>>>,
    port: RefCell<Option<Rc<StartPort>>>,
}

struct StartPort(Weak<FilterStart>);

impl Output for StartPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        match self.0.upgrade() {
            Some(start) => start.chain().push(change),
            None => empty_push(),
        }
    }
}

impl FilterStart {
    fn new(input: Rc<dyn Input>) -> Rc<FilterStart> {
        let start = Rc::new(FilterStart {
            input: input.clone(),
            next: RefCell::new(None),
            port: RefCell::new(None),
        });
        let port = Rc::new(StartPort(Rc::downgrade(&start)));
        let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
        input.set_output(weak);
        *start.port.borrow_mut() = Some(port);
        start
    }

    fn chain(&self) -> Rc<dyn FilterStage> {
        self.next
            .borrow()
            .clone()
            .expect("filter pipeline is fully wired before use")
    }
}

/// Tail adapter: a stage that accepts everything and pushes into the main
/// chain's downstream output.
pub struct FilterEnd {
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl FilterEnd {
    pub fn new() -> Rc<FilterEnd> {
        Rc::new(FilterEnd {
            output: RefCell::new(None),
        })
    }
}

impl FilterStage for FilterEnd {
    fn begin_filter(&self) {}

    fn filter(&self, _node: &Node) -> bool {
        true
    }

    fn end_filter(&self) {}

    fn push(self: Rc<Self>, change: Change) -> PushStream {
        push_output(&self.output, change)
    }

    fn destroy(&self) {}
}

/// A pure structural predicate over the row.
pub struct Filter {
    predicate: Condition,
    next: Rc<dyn FilterStage>,
}

impl Filter {
    pub fn new(predicate: Condition, next: Rc<dyn FilterStage>) -> Rc<Filter> {
        Rc::new(Filter { predicate, next })
    }

    fn passes(&self, node: &Node) -> bool {
        self.predicate.evaluate(node.row())
    }
}

impl FilterStage for Filter {
    fn begin_filter(&self) {
        self.next.begin_filter();
    }

    fn filter(&self, node: &Node) -> bool {
        self.passes(node) && self.next.filter(node)
    }

    fn end_filter(&self) {
        self.next.end_filter();
    }

    fn push(self: Rc<Self>, change: Change) -> PushStream {
        let next = self.next.clone();
        match change {
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
            Change::Edit { old, node } => match (self.passes(&old), self.passes(&node)) {
                (true, true) => next.push(Change::Edit { old, node }),
                (true, false) => next.push(Change::Remove(old)),
                (false, true) => next.push(Change::Add(node)),
                (false, false) => empty_push(),
            },
            Change::Child { node, child } => {
                if self.passes(&node) {
                    next.push(Change::Child { node, child })
                } else {
                    empty_push()
                }
            }
        }
    }

    fn destroy(&self) {
        self.next.destroy();
    }
}

/// The pipeline as seen from the main chain: an `Input` whose fetch runs
/// every node through the filter chain.
pub struct FilterPipeline {
    start: Rc<FilterStart>,
    end: Rc<FilterEnd>,
    first: Rc<dyn FilterStage>,
}

impl FilterPipeline {
    /// Wires `input → start → first … end`. The chain from `first` must
    /// terminate at `end`.
    pub fn connect(
        input: Rc<dyn Input>,
        first: Rc<dyn FilterStage>,
        end: Rc<FilterEnd>,
    ) -> Rc<FilterPipeline> {
        let start = FilterStart::new(input);
        *start.next.borrow_mut() = Some(first.clone());
        Rc::new(FilterPipeline { start, end, first })
    }
}

impl Input for FilterPipeline {
    fn schema(&self) -> SchemaRef {
        self.start.input.schema()
    }

    fn fetch(self: Rc<Self>, req: FetchRequest) -> NodeStream {
        let chain = self.first.clone();
        chain.begin_filter();
        squelch_yields(Box::new(FilterFetch {
            inner: self.start.input.clone().fetch(req),
            chain,
            done: false,
        }))
    }

    fn set_output(&self, output: Weak<dyn Output>) {
        *self.end.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) {
        self.first.destroy();
        self.start.input.destroy();
    }
}

/// One logical scan through the chain; `end_filter` fires exactly once, on
/// exhaustion or abandonment.
struct FilterFetch {
    inner: NodeStream,
    chain: Rc<dyn FilterStage>,
    done: bool,
}

impl Iterator for FilterFetch {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        loop {
            match self.inner.next() {
                None => {
                    if !self.done {
                        self.done = true;
                        self.chain.end_filter();
                    }
                    return None;
                }
                Some(StreamItem::Yield) => return Some(StreamItem::Yield),
                Some(StreamItem::Item(node)) => {
                    if self.chain.filter(&node) {
                        return Some(StreamItem::Item(node));
                    }
                }
            }
        }
    }
}

impl Drop for FilterFetch {
    fn drop(&mut self) {
        if !self.done {
            self.chain.end_filter();
        }
    }
}
