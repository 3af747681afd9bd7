//! The cooperative stream model.
//!
//! Every sequence the engine produces is lazy and carries in-band `Yield`
//! markers: the single point at which a consumer may pause to check
//! cancellation or budgets, or hand control to a scheduler. Operators must
//! forward yield markers unchanged; a marker never replaces a real item.
//!
//! Fetch streams carry nodes between markers. Push streams carry markers
//! only: each element of a [`PushStream`] *is* a yield point, and draining
//! the stream is what drives propagation through the graph.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::node::Node;
use crate::row::Row;

/// An element of a fetch stream: a cooperative pause point or a real item.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem<T> {
    Yield,
    Item(T),
}

impl<T> StreamItem<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StreamItem<U> {
        match self {
            StreamItem::Yield => StreamItem::Yield,
            StreamItem::Item(item) => StreamItem::Item(f(item)),
        }
    }
}

/// A lazy ordered sequence of nodes interleaved with yield markers.
pub type NodeStream = Box<dyn Iterator<Item = StreamItem<Node>>>;

/// A lazy propagation stream; every element is a yield point.
pub type PushStream = Box<dyn Iterator<Item = ()>>;

pub fn empty_nodes() -> NodeStream {
    Box::new(std::iter::empty())
}

pub fn from_nodes(nodes: Vec<Node>) -> NodeStream {
    Box::new(nodes.into_iter().map(StreamItem::Item))
}

pub fn empty_push() -> PushStream {
    Box::new(std::iter::empty())
}

/// A push stream consisting of a single yield point.
pub fn yield_once() -> PushStream {
    Box::new(std::iter::once(()))
}

/// Drains a fetch stream, discarding yield markers.
pub fn consume(stream: NodeStream) -> Vec<Node> {
    skip_yields(stream).collect()
}

/// Pulls the first real item, abandoning the rest of the stream.
pub fn first(stream: NodeStream) -> Option<Node> {
    skip_yields(stream).next()
}

pub fn skip_yields(stream: NodeStream) -> impl Iterator<Item = Node> {
    stream.filter_map(|item| match item {
        StreamItem::Yield => None,
        StreamItem::Item(node) => Some(node),
    })
}

/// Drives a push stream to completion, ignoring its yield points.
pub fn drain(stream: PushStream) {
    for () in stream {}
}

/// Maps the nodes of a stream, forwarding yield markers unchanged.
pub fn map_nodes(
    stream: NodeStream,
    mut f: impl FnMut(Node) -> Node + 'static,
) -> NodeStream {
    Box::new(stream.map(move |item| item.map(&mut f)))
}

/// Defers construction of a push stream until it is first polled. Used to
/// sequence downstream pushes without starting them eagerly.
pub fn defer_push(f: impl FnOnce() -> PushStream + 'static) -> PushStream {
    chain_pushes(vec![Box::new(f)])
}

pub type PushThunk = Box<dyn FnOnce() -> PushStream>;

/// Chains deferred push streams: each thunk is invoked only once every
/// earlier stream has been fully consumed.
pub fn chain_pushes(thunks: Vec<PushThunk>) -> PushStream {
    Box::new(ChainPushes {
        thunks: thunks.into(),
        current: None,
    })
}

struct ChainPushes {
    thunks: VecDeque<PushThunk>,
    current: Option<PushStream>,
}

impl Iterator for ChainPushes {
    type Item = ();

    fn next(&mut self) -> Option<()> {
        loop {
            if let Some(current) = &mut self.current {
                match current.next() {
                    Some(y) => return Some(y),
                    None => self.current = None,
                }
            }
            let thunk = self.thunks.pop_front()?;
            self.current = Some(thunk());
        }
    }
}

/// Collapses runs of adjacent yield markers left behind by operators that
/// delete items (filters, skip, take), preserving the invariant that no
/// yield marker directly follows another.
pub fn squelch_yields(stream: NodeStream) -> NodeStream {
    Box::new(SquelchYields {
        inner: stream,
        last_was_yield: false,
    })
}

struct SquelchYields {
    inner: NodeStream,
    last_was_yield: bool,
}

impl Iterator for SquelchYields {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        loop {
            match self.inner.next()? {
                StreamItem::Yield if self.last_was_yield => {}
                StreamItem::Yield => {
                    self.last_was_yield = true;
                    return Some(StreamItem::Yield);
                }
                StreamItem::Item(node) => {
                    self.last_was_yield = false;
                    return Some(StreamItem::Item(node));
                }
            }
        }
    }
}

/// Interleaves a yield marker ahead of every `every`-th item, starting with
/// the first. Sources use this to give consumers periodic pause points.
pub fn interleave_yields(
    iter: impl Iterator<Item = Node> + 'static,
    every: usize,
) -> NodeStream {
    assert!(every > 0, "yield interval must be positive");
    Box::new(InterleaveYields {
        inner: Box::new(iter),
        pending: None,
        emitted: 0,
        every,
    })
}

struct InterleaveYields {
    inner: Box<dyn Iterator<Item = Node>>,
    pending: Option<Node>,
    emitted: usize,
    every: usize,
}

impl Iterator for InterleaveYields {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        if let Some(node) = self.pending.take() {
            return Some(StreamItem::Item(node));
        }
        let node = self.inner.next()?;
        if self.emitted % self.every == 0 {
            self.emitted += 1;
            self.pending = Some(node);
            Some(StreamItem::Yield)
        } else {
            self.emitted += 1;
            Some(StreamItem::Item(node))
        }
    }
}

pub type RowComparator = Rc<dyn Fn(&Row, &Row) -> Ordering>;

/// K-way sorted merge of already-sorted streams, emitting rows that compare
/// equal across branches exactly once. Yield markers from every branch are
/// forwarded (and collapsed where refills would leave them adjacent).
pub fn merge_distinct(streams: Vec<NodeStream>, cmp: RowComparator) -> NodeStream {
    let heads = streams.iter().map(|_| Head::Pending).collect();
    squelch_yields(Box::new(MergeDistinct {
        streams,
        heads,
        cmp,
    }))
}

enum Head {
    Pending,
    Ready(Node),
    Done,
}

struct MergeDistinct {
    streams: Vec<NodeStream>,
    heads: Vec<Head>,
    cmp: RowComparator,
}

impl Iterator for MergeDistinct {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        // Refill every pending head, surfacing yields as they come.
        for (head, stream) in self.heads.iter_mut().zip(self.streams.iter_mut()) {
            while matches!(head, Head::Pending) {
                match stream.next() {
                    None => *head = Head::Done,
                    Some(StreamItem::Yield) => return Some(StreamItem::Yield),
                    Some(StreamItem::Item(node)) => *head = Head::Ready(node),
                }
            }
        }

        let mut min: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            if let Head::Ready(node) = head {
                min = match min {
                    None => Some(i),
                    Some(j) => {
                        let Head::Ready(best) = &self.heads[j] else {
                            unreachable!()
                        };
                        if (self.cmp)(node.row(), best.row()) == Ordering::Less {
                            Some(i)
                        } else {
                            Some(j)
                        }
                    }
                };
            }
        }

        let min = min?;
        let Head::Ready(node) = std::mem::replace(&mut self.heads[min], Head::Pending) else {
            unreachable!()
        };
        // Discard heads in other branches that carry the same row.
        for head in self.heads.iter_mut() {
            if let Head::Ready(other) = head {
                if (self.cmp)(other.row(), node.row()) == Ordering::Equal {
                    *head = Head::Pending;
                }
            }
        }
        Some(StreamItem::Item(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::compare_values;
    use serde_json::json;

    fn node(id: i64) -> Node {
        Node::new(Row::from_json(json!({ "id": id })))
    }

    fn ids(stream: NodeStream) -> Vec<i64> {
        consume(stream)
            .into_iter()
            .map(|n| match n.row().value("id") {
                crate::value::Value::Number(f) => f as i64,
                other => panic!("unexpected id {other:?}"),
            })
            .collect()
    }

    fn no_adjacent_yields(stream: NodeStream) -> bool {
        let mut last_was_yield = false;
        for item in stream {
            match item {
                StreamItem::Yield if last_was_yield => return false,
                StreamItem::Yield => last_was_yield = true,
                StreamItem::Item(_) => last_was_yield = false,
            }
        }
        true
    }

    #[test]
    fn squelch_collapses_adjacent_yields() {
        let raw: NodeStream = Box::new(
            vec![
                StreamItem::Yield,
                StreamItem::Yield,
                StreamItem::Item(node(1)),
                StreamItem::Yield,
                StreamItem::Yield,
                StreamItem::Item(node(2)),
            ]
            .into_iter(),
        );
        let squelched: Vec<_> = squelch_yields(raw).collect();
        assert_eq!(squelched.len(), 4);
        assert!(matches!(squelched[0], StreamItem::Yield));
        assert!(matches!(squelched[2], StreamItem::Yield));
    }

    #[test]
    fn interleave_satisfies_yield_invariant() {
        let stream = interleave_yields((0..10).map(node), 3);
        assert!(no_adjacent_yields(stream));
        let stream = interleave_yields((0..10).map(node), 3);
        assert_eq!(ids(stream), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn chain_pushes_defers_construction() {
        use std::cell::Cell;
        let started: Rc<Cell<usize>> = Rc::new(Cell::new(0));
        let s1 = started.clone();
        let s2 = started.clone();
        let mut chained = chain_pushes(vec![
            Box::new(move || {
                s1.set(s1.get() + 1);
                yield_once()
            }),
            Box::new(move || {
                s2.set(s2.get() + 1);
                empty_push()
            }),
        ]);
        assert_eq!(started.get(), 0);
        assert_eq!(chained.next(), Some(()));
        assert_eq!(started.get(), 1);
        assert_eq!(chained.next(), None);
        assert_eq!(started.get(), 2);
    }

    #[test]
    fn merge_distinct_orders_and_dedups() {
        let cmp: RowComparator =
            Rc::new(|a, b| compare_values(&a.value("id"), &b.value("id")));
        let left: NodeStream = Box::new(
            vec![
                StreamItem::Item(node(1)),
                StreamItem::Yield,
                StreamItem::Item(node(3)),
            ]
            .into_iter(),
        );
        let right = from_nodes(vec![node(2), node(3), node(4)]);
        let merged = merge_distinct(vec![left, right], cmp);
        assert_eq!(ids(merged), vec![1, 2, 3, 4]);
    }
}
