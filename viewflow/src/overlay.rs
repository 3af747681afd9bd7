//! Splicing an in-progress change into a concurrent fetch.
//!
//! While a push is in flight, consumers that have not yet been notified
//! must keep observing the pre-change state, and already-notified consumers
//! the post-change state, so that the graph exposes at most one view of the
//! change at a time. Sources and joins arrange that by rewriting streams
//! through an [`OverlayFix`]: hiding a row the observer has not been told
//! about, re-inserting one it still believes in, or swapping an edited row
//! back to its old values.

use crate::node::Node;
use crate::row::Row;
use crate::stream::{squelch_yields, NodeStream, RowComparator, StreamItem};

/// The rewrite to apply to an ordered stream.
#[derive(Clone, Debug)]
pub enum OverlayFix {
    /// Drop the row comparing equal to this one.
    Hide(Row),
    /// Splice this row in at its sort position.
    Insert(Row),
    /// Drop `hide` and splice `insert` in at its sort position.
    Replace { hide: Row, insert: Row },
}

/// Rewrites `stream` (ordered under `cmp`) according to `fix`.
///
/// Spliced-in rows surface without nested relationships: the inputs this
/// overlay compensates for no longer contain the row, so there is nothing
/// to materialize beneath it.
pub fn apply_overlay(stream: NodeStream, fix: OverlayFix, cmp: RowComparator) -> NodeStream {
    let (hide, insert) = match fix {
        OverlayFix::Hide(row) => (Some(row), None),
        OverlayFix::Insert(row) => (None, Some(row)),
        OverlayFix::Replace { hide, insert } => (Some(hide), Some(insert)),
    };
    squelch_yields(Box::new(WithOverlay {
        inner: stream,
        cmp,
        hide,
        insert,
        buffered: None,
    }))
}

struct WithOverlay {
    inner: NodeStream,
    cmp: RowComparator,
    hide: Option<Row>,
    insert: Option<Row>,
    buffered: Option<Node>,
}

impl Iterator for WithOverlay {
    type Item = StreamItem<Node>;

    fn next(&mut self) -> Option<StreamItem<Node>> {
        if let Some(node) = self.buffered.take() {
            return Some(StreamItem::Item(node));
        }
        loop {
            match self.inner.next() {
                None => {
                    return self.insert.take().map(|row| StreamItem::Item(Node::new(row)));
                }
                Some(StreamItem::Yield) => return Some(StreamItem::Yield),
                Some(StreamItem::Item(node)) => {
                    let hidden = self
                        .hide
                        .as_ref()
                        .is_some_and(|h| (self.cmp)(node.row(), h).is_eq());
                    if let Some(insert) = &self.insert {
                        if (self.cmp)(insert, node.row()).is_le() {
                            let row = self.insert.take().expect("checked above");
                            if hidden {
                                self.hide = None;
                            } else {
                                self.buffered = Some(node);
                            }
                            return Some(StreamItem::Item(Node::new(row)));
                        }
                    }
                    if hidden {
                        self.hide = None;
                        continue;
                    }
                    return Some(StreamItem::Item(node));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{consume, from_nodes};
    use crate::value::compare_values;
    use serde_json::json;
    use std::rc::Rc;

    fn node(id: i64) -> Node {
        Node::new(Row::from_json(json!({ "id": id })))
    }

    fn row(id: i64) -> Row {
        Row::from_json(json!({ "id": id }))
    }

    fn cmp() -> RowComparator {
        Rc::new(|a, b| compare_values(&a.value("id"), &b.value("id")))
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

    #[test]
    fn hide_drops_the_row() {
        let stream = from_nodes(vec![node(1), node(2), node(3)]);
        let fixed = apply_overlay(stream, OverlayFix::Hide(row(2)), cmp());
        assert_eq!(ids(fixed), vec![1, 3]);
    }

    #[test]
    fn insert_lands_in_sort_position() {
        let stream = from_nodes(vec![node(1), node(3)]);
        let fixed = apply_overlay(stream, OverlayFix::Insert(row(2)), cmp());
        assert_eq!(ids(fixed), vec![1, 2, 3]);

        // Insert past the end of the stream.
        let stream = from_nodes(vec![node(1)]);
        let fixed = apply_overlay(stream, OverlayFix::Insert(row(9)), cmp());
        assert_eq!(ids(fixed), vec![1, 9]);
    }

    #[test]
    fn replace_restores_the_old_row() {
        // An edit moved id 2 to id 4; the pre-change view has 2, not 4.
        let stream = from_nodes(vec![node(1), node(3), node(4)]);
        let fixed = apply_overlay(
            stream,
            OverlayFix::Replace {
                hide: row(4),
                insert: row(2),
            },
            cmp(),
        );
        assert_eq!(ids(fixed), vec![1, 2, 3]);
    }
}
