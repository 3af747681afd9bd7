mod common;

use common::*;
use serde_json::json;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use viewflow::ast::{CompareOp, Condition};
use viewflow::catch::CaughtChange;
use viewflow::error::PlannerError;
use viewflow::input::{FetchRequest, Input, Output};
use viewflow::schema::SortSpec;
use viewflow::source::SourceChange;
use viewflow::stream::{drain, PushStream};

#[test]
fn fetch_is_stable_between_pushes() {
    let users = source("users", &["id"], &["id"]);
    seed(&users, vec![json!({"id": "b"}), json!({"id": "a"})]);
    let conn = connect(&users);
    let sink = catch(conn.clone());

    let first = sink.fetch();
    let second = sink.fetch();
    assert_eq!(first, second);
    assert_eq!(rows_of(&first), vec![json!({"id": "a"}), json!({"id": "b"})]);

    users.push(SourceChange::Add(row(json!({"id": "ab"}))));
    let third = sink.fetch();
    assert_ne!(first, third);
    assert_eq!(
        rows_of(&third),
        vec![json!({"id": "a"}), json!({"id": "ab"}), json!({"id": "b"})]
    );
}

#[test]
fn ordering_must_cover_the_primary_key() {
    let users = source("users", &["id"], &["id"]);
    let err = users
        .connect(SortSpec::asc(&["name"]), None, BTreeSet::new())
        .unwrap_err();
    assert!(matches!(
        err,
        PlannerError::OrderingMissingPrimaryKey { .. }
    ));
    assert!(err.to_string().contains("quoted in PostgreSQL"));
}

#[test]
#[should_panic(expected = "already exists")]
fn duplicate_primary_key_is_fatal() {
    let users = source("users", &["id"], &["id"]);
    seed(&users, vec![json!({"id": "a"})]);
    users.push(SourceChange::Add(row(json!({"id": "a"}))));
}

#[test]
#[should_panic(expected = "is not present")]
fn removing_an_absent_row_is_fatal() {
    let users = source("users", &["id"], &["id"]);
    users.push(SourceChange::Remove(row(json!({"id": "a"}))));
}

#[test]
#[should_panic(expected = "does not match the stored row")]
fn editing_with_a_stale_old_row_is_fatal() {
    let users = source("users", &["id"], &["id"]);
    seed(&users, vec![json!({"id": "a", "n": 1})]);
    users.push(SourceChange::Edit {
        old: row(json!({"id": "a", "n": 2})),
        new: row(json!({"id": "a", "n": 3})),
    });
}

#[test]
fn split_edit_keys_rewrite_edits() {
    let comments = source("comments", &["id"], &["id"]);
    seed(&comments, vec![json!({"id": "c1", "issue_id": "i1"})]);
    let conn = connect_split(&comments, &["issue_id"]);
    let sink = catch(conn.clone());

    // Touching the split key turns the edit into remove-plus-add.
    comments.push(SourceChange::Edit {
        old: row(json!({"id": "c1", "issue_id": "i1"})),
        new: row(json!({"id": "c1", "issue_id": "i2"})),
    });
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 2);
    assert!(matches!(pushes[0], CaughtChange::Remove(_)));
    assert!(matches!(pushes[1], CaughtChange::Add(_)));

    // Other columns propagate as a plain edit.
    comments.push(SourceChange::Edit {
        old: row(json!({"id": "c1", "issue_id": "i2"})),
        new: row(json!({"id": "c1", "issue_id": "i2", "body": "hi"})),
    });
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 1);
    assert!(matches!(pushes[0], CaughtChange::Edit { .. }));
}

#[test]
fn connection_filter_splits_boundary_crossing_edits() {
    let items = source("items", &["a"], &["a"]);
    seed(&items, vec![json!({"a": 1, "x": 1}), json!({"a": 2, "x": 2})]);
    let conn = connect_filtered(&items, Condition::compare("x", CompareOp::Ge, 2));
    let sink = catch(conn.clone());

    assert_eq!(rows_of(&sink.fetch()), vec![json!({"a": 2, "x": 2})]);

    // Old fails the filter, new passes: the edit surfaces as an add.
    items.push(SourceChange::Edit {
        old: row(json!({"a": 1, "x": 1})),
        new: row(json!({"a": 1, "x": 4})),
    });
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 1);
    let CaughtChange::Add(added) = &pushes[0] else {
        panic!("expected an add, got {pushes:?}");
    };
    assert_eq!(added.row.to_json(), json!({"a": 1, "x": 4}));

    // Back across the boundary: a remove of the last-seen row.
    items.push(SourceChange::Edit {
        old: row(json!({"a": 1, "x": 4})),
        new: row(json!({"a": 1, "x": 1})),
    });
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 1);
    let CaughtChange::Remove(removed) = &pushes[0] else {
        panic!("expected a remove, got {pushes:?}");
    };
    assert_eq!(removed.row.to_json(), json!({"a": 1, "x": 4}));
}

/// An output that, while consuming a push, fetches another connection and
/// records what it observed.
struct Probe {
    other: RefCell<Option<Rc<dyn Input>>>,
    observed: RefCell<Vec<Vec<serde_json::Value>>>,
}

struct ProbePort(Weak<Probe>);

impl Output for ProbePort {
    fn push(self: Rc<Self>, _change: viewflow::node::Change) -> PushStream {
        let probe = self.0.upgrade().expect("probe is alive");
        let other = probe.other.borrow().clone().expect("probe is wired");
        let rows: Vec<_> = viewflow::stream::consume(other.fetch(FetchRequest::default()))
            .into_iter()
            .map(|n| n.row().to_json())
            .collect();
        probe.observed.borrow_mut().push(rows);
        viewflow::stream::yield_once()
    }
}

#[test]
fn unnotified_connections_observe_the_pre_push_state() {
    let users = source("users", &["id"], &["id"]);
    seed(&users, vec![json!({"id": "a"})]);

    // Connection order is notification order: the probe hangs off the
    // first connection and peeks at the second, which at that moment has
    // not been notified yet.
    let first = connect(&users);
    let second = connect(&users);

    let probe = Rc::new(Probe {
        other: RefCell::new(Some(second.clone() as Rc<dyn Input>)),
        observed: RefCell::new(Vec::new()),
    });
    let port = Rc::new(ProbePort(Rc::downgrade(&probe)));
    let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
    first.set_output(weak);

    users.push(SourceChange::Add(row(json!({"id": "b"}))));
    // Mid-push, the second connection still reads the pre-add state.
    assert_eq!(
        probe.observed.borrow().clone(),
        vec![vec![json!({"id": "a"})]]
    );
    // After the push completes, everyone sees the post-state.
    assert_eq!(
        viewflow::stream::consume(second.clone().fetch(FetchRequest::default())).len(),
        2
    );

    drain(users.gen_push(SourceChange::Remove(row(json!({"id": "b"})))));
    assert_eq!(
        probe.observed.borrow().last().unwrap().clone(),
        vec![json!({"id": "a"}), json!({"id": "b"})]
    );
}
