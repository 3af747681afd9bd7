mod common;

use common::*;
use serde_json::json;
use std::cell::Cell;
use std::rc::Rc;

use viewflow::ast::ExistsOp;
use viewflow::catch::CaughtChange;
use viewflow::input::Input;
use viewflow::node::Node;
use viewflow::operators::exists::Exists;
use viewflow::operators::filter::{FilterEnd, FilterPipeline, FilterStage};
use viewflow::operators::join::Join;
use viewflow::source::SourceChange;
use viewflow::stream::from_nodes;

/// issues gated on comments through a subquery relationship, the way the
/// builder assembles EXISTS.
fn gated(
    op: ExistsOp,
) -> (
    Rc<viewflow::Source>,
    Rc<viewflow::Source>,
    Rc<viewflow::catch::Catch>,
) {
    let issues = source("issues", &["id"], &["id"]);
    let comments = source("comments", &["id"], &["id"]);
    let join = Join::connect(
        connect(&issues),
        connect(&comments),
        "comments_0",
        keys(&["id"]),
        keys(&["issue_id"]),
    );
    let schema = join.schema();
    let end = FilterEnd::new();
    let stage = Exists::new(
        "comments_0",
        op,
        keys(&["id"]),
        schema,
        end.clone() as Rc<dyn FilterStage>,
    );
    let pipeline = FilterPipeline::connect(join, stage, end);
    let sink = catch(pipeline);
    (issues, comments, sink)
}

#[test]
fn not_exists_keeps_only_childless_parents() {
    let (issues, comments, sink) = gated(ExistsOp::NotExists);
    seed(
        &issues,
        vec![json!({"id": "i1"}), json!({"id": "i2"}), json!({"id": "i3"})],
    );
    seed(
        &comments,
        vec![
            json!({"id": "c1", "issue_id": "i1"}),
            json!({"id": "c2", "issue_id": "i3"}),
        ],
    );
    assert_eq!(ids_of(&sink.fetch()), vec![id("i2")]);
}

#[test]
fn exists_keeps_parents_with_children() {
    let (issues, comments, sink) = gated(ExistsOp::Exists);
    seed(
        &issues,
        vec![json!({"id": "i1"}), json!({"id": "i2"}), json!({"id": "i3"})],
    );
    seed(
        &comments,
        vec![
            json!({"id": "c1", "issue_id": "i1"}),
            json!({"id": "c2", "issue_id": "i3"}),
        ],
    );
    assert_eq!(ids_of(&sink.fetch()), vec![id("i1"), id("i3")]);
}

#[test]
fn a_first_child_flips_the_parent_in() {
    let (issues, comments, sink) = gated(ExistsOp::Exists);
    seed(&issues, vec![json!({"id": "i2"})]);
    assert!(sink.fetch().is_empty());

    // The parent was not previously visible, so the engine emits an add of
    // the parent, not a child change.
    comments.push(SourceChange::Add(row(json!({"id": "c_new", "issue_id": "i2"}))));
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 1);
    let CaughtChange::Add(node) = &pushes[0] else {
        panic!("expected an add, got {pushes:?}");
    };
    assert_eq!(node.row.value("id"), id("i2"));

    // A second child is an ordinary child change on the now-visible parent.
    comments.push(SourceChange::Add(row(json!({"id": "c_more", "issue_id": "i2"}))));
    let pushes = sink.take_pushes();
    assert_eq!(
        describe(&pushes[0]),
        r#"child:String("i2").comments_0(add:String("c_more"))"#
    );

    // Draining back to zero children flips the parent out.
    comments.push(SourceChange::Remove(row(json!({"id": "c_more", "issue_id": "i2"}))));
    sink.take_pushes();
    comments.push(SourceChange::Remove(row(json!({"id": "c_new", "issue_id": "i2"}))));
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 1);
    assert!(matches!(pushes[0], CaughtChange::Remove(_)));
}

#[test]
fn a_first_child_flips_a_not_exists_parent_out_with_the_child_masked() {
    let (issues, comments, sink) = gated(ExistsOp::NotExists);
    seed(&issues, vec![json!({"id": "i2"})]);
    assert_eq!(ids_of(&sink.fetch()), vec![id("i2")]);

    comments.push(SourceChange::Add(row(json!({"id": "c_new", "issue_id": "i2"}))));
    let pushes = sink.take_pushes();
    assert_eq!(pushes.len(), 1);
    let CaughtChange::Remove(node) = &pushes[0] else {
        panic!("expected a remove, got {pushes:?}");
    };
    // The child was never visible downstream; it is masked out of the
    // remove.
    assert!(node.relationships["comments_0"].is_empty());
}

/// A bare Exists stage over hand-built nodes, to observe the per-scan
/// cache directly.
#[test]
fn the_scan_cache_is_keyed_by_join_values_and_cleared_on_end() {
    let schema = source("parents", &["id"], &["id"]).schema();
    let end = FilterEnd::new();
    // Join key differs from the primary key, so the cache is in play.
    let stage = Exists::new(
        "children",
        ExistsOp::Exists,
        keys(&["k"]),
        schema,
        end as Rc<dyn FilterStage>,
    );

    let materializations = Rc::new(Cell::new(0));
    let child = Node::new(row(json!({"id": "c1", "k": 1})));
    let node_for = |id: &str| {
        let counter = materializations.clone();
        let child = child.clone();
        Node::new(row(json!({"id": id, "k": 1}))).with_relationship(
            "children",
            Rc::new(move || {
                counter.set(counter.get() + 1);
                from_nodes(vec![child.clone()])
            }),
        )
    };

    stage.begin_filter();
    assert!(stage.filter(&node_for("p1")));
    assert_eq!(materializations.get(), 1);
    // Same join-key values: answered from the cache.
    assert!(stage.filter(&node_for("p2")));
    assert_eq!(materializations.get(), 1);
    stage.end_filter();

    // A fresh scan starts cold.
    stage.begin_filter();
    assert!(stage.filter(&node_for("p1")));
    assert_eq!(materializations.get(), 2);
    stage.end_filter();
}

#[test]
#[should_panic(expected = "re-entrant push into Exists")]
fn re_entering_push_is_fatal() {
    let schema = source("parents", &["id"], &["id"]).schema();
    let end = FilterEnd::new();
    let stage = Exists::new(
        "children",
        ExistsOp::Exists,
        keys(&["id"]),
        schema,
        end as Rc<dyn FilterStage>,
    );
    let node = Node::new(row(json!({"id": "p1"}))).with_relationship(
        "children",
        Rc::new(|| from_nodes(vec![Node::new(row(json!({"id": "c1"})))])),
    );

    let held = stage.clone().push(viewflow::Change::Add(node.clone()));
    // The first push's stream is still alive; entering again is a bug.
    let _ = stage.clone().push(viewflow::Change::Add(node));
    drop(held);
}
