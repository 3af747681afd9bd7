mod common;

use common::*;
use serde_json::json;

use viewflow::ast::{
    Ast, Bound, CompareOp, Condition, CorrelatedSubquery, Correlation, ExistsCondition,
    ExistsOp,
};
use viewflow::builder::{build_query, BuilderDelegate};
use viewflow::error::{BuildError, PlannerError, UnsupportedFeatureError};
use viewflow::source::SourceChange;
use viewflow::storage::Storage;
use viewflow::view::{View, ViewFormat};

fn issue_tracker() -> TestDelegate {
    let issues = source("issues", &["id"], &["id"]);
    let comments = source("comments", &["id"], &["id"]);
    let labels = source("labels", &["id"], &["id"]);
    seed(
        &issues,
        vec![json!({"id": "i1"}), json!({"id": "i2"}), json!({"id": "i3"})],
    );
    seed(
        &comments,
        vec![
            json!({"id": "c1", "issue_id": "i1"}),
            json!({"id": "c2", "issue_id": "i1"}),
            json!({"id": "c3", "issue_id": "i2"}),
        ],
    );
    seed(&labels, vec![json!({"id": "l1", "issue_id": "i3"})]);
    TestDelegate::new(vec![
        ("issues", issues),
        ("comments", comments),
        ("labels", labels),
    ])
}

fn exists_comments(flip: bool) -> Condition {
    Condition::Exists(Box::new(ExistsCondition {
        op: ExistsOp::Exists,
        related: CorrelatedSubquery {
            correlation: Correlation::new(&["id"], &["issue_id"]),
            subquery: Ast::table("comments"),
        },
        flip,
    }))
}

fn exists_labels(flip: bool) -> Condition {
    Condition::Exists(Box::new(ExistsCondition {
        op: ExistsOp::Exists,
        related: CorrelatedSubquery {
            correlation: Correlation::new(&["id"], &["issue_id"]),
            subquery: Ast::table("labels"),
        },
        flip,
    }))
}

#[test]
fn related_subqueries_join_and_take_partitions_by_the_child_key() {
    let delegate = issue_tracker();
    let ast = Ast::table("issues").with_related(CorrelatedSubquery {
        correlation: Correlation::new(&["id"], &["issue_id"]),
        subquery: Ast::table("comments").with_limit(1),
    });
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());

    let fetched = sink.fetch();
    assert_eq!(ids_of(&fetched), vec![id("i1"), id("i2"), id("i3")]);
    assert_eq!(
        fetched[0].relationships["comments"]
            .iter()
            .map(|c| c.row.value("id"))
            .collect::<Vec<_>>(),
        vec![id("c1")]
    );
    assert!(fetched[2].relationships["comments"].is_empty());

    // One take storage, with per-partition windows keyed by the child key.
    let names = delegate.storage_names();
    assert_eq!(names.len(), 1);
    let storage = delegate.storage(&names[0]).unwrap();
    assert_eq!(
        storage.get(r#"["take","i1"]"#),
        Some(json!({"size": 1, "bound": {"id": "c1", "issue_id": "i1"}}))
    );
    assert_eq!(
        storage.get(r#"["take","i3"]"#),
        Some(json!({"size": 0, "bound": null}))
    );
}

#[test]
fn exists_builds_a_gated_join_with_a_uniquified_relationship() {
    let delegate = issue_tracker();
    let ast = Ast::table("issues").with_where(exists_comments(false));
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());

    let fetched = sink.fetch();
    assert_eq!(ids_of(&fetched), vec![id("i1"), id("i2")]);
    // The subquery hangs off a uniquified relationship name, limited to
    // three children.
    assert!(fetched[0].relationships.contains_key("comments_1"));
    assert!(delegate.storage_names()[0].starts_with("comments.take"));
}

#[test]
fn permission_sources_get_a_child_limit_of_one() {
    let issues = source("issues", &["id"], &["id"]);
    let grants = permission_source("grants", &["id"], &["id"]);
    seed(&issues, vec![json!({"id": "i1"})]);
    seed(
        &grants,
        vec![
            json!({"id": "g1", "issue_id": "i1"}),
            json!({"id": "g2", "issue_id": "i1"}),
        ],
    );
    let delegate = TestDelegate::new(vec![("issues", issues), ("grants", grants)]);

    let ast = Ast::table("issues").with_where(Condition::Exists(Box::new(ExistsCondition {
        op: ExistsOp::Exists,
        related: CorrelatedSubquery {
            correlation: Correlation::new(&["id"], &["issue_id"]),
            subquery: Ast::table("grants"),
        },
        flip: false,
    })));
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());
    assert_eq!(ids_of(&sink.fetch()), vec![id("i1")]);

    // The gating subquery window holds a single grant, not three.
    let storage = delegate.storage(&delegate.storage_names()[0]).unwrap();
    assert_eq!(
        storage.get(r#"["take","i1"]"#),
        Some(json!({"size": 1, "bound": {"id": "g1", "issue_id": "i1"}}))
    );
}

#[test]
fn not_exists_is_rejected_without_the_server_escape_hatch() {
    let delegate = issue_tracker();
    let not_exists = Condition::Exists(Box::new(ExistsCondition {
        op: ExistsOp::NotExists,
        related: CorrelatedSubquery {
            correlation: Correlation::new(&["id"], &["issue_id"]),
            subquery: Ast::table("comments"),
        },
        flip: false,
    }));
    let ast = Ast::table("issues").with_where(not_exists);

    let err = build_query(&ast, &delegate).unwrap_err();
    assert_eq!(
        err,
        BuildError::Unsupported(UnsupportedFeatureError::NotExistsOnClient)
    );

    let delegate = issue_tracker().with_not_exists();
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());
    assert_eq!(ids_of(&sink.fetch()), vec![id("i3")]);
}

#[test]
fn simple_wheres_are_pushed_down_to_the_source() {
    let delegate = issue_tracker();
    let ast = Ast::table("issues").with_where(Condition::compare(
        "id",
        CompareOp::Ne,
        "i2",
    ));
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());
    assert_eq!(ids_of(&sink.fetch()), vec![id("i1"), id("i3")]);
    // Fully applied at the source: no filter stage shows up in the graph
    // edges.
    assert!(delegate.edges().iter().all(|(_, d)| !d.contains("filter")));
}

#[test]
fn or_with_a_subquery_fans_out() {
    let delegate = issue_tracker();
    let ast = Ast::table("issues").with_where(Condition::Or(vec![
        exists_comments(false),
        Condition::compare("id", CompareOp::Eq, "i3"),
    ]));
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());
    assert_eq!(ids_of(&sink.fetch()), vec![id("i1"), id("i2"), id("i3")]);

    // A row matching only the simple branch still pushes through once.
    delegate
        .get_source("issues")
        .unwrap()
        .push(SourceChange::Add(row(json!({"id": "i4"}))));
    assert!(sink.take_pushes().is_empty());
}

#[test]
fn flipped_disjunctions_union_their_branches() {
    let delegate = issue_tracker();
    let ast = Ast::table("issues").with_where(Condition::Or(vec![
        exists_comments(true),
        exists_labels(true),
    ]));
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());
    // i1, i2 via comments; i3 via labels; no duplicates.
    assert_eq!(ids_of(&sink.fetch()), vec![id("i1"), id("i2"), id("i3")]);
}

#[test]
fn the_flippable_join_budget_is_enforced() {
    let delegate = issue_tracker().with_max_flippable_joins(1);
    let ast = Ast::table("issues").with_where(Condition::Or(vec![
        exists_comments(true),
        exists_labels(true),
    ]));
    let err = build_query(&ast, &delegate).unwrap_err();
    assert_eq!(
        err,
        BuildError::Planner(PlannerError::MaxFlippableJoins { required: 2, max: 1 })
    );
}

#[test]
fn start_bounds_apply_a_skip() {
    let delegate = issue_tracker();
    let mut ast = Ast::table("issues");
    ast.start = Some(Bound {
        row: row(json!({"id": "i1"})),
        exclusive: false,
    });
    let query = build_query(&ast, &delegate).unwrap();
    let sink = catch(query.root.clone());
    assert_eq!(ids_of(&sink.fetch()), vec![id("i2"), id("i3")]);
    assert!(delegate.edges().iter().any(|(_, d)| d.contains("skip")));
}

#[test]
fn unknown_tables_fail_the_build() {
    let delegate = issue_tracker();
    let err = build_query(&Ast::table("nope"), &delegate).unwrap_err();
    assert_eq!(err, BuildError::UnknownTable("nope".to_string()));
}

#[test]
fn a_built_query_feeds_a_view_end_to_end() {
    let delegate = issue_tracker();
    let ast = Ast::table("issues")
        .with_where(exists_comments(false))
        .with_related(CorrelatedSubquery {
            correlation: Correlation::new(&["id"], &["issue_id"]),
            subquery: Ast::table("comments"),
        });
    let query = build_query(&ast, &delegate).unwrap();
    let view = View::connect(
        query.root.clone(),
        ViewFormat::list().with_relationship("comments", ViewFormat::list()),
    );

    assert_eq!(
        view.to_json(),
        json!([
            {"id": "i1", "comments": [
                {"id": "c1", "issue_id": "i1"},
                {"id": "c2", "issue_id": "i1"},
            ]},
            {"id": "i2", "comments": [{"id": "c3", "issue_id": "i2"}]},
        ])
    );

    // A new comment on a previously childless issue flips it into view.
    delegate
        .get_source("comments")
        .unwrap()
        .push(SourceChange::Add(row(json!({"id": "c4", "issue_id": "i3"}))));
    assert_eq!(
        view.to_json()[2],
        json!({"id": "i3", "comments": [{"id": "c4", "issue_id": "i3"}]})
    );

    // Removing the last comment flips it back out.
    delegate
        .get_source("comments")
        .unwrap()
        .push(SourceChange::Remove(row(json!({"id": "c4", "issue_id": "i3"}))));
    assert_eq!(view.to_json().as_array().unwrap().len(), 2);
}
