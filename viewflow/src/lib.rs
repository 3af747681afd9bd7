//! Viewflow is an incremental view-maintenance dataflow engine for
//! reactive relational queries.
//!
//! Given a declarative query plan, the [`builder`] constructs a directed
//! acyclic graph of operators over base [`source`]s. The graph speaks two
//! protocols: `fetch` pulls a lazy ordered stream of nodes (rows plus lazy
//! child relationships) to hydrate an initial result, and `push` drives
//! row-level changes root-ward so that downstream materialized views are
//! updated incrementally, without recomputation.
//!
//! Every stream the engine produces is cooperative: in-band yield markers
//! give consumers well-defined points to pause, check budgets, or hand
//! control to a scheduler. There is no internal concurrency; a push runs to
//! completion through every reachable operator before the next mutation
//! begins.
//!
//! # Example
//!
//! ```
//! use viewflow::ast::{Ast, Correlation, CorrelatedSubquery};
//! use viewflow::builder::{build_query, BuilderDelegate};
//! use viewflow::row::Row;
//! use viewflow::schema::{Schema, SortSpec};
//! use viewflow::source::{Source, SourceChange};
//! use viewflow::storage::{MemoryStorage, Storage};
//! use viewflow::view::{View, ViewFormat};
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! struct Delegate {
//!     issues: Rc<Source>,
//!     comments: Rc<Source>,
//! }
//!
//! impl BuilderDelegate for Delegate {
//!     fn get_source(&self, table: &str) -> Option<Rc<Source>> {
//!         match table {
//!             "issues" => Some(self.issues.clone()),
//!             "comments" => Some(self.comments.clone()),
//!             _ => None,
//!         }
//!     }
//!     fn create_storage(&self, _name: &str) -> Rc<dyn Storage> {
//!         Rc::new(MemoryStorage::new())
//!     }
//! }
//!
//! let delegate = Delegate {
//!     issues: Source::new(Schema::new("issues", &["id"], SortSpec::asc(&["id"]))),
//!     comments: Source::new(Schema::new("comments", &["id"], SortSpec::asc(&["id"]))),
//! };
//! delegate.issues.push(SourceChange::Add(Row::from_json(json!({"id": "i1"}))));
//!
//! let ast = Ast::table("issues").with_related(CorrelatedSubquery {
//!     correlation: Correlation::new(&["id"], &["issue_id"]),
//!     subquery: Ast::table("comments"),
//! });
//! let query = build_query(&ast, &delegate).unwrap();
//! let view = View::connect(
//!     query.root.clone(),
//!     ViewFormat::list().with_relationship("comments", ViewFormat::list()),
//! );
//!
//! delegate
//!     .comments
//!     .push(SourceChange::Add(Row::from_json(json!({"id": "c1", "issue_id": "i1"}))));
//! assert_eq!(
//!     view.to_json(),
//!     json!([{"id": "i1", "comments": [{"id": "c1", "issue_id": "i1"}]}])
//! );
//! ```

pub mod ast;
pub mod builder;
pub mod catch;
pub mod error;
pub mod input;
pub mod node;
pub mod operators;
pub mod overlay;
pub mod row;
pub mod schema;
pub mod source;
pub mod storage;
pub mod stream;
pub mod value;
pub mod view;

pub use crate::input::{Constraint, FetchRequest, Input, Output};
pub use crate::node::{Change, Node};
pub use crate::row::Row;
pub use crate::schema::{Schema, SortSpec};
pub use crate::source::{Source, SourceChange};
pub use crate::stream::{NodeStream, PushStream, StreamItem};
pub use crate::value::Value;
