//! Shared fixtures for the operator and end-to-end tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use viewflow::ast::Condition;
use viewflow::builder::BuilderDelegate;
use viewflow::catch::{Catch, CaughtChange, CaughtNode};
use viewflow::input::Input;
use viewflow::row::Row;
use viewflow::schema::{Schema, SortSpec, System};
use viewflow::source::{Source, SourceChange, SourceConnection};
use viewflow::storage::{MemoryStorage, Storage};
use viewflow::value::Value;

pub fn row(value: serde_json::Value) -> Row {
    Row::from_json(value)
}

pub fn keys(columns: &[&str]) -> Vec<Box<str>> {
    columns.iter().map(|c| Box::from(*c)).collect()
}

pub fn source(table: &str, primary_key: &[&str], sort: &[&str]) -> Rc<Source> {
    Source::new(Schema::new(table, primary_key, SortSpec::asc(sort)))
}

pub fn permission_source(table: &str, primary_key: &[&str], sort: &[&str]) -> Rc<Source> {
    Source::new(
        Schema::new(table, primary_key, SortSpec::asc(sort)).with_system(System::Permissions),
    )
}

pub fn seed(source: &Rc<Source>, rows: Vec<serde_json::Value>) {
    for r in rows {
        source.push(SourceChange::Add(row(r)));
    }
}

/// Connects with the source's own ordering and no filter.
pub fn connect(source: &Rc<Source>) -> Rc<SourceConnection> {
    source
        .connect(source.schema().sort.clone(), None, BTreeSet::new())
        .expect("ordering covers the primary key")
}

pub fn connect_filtered(source: &Rc<Source>, filter: Condition) -> Rc<SourceConnection> {
    source
        .connect(source.schema().sort.clone(), Some(filter), BTreeSet::new())
        .expect("ordering covers the primary key")
}

pub fn connect_split(
    source: &Rc<Source>,
    split_edit_keys: &[&str],
) -> Rc<SourceConnection> {
    source
        .connect(
            source.schema().sort.clone(),
            None,
            split_edit_keys.iter().map(|c| Box::from(*c)).collect(),
        )
        .expect("ordering covers the primary key")
}

pub fn catch(input: Rc<dyn Input>) -> Rc<Catch> {
    Catch::connect(input)
}

/// The rows of caught nodes, as JSON, for compact assertions.
pub fn rows_of(nodes: &[CaughtNode]) -> Vec<serde_json::Value> {
    nodes.iter().map(|n| n.row.to_json()).collect()
}

pub fn ids_of(nodes: &[CaughtNode]) -> Vec<Value> {
    nodes.iter().map(|n| n.row.value("id")).collect()
}

pub fn id(value: &str) -> Value {
    Value::from(value)
}

/// A change's shorthand: kind plus the principal row's id.
pub fn describe(change: &CaughtChange) -> String {
    match change {
        CaughtChange::Add(node) => format!("add:{:?}", node.row.value("id")),
        CaughtChange::Remove(node) => format!("remove:{:?}", node.row.value("id")),
        CaughtChange::Edit { node, .. } => format!("edit:{:?}", node.row.value("id")),
        CaughtChange::Child {
            row,
            relationship_name,
            change,
        } => format!(
            "child:{:?}.{relationship_name}({})",
            row.value("id"),
            describe(change)
        ),
    }
}

/// A delegate over a fixed set of sources, with one shared storage space.
pub struct TestDelegate {
    sources: HashMap<String, Rc<Source>>,
    storages: RefCell<HashMap<String, Rc<MemoryStorage>>>,
    edges: RefCell<Vec<(String, String)>>,
    enable_not_exists: bool,
    max_flippable_joins: usize,
}

impl TestDelegate {
    pub fn new(sources: Vec<(&str, Rc<Source>)>) -> TestDelegate {
        TestDelegate {
            sources: sources
                .into_iter()
                .map(|(name, source)| (name.to_string(), source))
                .collect(),
            storages: RefCell::new(HashMap::new()),
            edges: RefCell::new(Vec::new()),
            enable_not_exists: false,
            max_flippable_joins: 3,
        }
    }

    pub fn with_not_exists(mut self) -> TestDelegate {
        self.enable_not_exists = true;
        self
    }

    pub fn with_max_flippable_joins(mut self, max: usize) -> TestDelegate {
        self.max_flippable_joins = max;
        self
    }

    pub fn storage(&self, name: &str) -> Option<Rc<MemoryStorage>> {
        self.storages.borrow().get(name).cloned()
    }

    pub fn storage_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.storages.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn edges(&self) -> Vec<(String, String)> {
        self.edges.borrow().clone()
    }
}

impl BuilderDelegate for TestDelegate {
    fn get_source(&self, table: &str) -> Option<Rc<Source>> {
        self.sources.get(table).cloned()
    }

    fn create_storage(&self, name: &str) -> Rc<dyn Storage> {
        let storage = Rc::new(MemoryStorage::new());
        self.storages
            .borrow_mut()
            .insert(name.to_string(), storage.clone());
        storage
    }

    fn add_edge(&self, source: &str, dest: &str) {
        self.edges
            .borrow_mut()
            .push((source.to_string(), dest.to_string()));
    }

    fn enable_not_exists(&self) -> bool {
        self.enable_not_exists
    }

    fn max_flippable_joins(&self) -> usize {
        self.max_flippable_joins
    }
}
