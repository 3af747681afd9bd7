//! A terminal output that records everything pushed into it, with nodes
//! expanded eagerly. The test suite's window onto the graph.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::input::{FetchRequest, Input, Output};
use crate::node::{Change, Node};
use crate::row::Row;
use crate::stream::{skip_yields, yield_once, PushStream};

/// A node with all relationship thunks drained.
#[derive(Clone, Debug, PartialEq)]
pub struct CaughtNode {
    pub row: Row,
    pub relationships: BTreeMap<Box<str>, Vec<CaughtNode>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CaughtChange {
    Add(CaughtNode),
    Remove(CaughtNode),
    Edit {
        old: CaughtNode,
        node: CaughtNode,
    },
    Child {
        row: Row,
        relationship_name: Box<str>,
        change: Box<CaughtChange>,
    },
}

pub fn expand_node(node: &Node) -> CaughtNode {
    let mut relationships = BTreeMap::new();
    for name in node.relationship_names().map(Box::<str>::from).collect::<Vec<_>>() {
        let stream = node.relationship(&name).expect("name came from the node");
        let children = skip_yields(stream).map(|n| expand_node(&n)).collect();
        relationships.insert(name, children);
    }
    CaughtNode {
        row: node.row().clone(),
        relationships,
    }
}

pub fn expand_change(change: &Change) -> CaughtChange {
    match change {
        Change::Add(node) => CaughtChange::Add(expand_node(node)),
        Change::Remove(node) => CaughtChange::Remove(expand_node(node)),
        Change::Edit { old, node } => CaughtChange::Edit {
            old: expand_node(old),
            node: expand_node(node),
        },
        Change::Child { node, child } => CaughtChange::Child {
            row: node.row().clone(),
            relationship_name: child.relationship_name.clone(),
            change: Box::new(expand_change(&child.change)),
        },
    }
}

pub struct Catch {
    input: Rc<dyn Input>,
    pushes: RefCell<Vec<CaughtChange>>,
    port: RefCell<Option<Rc<CatchPort>>>,
}

struct CatchPort(Weak<Catch>);

impl Output for CatchPort {
    fn push(self: Rc<Self>, change: Change) -> PushStream {
        if let Some(catch) = self.0.upgrade() {
            catch.pushes.borrow_mut().push(expand_change(&change));
        }
        yield_once()
    }
}

impl Catch {
    pub fn connect(input: Rc<dyn Input>) -> Rc<Catch> {
        let catch = Rc::new(Catch {
            input: input.clone(),
            pushes: RefCell::new(Vec::new()),
            port: RefCell::new(None),
        });
        let port = Rc::new(CatchPort(Rc::downgrade(&catch)));
        let weak: Weak<dyn Output> = Rc::downgrade(&(port.clone() as Rc<dyn Output>));
        input.set_output(weak);
        *catch.port.borrow_mut() = Some(port);
        catch
    }

    /// Materializes a fetch eagerly.
    pub fn fetch(&self) -> Vec<CaughtNode> {
        self.fetch_with(FetchRequest::default())
    }

    pub fn fetch_with(&self, req: FetchRequest) -> Vec<CaughtNode> {
        skip_yields(self.input.clone().fetch(req))
            .map(|n| expand_node(&n))
            .collect()
    }

    /// Everything pushed since the last call, oldest first.
    pub fn take_pushes(&self) -> Vec<CaughtChange> {
        std::mem::take(&mut self.pushes.borrow_mut())
    }

    pub fn destroy(&self) {
        self.input.destroy();
    }
}
