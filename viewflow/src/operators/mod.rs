//! The operator library: stateless and stateful transforms over the
//! fetch/push protocols.

pub mod exists;
pub mod fan;
pub mod filter;
pub mod flipped_join;
pub mod join;
pub mod skip;
pub mod take;
pub mod union;

use std::cell::RefCell;
use std::rc::Weak;

use crate::input::{push_to, Output};
use crate::node::Change;
use crate::stream::{empty_push, PushStream};

/// Pushes into an operator's registered output, discarding the change when
/// nothing downstream is listening.
pub(crate) fn push_output(
    output: &RefCell<Option<Weak<dyn Output>>>,
    change: Change,
) -> PushStream {
    match output.borrow().clone() {
        Some(output) => push_to(&output, change),
        None => empty_push(),
    }
}
