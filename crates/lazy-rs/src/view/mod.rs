//! View algebra: how a logical shape addresses a base buffer's storage.
//!
//! Movement operations never copy. They rewrite the view stack of a [`ShapeTracker`], pushing a
//! new view only when a reshape cannot be folded into the current one.

mod tracker;
#[allow(clippy::module_inception)]
mod view;

pub use tracker::{unravel, ShapeTracker};
pub use view::{contiguous_strides, View};
