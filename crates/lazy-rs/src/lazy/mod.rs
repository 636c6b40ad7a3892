//! Lazy buffers, the fusion rewrites applied when they are scheduled, and their realization.
//!
//! Building a graph never touches a backend (apart from `from_host` uploads). `schedule` turns
//! the graph below a buffer into ordered [`ScheduleItem`]s and `realize` executes them, storing
//! each result on its base exactly once.

mod buffer;
pub mod config;
pub mod fusion;
mod realize;
mod schedule;

pub use buffer::{BufferId, LazyBuffer};
pub use config::{FusionLevel, LazyConfig, SplitReducePolicy};
pub use schedule::ScheduleItem;
