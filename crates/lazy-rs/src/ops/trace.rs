//! Execution tracing hooks around realized schedule units.
//!
//! Install a sink with [`install_global_sink`]; the realizer calls it before and after every load
//! or compute unit it runs. The returned guard restores the previous sink when dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use super::lazy_op::LazyOp;
use super::opcode::LoadOp;
use crate::lazy::BufferId;

/// What a schedule unit does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Load(LoadOp),
    Compute,
}

/// Identifies one executed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitContext {
    pub trace_id: u64,
    pub output: BufferId,
    pub device: String,
    pub kind: UnitKind,
    /// Number of kernel input slots (zero for loads).
    pub num_inputs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Success,
    Failure { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStats {
    pub elapsed: Duration,
    pub status: UnitStatus,
}

pub trait ExecutionTraceSink: Send + Sync {
    fn before_unit(&self, context: &UnitContext, ast: &LazyOp);
    fn after_unit(&self, context: &UnitContext, stats: &UnitStats);
}

static GLOBAL_SINK: Lazy<RwLock<Option<Arc<dyn ExecutionTraceSink>>>> =
    Lazy::new(|| RwLock::new(None));

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Restores the previously installed sink on drop.
#[must_use = "the sink is uninstalled when the guard is dropped"]
pub struct TraceSinkGuard {
    previous: Option<Arc<dyn ExecutionTraceSink>>,
}

impl Drop for TraceSinkGuard {
    fn drop(&mut self) {
        let mut slot = GLOBAL_SINK.write().expect("trace sink slot poisoned");
        *slot = self.previous.take();
    }
}

pub fn install_global_sink(sink: Arc<dyn ExecutionTraceSink>) -> TraceSinkGuard {
    let mut slot = GLOBAL_SINK.write().expect("trace sink slot poisoned");
    let previous = slot.replace(sink);
    TraceSinkGuard { previous }
}

pub fn current_sink() -> Option<Arc<dyn ExecutionTraceSink>> {
    GLOBAL_SINK.read().expect("trace sink slot poisoned").clone()
}

pub fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}
