//! Reconciliation: snapshot both sides, classify drift, plan, apply, commit.

pub mod applier;
pub mod conflict;
pub mod drift;
pub mod mapping_store;
pub mod orchestrator;
pub mod planner;
pub mod snapshot;

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

pub use applier::{ApplyReport, ApplyResult, FailedOp, OpError, OpOutcome, OpStatus};
pub use conflict::{Conflict, Resolution};
pub use drift::{DriftReport, Finding, Identity};
pub use mapping_store::{Loaded, MappingStore, RebuildReport};
pub use orchestrator::{PassReport, SyncEngine, SyncError};
pub use planner::{Binding, Plan, PlanIssue, Stamp, UntrackedDeck};
pub use snapshot::{Snapshot, SnapshotIssue};

/// Shared stop request for a running pass.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
	pub fn new() -> Self {
		CancelFlag::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}
