//! Branch-local coordination.
//!
//! A sub-coordinator owns the resource adapters enlisted by one transaction
//! branch (one thread, or one nested scope on a thread) and runs the
//! branch's share of prepare, commit and rollback. It never decides the
//! global outcome; the [`Coordinator`](crate::coordinator::Coordinator) does.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use braid_common::prelude::*;

use crate::resource::{ResourceAdapter, XaResource};
use crate::xid::XidGenerator;

/// Completion callback registered on a branch.
pub trait Synchronization: Send + Sync {
    /// Called before the prepare phase starts.
    fn before_completion(&self) {}

    /// Called once the transaction reached its final state.
    fn after_completion(&self, state: XaState);
}

/// Combined prepare result of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchVote {
    /// At least one adapter prepared work to commit
    Commit,
    /// Nothing to commit in this branch
    ReadOnly,
    /// An adapter failed to prepare
    Abort,
}

/// Commit-phase tally of a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitTally {
    pub committed: usize,
    pub failed: usize,
}

impl CommitTally {
    pub fn merge(self, other: CommitTally) -> CommitTally {
        CommitTally {
            committed: self.committed + other.committed,
            failed: self.failed + other.failed,
        }
    }
}

pub struct SubCoordinator {
    xid: Xid,
    generator: Arc<XidGenerator>,
    resources: RwLock<Vec<Arc<ResourceAdapter>>>,
    rollback_only: AtomicBool,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl SubCoordinator {
    pub fn new(xid: Xid, generator: Arc<XidGenerator>) -> Self {
        Self {
            xid,
            generator,
            resources: RwLock::new(Vec::new()),
            rollback_only: AtomicBool::new(false),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Add an adapter unless one for the same resource is already present.
    ///
    /// Returns true when the resource was already known to this branch.
    pub fn add_resource(&self, adapter: Arc<ResourceAdapter>) -> bool {
        let mut resources = self.resources.write();
        if resources
            .iter()
            .any(|a| a.resource_id() == adapter.resource_id())
        {
            return true;
        }
        resources.push(adapter);
        false
    }

    /// Find the adapter for `resource`, creating one with a fresh branch Xid
    /// derived from `parent` when the resource is new to this branch.
    ///
    /// The flag is true when an existing adapter was returned.
    pub fn enlist(&self, parent: &Xid, resource: Arc<dyn XaResource>) -> (Arc<ResourceAdapter>, bool) {
        let id = resource.id();
        let mut resources = self.resources.write();
        if let Some(existing) = resources.iter().find(|a| a.resource_id() == &id) {
            return (existing.clone(), true);
        }
        let adapter = Arc::new(ResourceAdapter::new(self.next_branch_id(parent), resource));
        resources.push(adapter.clone());
        (adapter, false)
    }

    pub fn find(&self, id: &ResourceId) -> Option<Arc<ResourceAdapter>> {
        self.resources
            .read()
            .iter()
            .find(|a| a.resource_id() == id)
            .cloned()
    }

    pub fn next_branch_id(&self, parent: &Xid) -> Xid {
        self.generator.derive_branch(parent)
    }

    pub fn resources(&self) -> Vec<Arc<ResourceAdapter>> {
        self.resources.read().clone()
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }

    /// Mark the branch so that a commit turns into a rollback. Cannot be undone.
    pub fn set_rollback_only(&self) {
        if !self.rollback_only.swap(true, Ordering::SeqCst) {
            debug!("Branch {} marked rollback-only", self.xid);
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) {
        self.synchronizations.lock().push(sync);
    }

    pub fn before_completion(&self) {
        let syncs = self.synchronizations.lock().clone();
        for sync in syncs {
            sync.before_completion();
        }
    }

    pub fn after_completion(&self, state: XaState) {
        let syncs = self.synchronizations.lock().clone();
        for sync in syncs {
            sync.after_completion(state);
        }
    }

    /// Commit the single adapter of this branch without a prepare phase.
    pub fn one_phase_commit(&self) -> Result<()> {
        let resources = self.resources();
        match resources.as_slice() {
            [adapter] => adapter.commit(true),
            _ => Err(Error::internal(format!(
                "one-phase commit on branch {} with {} resources",
                self.xid,
                resources.len()
            ))),
        }
    }

    /// Prepare every adapter. Stops at the first failure.
    pub fn prepare(&self) -> BranchVote {
        let mut vote = BranchVote::ReadOnly;
        for adapter in self.resources() {
            match adapter.prepare() {
                Ok(Vote::Ok) => vote = BranchVote::Commit,
                Ok(Vote::ReadOnly) => {}
                Err(e) => {
                    warn!(
                        "Branch {} votes abort: {} failed to prepare: {}",
                        self.xid,
                        adapter.resource_id(),
                        e
                    );
                    return BranchVote::Abort;
                }
            }
        }
        vote
    }

    /// Commit every prepared adapter, continuing past failures.
    pub fn commit(&self) -> CommitTally {
        let mut tally = CommitTally::default();
        for adapter in self.resources() {
            match adapter.commit(false) {
                Ok(()) => tally.committed += 1,
                Err(_) => tally.failed += 1,
            }
        }
        tally
    }

    /// Roll back every adapter, continuing past failures. Returns the
    /// number of adapters that failed.
    pub fn rollback(&self) -> usize {
        self.resources()
            .iter()
            .filter(|adapter| adapter.rollback().is_err())
            .count()
    }
}

impl std::fmt::Debug for SubCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubCoordinator")
            .field("xid", &self.xid)
            .field("resources", &self.len())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}
