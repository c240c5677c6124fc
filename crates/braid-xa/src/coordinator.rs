//! Two-phase commit coordinator.
//!
//! One coordinator sits at the root of every transaction tree and owns all
//! of its sub-coordinators. Commit runs the classic protocol:
//! - Prepare phase: every branch prepares, possibly in parallel
//! - Commit phase: only once every branch prepared; otherwise roll back
//!
//! A lone participant is committed in one phase. Completion (commit,
//! rollback, expiry) is serialised, and a completion that finds the
//! transaction already terminal reports that state without acting again.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use braid_common::prelude::*;

use crate::executor::Executor;
use crate::sub_coordinator::{BranchVote, CommitTally, SubCoordinator};

/// Root of a transaction tree.
///
/// Shared by every transaction in the tree. Nested transactions and joined
/// calls add their sub-coordinators here, and only the root's commit or
/// rollback (or expiry) drives them to an outcome.
pub struct Coordinator {
    /// Xid of the transaction that began the tree
    xid: Xid,
    /// The global outcome is decided by a remote root
    has_super: bool,
    /// Global state
    state: RwLock<XaState>,
    /// Every branch of the tree, in enlistment order
    subs: RwLock<Vec<Arc<SubCoordinator>>>,
    /// Serialises commit, rollback, remote prepare and expiry
    completion: Mutex<()>,
    started: Instant,
    /// Deadline after `started`
    timeout: Duration,
    /// Commit a lone participant without a prepare round
    one_phase: bool,
    /// Prepare branches concurrently on the shared executor
    parallel_prepare: bool,
    /// The terminal outcome was handed to bookkeeping
    outcome_claimed: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator in `NoTransaction`. The deadline counts from
    /// here; `begin` makes it active.
    pub fn new(xid: Xid, has_super: bool, config: &XaConfig) -> Self {
        Self {
            xid,
            has_super,
            state: RwLock::new(XaState::NoTransaction),
            subs: RwLock::new(Vec::new()),
            completion: Mutex::new(()),
            started: Instant::now(),
            timeout: config.transaction_timeout,
            one_phase: config.one_phase_optimization,
            parallel_prepare: config.parallel_prepare,
            outcome_claimed: AtomicBool::new(false),
        }
    }

    /// Xid of the root transaction.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// True when a remote root decides the outcome and this tree only
    /// answers its commands.
    pub fn has_super(&self) -> bool {
        self.has_super
    }

    /// `NoTransaction -> Active`.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state != XaState::NoTransaction {
            return Err(TransactionError::InvalidState {
                xid: self.xid,
                state: *state,
            }
            .into());
        }
        *state = XaState::Active;
        debug!("Transaction {} began", self.xid);
        Ok(())
    }

    /// Current global state.
    pub fn state(&self) -> XaState {
        *self.state.read()
    }

    fn set_state(&self, state: XaState) {
        *self.state.write() = state;
    }

    /// Instant after which the expiry timer rolls the tree back.
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    /// Whether `now` is past the deadline. Says nothing about the state.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// The terminal state, returned to exactly one caller.
    ///
    /// Expiry and the owning thread may both finish a transaction; whichever
    /// asks first after it became terminal records the outcome. Returns
    /// `None` while the transaction is still running.
    pub fn claim_outcome(&self) -> Option<XaState> {
        let state = self.state();
        if !state.is_terminal() || self.outcome_claimed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(state)
    }

    /// Take ownership of a new branch of the tree.
    pub fn add_sub_coordinator(&self, sub: Arc<SubCoordinator>) {
        self.subs.write().push(sub);
    }

    /// Snapshot of the branches.
    pub fn sub_coordinators(&self) -> Vec<Arc<SubCoordinator>> {
        self.subs.read().clone()
    }

    /// Total number of adapters across the tree.
    pub fn resource_count(&self) -> usize {
        self.subs.read().iter().map(|s| s.len()).sum()
    }

    /// `Active -> MarkedRollback`. Returns false when the transaction is
    /// already past the point where it can be marked.
    pub fn set_rollback_only(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            XaState::Active => {
                *state = XaState::MarkedRollback;
                warn!("Transaction {} marked rollback-only", self.xid);
                true
            }
            XaState::MarkedRollback => true,
            _ => false,
        }
    }

    /// Drive the tree to completion.
    ///
    /// Returns `Ok(Committed)` or an error naming the terminal outcome
    /// (rolled back or heuristic mixed). The state is terminal either way.
    pub fn commit(&self) -> Result<XaState> {
        let _completion = self.completion.lock();
        match self.state() {
            XaState::Committed => return Ok(XaState::Committed),
            XaState::RolledBack => return Err(TransactionError::RolledBack(self.xid).into()),
            XaState::HeuristicMixed => return Err(TransactionError::HeuristicMixed(self.xid).into()),
            XaState::Unknown => return Err(TransactionError::HeuristicHazard(self.xid).into()),
            XaState::Active | XaState::MarkedRollback => {}
            XaState::Prepared => {
                // Prepared earlier by a remote root.
                let subs = self.sub_coordinators();
                let result = self.commit_phase(&subs);
                self.finish(&subs);
                return result;
            }
            state => {
                return Err(TransactionError::InvalidState {
                    xid: self.xid,
                    state,
                }
                .into())
            }
        }

        let subs = self.sub_coordinators();
        for sub in &subs {
            sub.before_completion();
        }

        let result = if self.must_roll_back(&subs) {
            info!("Transaction {} is rollback-only, rolling back", self.xid);
            self.rollback_all(&subs);
            Err(TransactionError::RolledBack(self.xid).into())
        } else if let Some(sub) = self.one_phase_candidate(&subs) {
            self.commit_one_phase(&subs, &sub)
        } else {
            self.commit_two_phase(&subs)
        };

        self.finish(&subs);
        result
    }

    /// Roll back the tree, best effort. A terminal transaction is left
    /// untouched and its state returned.
    pub fn rollback(&self) -> Result<XaState> {
        let _completion = self.completion.lock();
        let state = self.state();
        if state.is_terminal() {
            return Ok(state);
        }
        let subs = self.sub_coordinators();
        self.rollback_all(&subs);
        self.finish(&subs);
        Ok(XaState::RolledBack)
    }

    /// Phase one only, on behalf of a remote root.
    ///
    /// On success the tree stays `Prepared` until a COMMIT or ROLLBACK
    /// arrives. A tree with nothing to commit completes immediately and votes
    /// read-only.
    pub fn prepare_branch(&self) -> Result<Vote> {
        let _completion = self.completion.lock();
        match self.state() {
            XaState::Prepared => return Ok(Vote::Ok),
            XaState::Committed => return Ok(Vote::ReadOnly),
            XaState::Active | XaState::MarkedRollback => {}
            XaState::RolledBack => return Err(TransactionError::RolledBack(self.xid).into()),
            state => {
                return Err(TransactionError::InvalidState {
                    xid: self.xid,
                    state,
                }
                .into())
            }
        }

        let subs = self.sub_coordinators();
        for sub in &subs {
            sub.before_completion();
        }

        if self.must_roll_back(&subs) {
            self.rollback_all(&subs);
            self.finish(&subs);
            return Err(TransactionError::RolledBack(self.xid).into());
        }

        match self.prepare_phase(&subs) {
            BranchVote::Abort => {
                self.rollback_all(&subs);
                self.finish(&subs);
                Err(TransactionError::RolledBack(self.xid).into())
            }
            BranchVote::ReadOnly => {
                self.set_state(XaState::Committed);
                self.finish(&subs);
                Ok(Vote::ReadOnly)
            }
            BranchVote::Commit => {
                self.set_state(XaState::Prepared);
                debug!("Branch {} prepared, awaiting decision", self.xid);
                Ok(Vote::Ok)
            }
        }
    }

    /// The tree or any branch of it was marked rollback-only.
    fn must_roll_back(&self, subs: &[Arc<SubCoordinator>]) -> bool {
        self.state() == XaState::MarkedRollback || subs.iter().any(|s| s.is_rollback_only())
    }

    /// The only sub-coordinator holding resources, if it holds exactly one.
    fn one_phase_candidate(&self, subs: &[Arc<SubCoordinator>]) -> Option<Arc<SubCoordinator>> {
        if !self.one_phase {
            return None;
        }
        let mut busy = subs.iter().filter(|s| !s.is_empty());
        match (busy.next(), busy.next()) {
            (Some(sub), None) if sub.len() == 1 => Some(sub.clone()),
            _ => None,
        }
    }

    /// `Committing -> Committed` without a prepare round. A failure rolls
    /// everything back.
    fn commit_one_phase(&self, subs: &[Arc<SubCoordinator>], sub: &SubCoordinator) -> Result<XaState> {
        self.set_state(XaState::Committing);
        match sub.one_phase_commit() {
            Ok(()) => {
                self.set_state(XaState::Committed);
                debug!("Transaction {} committed in one phase", self.xid);
                Ok(XaState::Committed)
            }
            Err(e) => {
                warn!("One-phase commit of {} failed, rolling back: {}", self.xid, e);
                self.rollback_all(subs);
                Err(TransactionError::RolledBack(self.xid).into())
            }
        }
    }

    /// Prepare everything, then commit or roll back on the votes.
    fn commit_two_phase(&self, subs: &[Arc<SubCoordinator>]) -> Result<XaState> {
        match self.prepare_phase(subs) {
            BranchVote::Abort => {
                self.rollback_all(subs);
                Err(TransactionError::RolledBack(self.xid).into())
            }
            BranchVote::ReadOnly => {
                self.set_state(XaState::Committed);
                debug!("Transaction {} had nothing to commit", self.xid);
                Ok(XaState::Committed)
            }
            BranchVote::Commit => {
                self.set_state(XaState::Prepared);
                self.commit_phase(subs)
            }
        }
    }

    /// `Preparing`, then every branch prepares. Commit on any branch must
    /// not begin until this returns.
    fn prepare_phase(&self, subs: &[Arc<SubCoordinator>]) -> BranchVote {
        self.set_state(XaState::Preparing);
        let busy: Vec<Arc<SubCoordinator>> =
            subs.iter().filter(|s| !s.is_empty()).cloned().collect();

        let votes: Vec<BranchVote> = match self.prepare_executor(busy.len()) {
            Some(executor) => {
                let tasks: Vec<_> = busy.into_iter().map(|sub| move || sub.prepare()).collect();
                executor
                    .run_all(tasks)
                    .into_iter()
                    .map(|vote| {
                        vote.unwrap_or_else(|e| {
                            error!("Prepare of a branch of {} did not finish: {}", self.xid, e);
                            BranchVote::Abort
                        })
                    })
                    .collect()
            }
            None => {
                let mut votes = Vec::with_capacity(busy.len());
                for sub in busy {
                    let vote = sub.prepare();
                    votes.push(vote);
                    if vote == BranchVote::Abort {
                        break;
                    }
                }
                votes
            }
        };

        if votes.contains(&BranchVote::Abort) {
            BranchVote::Abort
        } else if votes.contains(&BranchVote::Commit) {
            BranchVote::Commit
        } else {
            BranchVote::ReadOnly
        }
    }

    /// Executor for a parallel prepare over `branches`, or `None` to prepare
    /// sequentially.
    fn prepare_executor(&self, branches: usize) -> Option<&'static Executor> {
        if !self.parallel_prepare || branches < 2 {
            return None;
        }
        match Executor::global() {
            Ok(executor) => Some(executor),
            Err(e) => {
                warn!("Preparing {} sequentially: {}", self.xid, e);
                None
            }
        }
    }

    /// Phase two. Every branch is asked to commit even after a failure;
    /// failures are never retried.
    fn commit_phase(&self, subs: &[Arc<SubCoordinator>]) -> Result<XaState> {
        self.set_state(XaState::Committing);
        let tally = subs
            .iter()
            .map(|s| s.commit())
            .fold(CommitTally::default(), CommitTally::merge);

        if tally.failed > 0 && tally.committed > 0 {
            self.set_state(XaState::HeuristicMixed);
            error!(
                "Transaction {} finished with a heuristic mixed outcome: {} committed, {} failed",
                self.xid, tally.committed, tally.failed
            );
            return Err(TransactionError::HeuristicMixed(self.xid).into());
        }

        if tally.failed > 0 {
            // Prepared participants that failed to commit may still have
            // committed, so this is not a rollback either.
            self.set_state(XaState::Unknown);
            error!(
                "Transaction {} outcome unknown: no participant acknowledged commit, {} failed",
                self.xid, tally.failed
            );
            return Err(TransactionError::HeuristicHazard(self.xid).into());
        }

        self.set_state(XaState::Committed);
        debug!("Transaction {} committed ({} resources)", self.xid, tally.committed);
        Ok(XaState::Committed)
    }

    /// `RollingBack -> RolledBack`, asking every branch whatever fails.
    fn rollback_all(&self, subs: &[Arc<SubCoordinator>]) {
        self.set_state(XaState::RollingBack);
        let failed: usize = subs.iter().map(|s| s.rollback()).sum();
        if failed > 0 {
            warn!("Transaction {} rolled back with {} failed resources", self.xid, failed);
        }
        self.set_state(XaState::RolledBack);
        debug!("Transaction {} rolled back", self.xid);
    }

    /// Run `after_completion` callbacks with the final state.
    fn finish(&self, subs: &[Arc<SubCoordinator>]) {
        let state = self.state();
        for sub in subs {
            sub.after_completion(state);
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("xid", &self.xid)
            .field("has_super", &self.has_super)
            .field("state", &self.state())
            .field("branches", &self.subs.read().len())
            .finish()
    }
}
