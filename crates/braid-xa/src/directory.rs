//! Transaction directory.
//!
//! Tracks which transaction each thread is working in (a stack per thread,
//! innermost on top) and maps global ids to root transactions so that
//! transactions can be reached without a thread: by the expiry timer, by an
//! administrative rollback signal and by commands from a remote root.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use braid_common::prelude::*;
use braid_common::utils::thread_label;

use crate::context::TransactionContext;
use crate::coordinator::Coordinator;
use crate::remote::{CommandReply, CommandTransport, RemoteBranch, XaCommand};
use crate::resource::XaResource;
use crate::timer::{ExpiryListener, ExpiryTimer};
use crate::transaction::Transaction;
use crate::xid::XidGenerator;

type TransactionStack = Arc<Mutex<Vec<Arc<Transaction>>>>;

/// Directory statistics.
///
/// Every root or joined transaction is counted under exactly one outcome,
/// whoever finished it. Expired transactions also count as rolled back.
#[derive(Debug, Clone, Default)]
pub struct DirectoryStats {
    /// Transactions begun, nested ones included
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// Mixed or unknown outcomes
    pub heuristic: u64,
    /// Rolled back by the expiry timer
    pub expired: u64,
}

/// Process-wide entry point for transaction demarcation.
///
/// All operations act on the calling thread's current transaction unless
/// they take a global id. Must be held in an `Arc`: the expiry timer reports
/// back through a weak reference.
pub struct TransactionDirectory {
    config: XaConfig,
    generator: Arc<XidGenerator>,
    timer: Arc<ExpiryTimer>,
    /// Per-thread transaction stacks
    stacks: DashMap<ThreadId, TransactionStack>,
    /// Root transactions by global id
    registry: DashMap<GlobalId, Arc<Transaction>>,
    /// Transactions joined from a remote root whose thread finished, waiting
    /// for PREPARE/COMMIT/ROLLBACK
    parked: DashMap<GlobalId, Arc<Transaction>>,
    stats: Mutex<DirectoryStats>,
}

impl TransactionDirectory {
    /// Create a directory. The expiry timer is not started; call `start`
    /// or run `expire_due` from an existing scheduler.
    pub fn new(config: XaConfig) -> Arc<Self> {
        let directory = Arc::new(Self {
            generator: Arc::new(XidGenerator::new(config.node_id)),
            timer: Arc::new(ExpiryTimer::new(config.expiry_check_interval)),
            config,
            stacks: DashMap::new(),
            registry: DashMap::new(),
            parked: DashMap::new(),
            stats: Mutex::new(DirectoryStats::default()),
        });
        let listener: Weak<dyn ExpiryListener> = Arc::downgrade(&directory) as Weak<dyn ExpiryListener>;
        directory.timer.set_listener(listener);
        directory
    }

    pub fn config(&self) -> &XaConfig {
        &self.config
    }

    pub fn generator(&self) -> &Arc<XidGenerator> {
        &self.generator
    }

    /// Start the background expiry thread.
    pub fn start(&self) -> Result<()> {
        if self.timer.start()?.is_some() {
            info!(
                "Expiry timer started (timeout {:?}, interval {:?})",
                self.config.transaction_timeout, self.config.expiry_check_interval
            );
        }
        Ok(())
    }

    /// Stop the background expiry thread after its current scan.
    pub fn stop(&self) {
        self.timer.stop();
    }

    /// Run one expiry scan now. Returns the transactions rolled back.
    pub fn expire_due(&self) -> Vec<Xid> {
        self.timer.expire_due()
    }

    /// Begin a transaction on the calling thread.
    ///
    /// Nests under the thread's current transaction when there is one.
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        self.begin_with(None)
    }

    /// Begin a transaction on the calling thread, joining the propagated
    /// `context` when the call came from another process.
    pub fn begin_with(&self, context: Option<&TransactionContext>) -> Result<Arc<Transaction>> {
        let stack = self.stack_for_current();
        let current = stack.lock().last().cloned();

        let tx = match (current, context) {
            (Some(parent), _) => parent.create_sub_transaction(),
            (None, Some(ctx)) => match self.lookup(ctx.xid.global_id) {
                Some(existing) => existing.create_sub_transaction(),
                None => {
                    let tx = Transaction::begin(ctx.xid, true, self.generator.clone(), &self.config)?;
                    self.register(&tx);
                    tx
                }
            },
            (None, None) => {
                let xid = Xid::root(self.generator.new_global_id());
                let tx = Transaction::begin(xid, false, self.generator.clone(), &self.config)?;
                self.register(&tx);
                tx
            }
        };

        stack.lock().push(tx.clone());
        self.stats.lock().begun += 1;
        trace!("Thread {} now in {}", thread_label(), tx.xid());
        Ok(tx)
    }

    /// Make a root or joined transaction reachable by global id and start
    /// its expiry clock.
    fn register(&self, tx: &Arc<Transaction>) {
        self.registry.insert(tx.global_id(), tx.clone());
        self.timer.register(tx.coordinator());
        debug!(
            "Registered {} transaction {}",
            if tx.has_super() { "joined" } else { "root" },
            tx.xid()
        );
    }

    /// Commit the calling thread's current transaction. The transaction is
    /// popped whatever the outcome.
    pub fn commit(&self) -> Result<XaState> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        let result = tx.commit();
        self.pop_current(true);
        result
    }

    /// Roll back the calling thread's current transaction. The transaction is
    /// popped whatever the outcome.
    pub fn rollback(&self) -> Result<XaState> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        let result = tx.rollback();
        self.pop_current(true);
        result
    }

    /// Detach the calling thread's current transaction, suspending its
    /// enlistments. The registry is left unchanged.
    pub fn suspend(&self) -> Option<Arc<Transaction>> {
        let tx = self.current()?;
        tx.delist_all(EndFlag::Suspend);
        self.pop_current(false);
        debug!("Suspended {}", tx.xid());
        Some(tx)
    }

    /// Bind a suspended transaction to the calling thread.
    pub fn resume(&self, tx: &Arc<Transaction>) -> Result<()> {
        if let Some(current) = self.current() {
            if Arc::ptr_eq(&current, tx) {
                return Ok(());
            }
            return Err(TransactionError::AlreadyBound(current.xid()).into());
        }

        let state = tx.status();
        if !state.is_resumable() {
            return Err(TransactionError::InvalidState {
                xid: tx.xid(),
                state,
            }
            .into());
        }

        tx.resume_all()?;
        self.stack_for_current().lock().push(tx.clone());
        debug!("Resumed {}", tx.xid());
        Ok(())
    }

    /// Doom a transaction by id without holding it. Returns false when the
    /// id is unknown.
    pub fn mark_rollback_only(&self, global_id: GlobalId) -> bool {
        match self.lookup(global_id) {
            Some(tx) => {
                warn!("Transaction {} marked rollback-only by request", tx.xid());
                tx.set_rollback_only();
                true
            }
            None => false,
        }
    }

    /// Doom the calling thread's current transaction.
    pub fn set_rollback_only(&self) -> Result<()> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        tx.set_rollback_only();
        Ok(())
    }

    /// State of the calling thread's current transaction.
    pub fn status(&self) -> XaState {
        self.current()
            .map(|tx| tx.status())
            .unwrap_or(XaState::NoTransaction)
    }

    /// The calling thread's innermost transaction.
    pub fn current(&self) -> Option<Arc<Transaction>> {
        let stack = self.stacks.get(&thread::current().id())?.value().clone();
        let tx = stack.lock().last().cloned();
        tx
    }

    /// Enlist a participant with the calling thread's current transaction.
    pub fn enlist(&self, resource: Arc<dyn XaResource>) -> Result<bool> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        tx.enlist_resource(resource)
    }

    /// Enlist a remote branch reached through `transport` and return the
    /// context to send along with the outbound call.
    pub fn enlist_remote(&self, transport: Arc<dyn CommandTransport>) -> Result<TransactionContext> {
        let tx = self.current().ok_or(TransactionError::NoTransaction)?;
        let branch = Arc::new(RemoteBranch::new(transport, self.config.remote_timeout));
        let id = branch.id();
        tx.enlist_resource(branch)?;
        let xid = tx.branch_xid(&id).unwrap_or_else(|| tx.xid());
        Ok(TransactionContext::new(xid))
    }

    /// Registered or parked root transaction for `global_id`.
    pub fn transaction(&self, global_id: GlobalId) -> Option<Arc<Transaction>> {
        self.lookup(global_id)
    }

    fn lookup(&self, global_id: GlobalId) -> Option<Arc<Transaction>> {
        self.registry
            .get(&global_id)
            .or_else(|| self.parked.get(&global_id))
            .map(|e| e.value().clone())
    }

    /// Number of registered root transactions.
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of joined transactions waiting for a remote decision.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    pub fn stats(&self) -> DirectoryStats {
        self.stats.lock().clone()
    }

    /// Execute a command from the remote root of a joined transaction.
    ///
    /// Unknown transactions are presumed aborted, so only ROLLBACK succeeds
    /// for them. A joined transaction that reaches a terminal state here is
    /// retired.
    pub fn handle_command(&self, context: &TransactionContext) -> CommandReply {
        let Some(command) = context.command else {
            warn!("Command request for {} without a command", context.xid);
            return CommandReply::Error;
        };
        let tx = self.lookup(context.xid.global_id);

        let reply = match (command, &tx) {
            (XaCommand::Prepare, None) => {
                warn!("PREPARE for unknown transaction {}, voting no", context.xid);
                CommandReply::No
            }
            (XaCommand::Prepare, Some(tx)) => match tx.coordinator().prepare_branch() {
                Ok(_) => CommandReply::Yes,
                Err(e) => {
                    warn!("Branch {} votes no: {}", tx.xid(), e);
                    CommandReply::No
                }
            },
            (XaCommand::Commit, None) => {
                error!("COMMIT for unknown transaction {}", context.xid);
                CommandReply::Error
            }
            (XaCommand::Commit, Some(tx)) => match tx.coordinator().commit() {
                Ok(_) => CommandReply::Yes,
                Err(e) => {
                    error!("Branch {} failed to commit: {}", tx.xid(), e);
                    CommandReply::Error
                }
            },
            (XaCommand::Rollback, None) => {
                debug!("ROLLBACK for unknown transaction {}", context.xid);
                CommandReply::Yes
            }
            (XaCommand::Rollback, Some(tx)) => match tx.coordinator().rollback() {
                Ok(_) => CommandReply::Yes,
                Err(e) => {
                    error!("Branch {} failed to roll back: {}", tx.xid(), e);
                    CommandReply::Error
                }
            },
        };

        if let Some(tx) = tx {
            if tx.status().is_terminal() && self.parked.remove_if(&tx.global_id(), |_, v| Arc::ptr_eq(v, &tx)).is_some() {
                self.retire(&tx);
            }
        }
        debug!("{} for {} answered {:?}", command, context.xid, reply);
        reply
    }

    /// The calling thread's stack, created on first use.
    fn stack_for_current(&self) -> TransactionStack {
        self.stacks
            .entry(thread::current().id())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .value()
            .clone()
    }

    /// Pop the calling thread's current transaction. When the stack empties
    /// it is dropped and, with `purge`, the popped transaction leaves the
    /// registry.
    fn pop_current(&self, purge: bool) -> Option<Arc<Transaction>> {
        let id = thread::current().id();
        let stack = self.stacks.get(&id)?.value().clone();
        let (tx, empty) = {
            let mut stack = stack.lock();
            let tx = stack.pop()?;
            (tx, stack.is_empty())
        };
        if !empty {
            return Some(tx);
        }

        self.stacks.remove(&id);
        if purge && !tx.is_nested() {
            self.registry.remove_if(&tx.global_id(), |_, v| Arc::ptr_eq(v, &tx));
            if tx.has_super() && !tx.status().is_terminal() {
                debug!("Parking {} until the remote root decides", tx.xid());
                self.parked.insert(tx.global_id(), tx.clone());
            } else {
                self.retire(&tx);
            }
        }
        Some(tx)
    }

    /// Forget a finished root transaction and record its outcome.
    fn retire(&self, tx: &Arc<Transaction>) {
        self.generator.release(tx.global_id());
        self.timer.remove(tx.global_id());
        self.record_outcome(tx.coordinator());
    }

    /// Count a terminal outcome once, whoever finished the transaction.
    fn record_outcome(&self, coordinator: &Coordinator) {
        let Some(state) = coordinator.claim_outcome() else {
            return;
        };
        let mut stats = self.stats.lock();
        match state {
            XaState::Committed => stats.committed += 1,
            XaState::RolledBack => stats.rolled_back += 1,
            XaState::HeuristicMixed | XaState::Unknown => stats.heuristic += 1,
            _ => {}
        }
    }

    /// Unbind every thread still working in `coordinator`'s tree.
    ///
    /// A thread's stack only ever holds one tree, so an affected stack ends
    /// up empty and is dropped.
    fn unbind(&self, coordinator: &Arc<Coordinator>) -> usize {
        let mut unbound = 0;
        self.stacks.retain(|_, stack| {
            let mut stack = stack.lock();
            let before = stack.len();
            stack.retain(|tx| !Arc::ptr_eq(tx.coordinator(), coordinator));
            unbound += before - stack.len();
            !stack.is_empty()
        });
        unbound
    }
}

impl ExpiryListener for TransactionDirectory {
    fn on_expired(&self, coordinator: &Arc<Coordinator>) {
        let global_id = coordinator.xid().global_id;
        self.registry.remove(&global_id);
        self.parked.remove(&global_id);
        self.generator.release(global_id);
        let unbound = self.unbind(coordinator);
        if unbound > 0 {
            debug!("Unbound {} expired scopes of {}", unbound, coordinator.xid());
        }
        self.stats.lock().expired += 1;
        self.record_outcome(coordinator);
    }
}

impl Drop for TransactionDirectory {
    fn drop(&mut self) {
        self.timer.stop();
    }
}

impl std::fmt::Debug for TransactionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionDirectory")
            .field("node_id", &self.config.node_id)
            .field("active", &self.registry.len())
            .field("parked", &self.parked.len())
            .field("threads", &self.stacks.len())
            .finish()
    }
}
