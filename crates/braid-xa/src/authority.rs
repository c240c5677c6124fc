//! Commit authority of a transaction.
//!
//! A root transaction completes through its own coordinator. A transaction
//! joined from another process only ends its local work and waits for the
//! remote root to send PREPARE, COMMIT or ROLLBACK.

use std::sync::Arc;

use braid_common::prelude::*;

use crate::coordinator::Coordinator;

/// The party that finally decides a transaction's outcome.
pub trait Finally: Send + Sync {
    fn commit(&self) -> Result<XaState>;

    fn rollback(&self) -> Result<XaState>;
}

/// The local coordinator decides.
pub struct LocalCoordinator {
    coordinator: Arc<Coordinator>,
}

impl LocalCoordinator {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl Finally for LocalCoordinator {
    fn commit(&self) -> Result<XaState> {
        self.coordinator.commit()
    }

    fn rollback(&self) -> Result<XaState> {
        self.coordinator.rollback()
    }
}

/// A remote root decides. Local completion only records intent.
pub struct RemoteProxy {
    coordinator: Arc<Coordinator>,
}

impl RemoteProxy {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl Finally for RemoteProxy {
    fn commit(&self) -> Result<XaState> {
        let state = self.coordinator.state();
        debug!("Branch {} awaiting remote decision in {}", self.coordinator.xid(), state);
        Ok(state)
    }

    /// Mark the branch so that the remote PREPARE votes no.
    fn rollback(&self) -> Result<XaState> {
        self.coordinator.set_rollback_only();
        Ok(self.coordinator.state())
    }
}
