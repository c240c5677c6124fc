//! Participant contract and the adapter that binds a participant to a branch.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use braid_common::prelude::*;

/// A participant that can take part in a two-phase commit.
///
/// Every method receives the branch Xid the participant was enlisted under.
/// Errors are participant specific; the coordinator logs them and folds them
/// into the branch outcome.
pub trait XaResource: Send + Sync {
    /// Logical identity. Enlisting two resources with the same id on one
    /// branch joins the existing enlistment.
    fn id(&self) -> ResourceId;

    /// Associate the participant with the branch.
    fn start(&self, xid: &Xid, flag: StartFlag) -> Result<()>;

    /// Dissociate the participant from the branch.
    fn end(&self, xid: &Xid, flag: EndFlag) -> Result<()>;

    /// Phase one.
    fn prepare(&self, xid: &Xid) -> Result<Vote>;

    /// Phase two, or the only phase when `one_phase` is set.
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    /// Undo the branch.
    fn rollback(&self, xid: &Xid) -> Result<()>;
}

/// Lifecycle of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    NotStarted,
    Started,
    Suspended,
    Ended,
}

/// Wraps one participant together with its branch Xid.
pub struct ResourceAdapter {
    xid: Xid,
    id: ResourceId,
    resource: Arc<dyn XaResource>,
    state: Mutex<AdapterState>,
    vote: Mutex<Option<Vote>>,
}

impl ResourceAdapter {
    pub fn new(xid: Xid, resource: Arc<dyn XaResource>) -> Self {
        Self {
            xid,
            id: resource.id(),
            resource,
            state: Mutex::new(AdapterState::NotStarted),
            vote: Mutex::new(None),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    pub fn resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Vote recorded by the last successful prepare.
    pub fn vote(&self) -> Option<Vote> {
        *self.vote.lock()
    }

    /// Associate the participant with the branch.
    ///
    /// `Join` on an adapter that is already started is a no-op. A suspended
    /// adapter only accepts `Resume`.
    pub fn start(&self, flag: StartFlag) -> Result<()> {
        let mut state = self.state.lock();
        match (*state, flag) {
            (AdapterState::Started, StartFlag::Join) => return Ok(()),
            (AdapterState::NotStarted | AdapterState::Ended, StartFlag::NoFlags | StartFlag::Join)
            | (AdapterState::Suspended, StartFlag::Resume) => {}
            (current, flag) => {
                return Err(Error::protocol(format!(
                    "cannot start {} on branch {} with {:?} while {:?}",
                    self.id, self.xid, flag, current
                )))
            }
        }
        self.resource.start(&self.xid, flag).map_err(|e| {
            error!("Resource {} failed to start on {}: {}", self.id, self.xid, e);
            e
        })?;
        *state = AdapterState::Started;
        Ok(())
    }

    /// Dissociate the participant from the branch.
    ///
    /// Returns `Ok(false)` without calling the participant when there is no
    /// active association to end.
    pub fn end(&self, flag: EndFlag) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            AdapterState::Started => {}
            AdapterState::Suspended if flag == EndFlag::Suspend => return Ok(false),
            AdapterState::Suspended => {
                return Err(Error::protocol(format!(
                    "{} on branch {} is suspended and must be resumed before it ends",
                    self.id, self.xid
                )))
            }
            AdapterState::NotStarted | AdapterState::Ended => return Ok(false),
        }
        self.resource.end(&self.xid, flag).map_err(|e| {
            error!("Resource {} failed to end on {}: {}", self.id, self.xid, e);
            e
        })?;
        *state = match flag {
            EndFlag::Suspend => AdapterState::Suspended,
            EndFlag::Success | EndFlag::Fail => AdapterState::Ended,
        };
        Ok(true)
    }

    pub fn prepare(&self) -> Result<Vote> {
        self.end(EndFlag::Success)?;
        let vote = self.resource.prepare(&self.xid).map_err(|e| {
            error!("Resource {} failed to prepare {}: {}", self.id, self.xid, e);
            e
        })?;
        *self.vote.lock() = Some(vote);
        Ok(vote)
    }

    /// Commit the branch. A read-only vote skips the participant.
    pub fn commit(&self, one_phase: bool) -> Result<()> {
        if one_phase {
            self.end(EndFlag::Success)?;
        } else if self.vote() == Some(Vote::ReadOnly) {
            return Ok(());
        }
        self.resource.commit(&self.xid, one_phase).map_err(|e| {
            error!("Resource {} failed to commit {}: {}", self.id, self.xid, e);
            e
        })
    }

    pub fn rollback(&self) -> Result<()> {
        if self.state() == AdapterState::Started {
            if let Err(e) = self.end(EndFlag::Fail) {
                warn!("Ending {} before rollback failed: {}", self.id, e);
            }
        }
        self.resource.rollback(&self.xid).map_err(|e| {
            error!("Resource {} failed to roll back {}: {}", self.id, self.xid, e);
            e
        })
    }
}

impl fmt::Debug for ResourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAdapter")
            .field("xid", &self.xid)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
