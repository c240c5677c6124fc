//! Testing utilities: recording participants and an in-process transport.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use braid_common::prelude::*;

use crate::context::TransactionContext;
use crate::directory::TransactionDirectory;
use crate::remote::{CommandReply, CommandTransport, XaCommand};
use crate::resource::XaResource;

/// One call observed by a [`MockResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Start(StartFlag),
    End(EndFlag),
    Prepare,
    Commit { one_phase: bool },
    Rollback,
}

/// Calls from many resources in the order they happened.
pub type Journal = Arc<Mutex<Vec<(ResourceId, MockCall)>>>;

/// Participant that records every call and fails on demand.
pub struct MockResource {
    id: ResourceId,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    fail_resume: AtomicBool,
    read_only: AtomicBool,
    prepare_delay: Mutex<Duration>,
    history: Mutex<Vec<(Xid, MockCall)>>,
    journal: Mutex<Option<Journal>>,
}

impl MockResource {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::new(id),
            fail_prepare: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
            fail_resume: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            prepare_delay: Mutex::new(Duration::ZERO),
            history: Mutex::new(Vec::new()),
            journal: Mutex::new(None),
        })
    }

    pub fn failing_prepare(self: Arc<Self>) -> Arc<Self> {
        self.fail_prepare.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_commit(self: Arc<Self>) -> Arc<Self> {
        self.fail_commit.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_rollback(self: Arc<Self>) -> Arc<Self> {
        self.fail_rollback.store(true, Ordering::SeqCst);
        self
    }

    pub fn read_only(self: Arc<Self>) -> Arc<Self> {
        self.read_only.store(true, Ordering::SeqCst);
        self
    }

    /// Refuse `start(Resume)` until switched back.
    pub fn set_fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::SeqCst);
    }

    pub fn with_prepare_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.prepare_delay.lock() = delay;
        self
    }

    pub fn with_journal(self: Arc<Self>, journal: &Journal) -> Arc<Self> {
        *self.journal.lock() = Some(journal.clone());
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.history.lock().iter().map(|(_, c)| *c).collect()
    }

    /// Distinct branch Xids this participant was called with.
    pub fn xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = Vec::new();
        for (xid, _) in self.history.lock().iter() {
            if !xids.contains(xid) {
                xids.push(*xid);
            }
        }
        xids
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.history.lock().iter().filter(|(_, c)| pred(c)).count()
    }

    pub fn prepare_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Prepare))
    }

    pub fn commit_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Commit { .. }))
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Rollback))
    }

    fn record(&self, xid: &Xid, call: MockCall) {
        self.history.lock().push((*xid, call));
        if let Some(journal) = self.journal.lock().as_ref() {
            journal.lock().push((self.id.clone(), call));
        }
    }
}

impl XaResource for MockResource {
    fn id(&self) -> ResourceId {
        self.id.clone()
    }

    fn start(&self, xid: &Xid, flag: StartFlag) -> Result<()> {
        self.record(xid, MockCall::Start(flag));
        if flag == StartFlag::Resume && self.fail_resume.load(Ordering::SeqCst) {
            return Err(Error::resource_failed(self.id.as_str(), "simulated resume failure"));
        }
        Ok(())
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> Result<()> {
        self.record(xid, MockCall::End(flag));
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote> {
        let delay = *self.prepare_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.record(xid, MockCall::Prepare);
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::resource_failed(self.id.as_str(), "simulated prepare failure"));
        }
        if self.read_only.load(Ordering::SeqCst) {
            Ok(Vote::ReadOnly)
        } else {
            Ok(Vote::Ok)
        }
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.record(xid, MockCall::Commit { one_phase });
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::resource_failed(self.id.as_str(), "simulated commit failure"));
        }
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.record(xid, MockCall::Rollback);
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::resource_failed(self.id.as_str(), "simulated rollback failure"));
        }
        Ok(())
    }
}

/// Transport that delivers commands straight to a directory in the same
/// process, standing in for an RPC hop.
pub struct LoopbackTransport {
    endpoint: String,
    directory: Weak<TransactionDirectory>,
    delay: Mutex<Duration>,
    unreachable: AtomicBool,
    sent: Mutex<Vec<XaCommand>>,
}

impl LoopbackTransport {
    pub fn new(endpoint: impl Into<String>, directory: &Arc<TransactionDirectory>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            directory: Arc::downgrade(directory),
            delay: Mutex::new(Duration::ZERO),
            unreachable: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<XaCommand> {
        self.sent.lock().clone()
    }
}

impl CommandTransport for LoopbackTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send_command(&self, context: &TransactionContext) -> Result<CommandReply> {
        if let Some(cmd) = context.command {
            self.sent.lock().push(cmd);
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Failed(self.endpoint.clone()).into());
        }
        let directory = self
            .directory
            .upgrade()
            .ok_or_else(|| Error::internal(format!("{} is shut down", self.endpoint)))?;
        Ok(directory.handle_command(context))
    }
}
