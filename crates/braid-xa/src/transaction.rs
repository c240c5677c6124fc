//! Per-call-site transaction handle.
//!
//! A [`Transaction`] owns one sub-coordinator and shares the coordinator of
//! its tree. Only the outermost transaction of a root tree completes through
//! the coordinator. Nested transactions and transactions joined from a
//! remote caller just end their own enlistments.

use parking_lot::Mutex;
use std::sync::Arc;

use braid_common::prelude::*;

use crate::authority::{Finally, LocalCoordinator, RemoteProxy};
use crate::context::TransactionContext;
use crate::coordinator::Coordinator;
use crate::resource::{AdapterState, ResourceAdapter, XaResource};
use crate::sub_coordinator::{SubCoordinator, Synchronization};
use crate::xid::XidGenerator;

pub struct Transaction {
    xid: Xid,
    has_super: bool,
    nested: bool,
    coordinator: Arc<Coordinator>,
    finally: Arc<dyn Finally>,
    sub: Arc<SubCoordinator>,
    generator: Arc<XidGenerator>,
    /// Adapters currently associated with this transaction
    enlisted: Mutex<Vec<Arc<ResourceAdapter>>>,
    /// Adapters set aside by the last suspend
    suspended: Mutex<Option<Vec<Arc<ResourceAdapter>>>>,
}

impl Transaction {
    /// Start the root of a new tree. With `has_super` the tree joins a
    /// transaction whose outcome is decided elsewhere.
    pub fn begin(
        xid: Xid,
        has_super: bool,
        generator: Arc<XidGenerator>,
        config: &XaConfig,
    ) -> Result<Arc<Self>> {
        let coordinator = Arc::new(Coordinator::new(xid, has_super, config));
        coordinator.begin()?;
        let finally: Arc<dyn Finally> = if has_super {
            Arc::new(RemoteProxy::new(coordinator.clone()))
        } else {
            Arc::new(LocalCoordinator::new(coordinator.clone()))
        };
        Ok(Arc::new(Self::with_parts(xid, has_super, false, coordinator, finally, generator)))
    }

    fn with_parts(
        xid: Xid,
        has_super: bool,
        nested: bool,
        coordinator: Arc<Coordinator>,
        finally: Arc<dyn Finally>,
        generator: Arc<XidGenerator>,
    ) -> Self {
        let sub = Arc::new(SubCoordinator::new(xid, generator.clone()));
        coordinator.add_sub_coordinator(sub.clone());
        Self {
            xid,
            has_super,
            nested,
            coordinator,
            finally,
            sub,
            generator,
            enlisted: Mutex::new(Vec::new()),
            suspended: Mutex::new(None),
        }
    }

    /// Create a nested branch sharing this transaction's coordinator.
    pub fn create_sub_transaction(&self) -> Arc<Transaction> {
        let xid = self.generator.derive_branch(&self.xid);
        debug!("Nested branch {} under {}", xid, self.xid);
        Arc::new(Self::with_parts(
            xid,
            self.has_super,
            true,
            self.coordinator.clone(),
            self.finally.clone(),
            self.generator.clone(),
        ))
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn global_id(&self) -> GlobalId {
        self.xid.global_id
    }

    pub fn has_super(&self) -> bool {
        self.has_super
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn sub_coordinator(&self) -> &Arc<SubCoordinator> {
        &self.sub
    }

    pub fn status(&self) -> XaState {
        self.coordinator.state()
    }

    /// Context to propagate on an outbound call made inside this transaction.
    pub fn context(&self) -> TransactionContext {
        TransactionContext::new(self.xid)
    }

    /// Enlist a participant on this branch.
    ///
    /// A resource already known to the branch is joined (or resumed, when it
    /// was suspended) under its existing branch Xid. Returns whether the
    /// resource was already known.
    pub fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<bool> {
        let state = self.status();
        if state != XaState::Active {
            return Err(TransactionError::InvalidState {
                xid: self.xid,
                state,
            }
            .into());
        }

        let (adapter, found) = self.sub.enlist(&self.xid, resource);
        let flag = if adapter.state() == AdapterState::Suspended {
            StartFlag::Resume
        } else if found {
            StartFlag::Join
        } else {
            StartFlag::NoFlags
        };
        adapter.start(flag)?;

        let mut enlisted = self.enlisted.lock();
        if !enlisted.iter().any(|a| Arc::ptr_eq(a, &adapter)) {
            enlisted.push(adapter.clone());
        }
        debug!("Enlisted {} on {} ({:?})", adapter.resource_id(), adapter.xid(), flag);
        Ok(found)
    }

    /// End the association of one enlisted resource.
    ///
    /// Returns false when the resource is not enlisted or the participant
    /// failed to end.
    pub fn delist_resource(&self, id: &ResourceId, flag: EndFlag) -> bool {
        let adapter = {
            let mut enlisted = self.enlisted.lock();
            match enlisted.iter().position(|a| a.resource_id() == id) {
                Some(pos) => enlisted.remove(pos),
                None => return false,
            }
        };
        // A resource suspended on its own comes back through enlist_resource.
        match adapter.end(flag) {
            Ok(ended) => ended,
            Err(e) => {
                warn!("Delisting {} from {} failed: {}", id, self.xid, e);
                false
            }
        }
    }

    /// End every enlisted resource with `flag`. A suspend keeps the adapters
    /// so that [`resume_all`](Self::resume_all) can restore them.
    pub fn delist_all(&self, flag: EndFlag) {
        let adapters: Vec<_> = self.enlisted.lock().drain(..).collect();
        for adapter in &adapters {
            if let Err(e) = adapter.end(flag) {
                warn!("Delisting {} from {} failed: {}", adapter.resource_id(), self.xid, e);
            }
        }
        if flag == EndFlag::Suspend {
            self.suspended.lock().get_or_insert_with(Vec::new).extend(adapters);
        }
    }

    /// Resume every adapter set aside by a suspend.
    ///
    /// Stops at the first adapter that fails to resume. It and the ones
    /// after it stay set aside for another attempt.
    pub fn resume_all(&self) -> Result<()> {
        let Some(adapters) = self.suspended.lock().take() else {
            return Ok(());
        };
        let mut pending = adapters.into_iter();
        while let Some(adapter) = pending.next() {
            if let Err(e) = adapter.start(StartFlag::Resume) {
                let mut rest = vec![adapter];
                rest.extend(pending);
                *self.suspended.lock() = Some(rest);
                return Err(e);
            }
            self.enlisted.lock().push(adapter);
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.lock().is_some()
    }

    /// Adapters currently associated with this transaction.
    pub fn enlisted(&self) -> Vec<Arc<ResourceAdapter>> {
        self.enlisted.lock().clone()
    }

    /// Branch Xid a resource was enlisted under on this branch.
    pub fn branch_xid(&self, id: &ResourceId) -> Option<Xid> {
        self.sub.find(id).map(|a| a.xid())
    }

    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) {
        self.sub.register_synchronization(sync);
    }

    /// Doom the whole tree. A later commit rolls back.
    pub fn set_rollback_only(&self) {
        self.sub.set_rollback_only();
        self.coordinator.set_rollback_only();
    }

    pub fn commit(&self) -> Result<XaState> {
        if self.nested || self.has_super {
            self.delist_all(EndFlag::Success);
        }
        if self.nested {
            debug!("Nested branch {} done, outcome left to {}", self.xid, self.coordinator.xid());
            return Ok(self.status());
        }
        self.finally.commit()
    }

    pub fn rollback(&self) -> Result<XaState> {
        if self.nested || self.has_super {
            self.delist_all(EndFlag::Fail);
        }
        if self.nested {
            self.set_rollback_only();
            return Ok(self.status());
        }
        self.finally.rollback()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("has_super", &self.has_super)
            .field("nested", &self.nested)
            .field("state", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCall, MockResource};

    fn root() -> Arc<Transaction> {
        let generator = Arc::new(XidGenerator::new(1));
        let xid = Xid::root(generator.new_global_id());
        Transaction::begin(xid, false, generator, &XaConfig::default()).unwrap()
    }

    #[test]
    fn test_enlist_is_idempotent() {
        let tx = root();
        let r1 = MockResource::new("r1");
        assert!(!tx.enlist_resource(r1.clone()).unwrap());
        assert!(tx.enlist_resource(r1.clone()).unwrap());
        assert_eq!(tx.enlisted().len(), 1);
        assert_eq!(tx.sub_coordinator().len(), 1);
        assert_eq!(r1.xids().len(), 1);
    }

    #[test]
    fn test_rejoin_after_delist() {
        let tx = root();
        let r1 = MockResource::new("r1");
        tx.enlist_resource(r1.clone()).unwrap();
        assert!(tx.delist_resource(&ResourceId::from("r1"), EndFlag::Success));
        assert!(!tx.delist_resource(&ResourceId::from("r1"), EndFlag::Success));

        tx.enlist_resource(r1.clone()).unwrap();
        assert_eq!(
            r1.calls(),
            vec![
                MockCall::Start(StartFlag::NoFlags),
                MockCall::End(EndFlag::Success),
                MockCall::Start(StartFlag::Join),
            ]
        );
    }

    #[test]
    fn test_enlist_requires_active() {
        let tx = root();
        tx.set_rollback_only();
        assert!(tx.enlist_resource(MockResource::new("r1")).is_err());
    }

    #[test]
    fn test_nested_shares_coordinator() {
        let tx = root();
        let child = tx.create_sub_transaction();
        assert!(child.is_nested());
        assert!(Arc::ptr_eq(tx.coordinator(), child.coordinator()));
        assert_eq!(child.global_id(), tx.global_id());
        assert_ne!(child.xid(), tx.xid());
        assert_eq!(tx.coordinator().sub_coordinators().len(), 2);
    }

    #[test]
    fn test_nested_commit_only_delists() {
        let tx = root();
        let child = tx.create_sub_transaction();
        let r1 = MockResource::new("r1");
        child.enlist_resource(r1.clone()).unwrap();

        assert_eq!(child.commit().unwrap(), XaState::Active);
        assert_eq!(r1.commit_count(), 0);
        assert_eq!(r1.count(|c| *c == MockCall::End(EndFlag::Success)), 1);

        assert_eq!(tx.commit().unwrap(), XaState::Committed);
        assert_eq!(r1.commit_count(), 1);
    }

    #[test]
    fn test_nested_rollback_dooms_tree() {
        let tx = root();
        let r0 = MockResource::new("r0");
        tx.enlist_resource(r0.clone()).unwrap();
        let child = tx.create_sub_transaction();
        child.enlist_resource(MockResource::new("r1")).unwrap();

        assert_eq!(child.rollback().unwrap(), XaState::MarkedRollback);
        assert!(tx.commit().unwrap_err().is_rollback());
        assert_eq!(r0.commit_count(), 0);
        assert_eq!(r0.rollback_count(), 1);
    }

    #[test]
    fn test_has_super_defers_to_remote() {
        let generator = Arc::new(XidGenerator::new(2));
        let xid = Xid::new(GlobalId(500), BranchId::new(1, 0, 1));
        let tx = Transaction::begin(xid, true, generator, &XaConfig::default()).unwrap();
        let r1 = MockResource::new("r1");
        tx.enlist_resource(r1.clone()).unwrap();

        assert_eq!(tx.commit().unwrap(), XaState::Active);
        assert_eq!(r1.commit_count(), 0);
        assert_eq!(r1.count(|c| matches!(c, MockCall::End(_))), 1);

        assert_eq!(tx.coordinator().prepare_branch().unwrap(), Vote::Ok);
        assert_eq!(tx.coordinator().commit().unwrap(), XaState::Committed);
        assert_eq!(r1.commit_count(), 1);
    }

    #[test]
    fn test_suspend_then_resume_restores_enlistment() {
        let tx = root();
        tx.enlist_resource(MockResource::new("r1")).unwrap();
        tx.enlist_resource(MockResource::new("r2")).unwrap();
        let before: Vec<_> = tx.enlisted().iter().map(|a| (a.xid(), a.state())).collect();

        tx.delist_all(EndFlag::Suspend);
        assert!(tx.is_suspended());
        assert!(tx.enlisted().is_empty());

        tx.resume_all().unwrap();
        let after: Vec<_> = tx.enlisted().iter().map(|a| (a.xid(), a.state())).collect();
        assert_eq!(before, after);
        assert!(!tx.is_suspended());
    }

    #[test]
    fn test_failed_resume_keeps_rest_suspended() {
        let tx = root();
        let mocks: Vec<_> = (1..=3).map(|i| MockResource::new(format!("r{i}"))).collect();
        for m in &mocks {
            tx.enlist_resource(m.clone()).unwrap();
        }
        tx.delist_all(EndFlag::Suspend);

        mocks[1].set_fail_resume(true);
        assert!(tx.resume_all().is_err());
        assert!(tx.is_suspended());
        let states: Vec<_> = tx
            .sub_coordinator()
            .resources()
            .iter()
            .map(|a| a.state())
            .collect();
        assert_eq!(
            states,
            vec![AdapterState::Started, AdapterState::Suspended, AdapterState::Suspended]
        );
        assert_eq!(tx.enlisted().len(), 1);

        mocks[1].set_fail_resume(false);
        tx.resume_all().unwrap();
        assert!(!tx.is_suspended());
        assert_eq!(tx.enlisted().len(), 3);
        assert!(tx.enlisted().iter().all(|a| a.state() == AdapterState::Started));
        // The adapter resumed first time round is not resumed again.
        assert_eq!(mocks[0].count(|c| *c == MockCall::Start(StartFlag::Resume)), 1);
        assert_eq!(mocks[1].count(|c| *c == MockCall::Start(StartFlag::Resume)), 2);
        assert_eq!(mocks[2].count(|c| *c == MockCall::Start(StartFlag::Resume)), 1);
    }

    #[test]
    fn test_enlist_resumes_suspended_adapter() {
        let tx = root();
        let r1 = MockResource::new("r1");
        tx.enlist_resource(r1.clone()).unwrap();
        assert!(tx.delist_resource(&ResourceId::from("r1"), EndFlag::Suspend));
        tx.enlist_resource(r1.clone()).unwrap();
        assert_eq!(r1.calls().last(), Some(&MockCall::Start(StartFlag::Resume)));
    }

    #[test]
    fn test_branch_xid_lookup() {
        let tx = root();
        tx.enlist_resource(MockResource::new("r1")).unwrap();
        let xid = tx.branch_xid(&ResourceId::from("r1")).unwrap();
        assert_eq!(xid.global_id, tx.global_id());
        assert!(tx.branch_xid(&ResourceId::from("nope")).is_none());
    }
}
