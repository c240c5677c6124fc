//! Tests of transactions spanning two directories
//!
//! A root directory calls into a branch directory over an in-process
//! transport. The branch joins the caller's transaction from the propagated
//! context and waits for PREPARE/COMMIT/ROLLBACK from the root.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use braid_common::prelude::*;
use braid_xa::testing::{LoopbackTransport, MockResource};
use braid_xa::{TransactionContext, TransactionDirectory, XaCommand};

struct Cluster {
    root: Arc<TransactionDirectory>,
    branch: Arc<TransactionDirectory>,
    transport: Arc<LoopbackTransport>,
}

impl Cluster {
    fn new() -> Self {
        Self::with_config(XaConfig::default())
    }

    fn with_config(branch_config: XaConfig) -> Self {
        Self::build(
            XaConfig {
                node_id: 1,
                remote_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            XaConfig {
                node_id: 2,
                ..branch_config
            },
        )
    }

    fn build(root_config: XaConfig, branch_config: XaConfig) -> Self {
        let root = TransactionDirectory::new(root_config);
        let branch = TransactionDirectory::new(branch_config);
        let transport = LoopbackTransport::new("inventory", &branch);
        Self {
            root,
            branch,
            transport,
        }
    }

    /// Run a business call on the branch side the way a server thread
    /// would: headers in, work under the joined transaction, commit.
    fn call_branch(&self, ctx: TransactionContext, resource: Arc<MockResource>) -> XaState {
        let mut headers = HashMap::new();
        ctx.transmit(|k, v| {
            headers.insert(k.to_string(), v);
        });

        let branch = self.branch.clone();
        thread::spawn(move || {
            let ctx = TransactionContext::acquire(|k| headers.get(k).cloned())
                .unwrap()
                .unwrap();
            let tx = branch.begin_with(Some(&ctx)).unwrap();
            assert!(tx.has_super());
            branch.enlist(resource).unwrap();
            branch.commit().unwrap()
        })
        .join()
        .unwrap()
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_remote_branch_commits_with_root() {
    let cluster = Cluster::new();
    let local = MockResource::new("orders");
    let remote = MockResource::new("stock");

    let tx = cluster.root.begin().unwrap();
    cluster.root.enlist(local.clone()).unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    assert_eq!(ctx.xid.global_id, tx.global_id());
    assert!(!ctx.xid.branch_id.is_root());

    assert_eq!(cluster.call_branch(ctx, remote.clone()), XaState::Active);
    assert_eq!(cluster.branch.parked_count(), 1);
    assert_eq!(remote.commit_count(), 0);

    assert_eq!(cluster.root.commit().unwrap(), XaState::Committed);
    assert_eq!(
        cluster.transport.sent(),
        vec![XaCommand::Prepare, XaCommand::Commit]
    );
    assert_eq!(local.commit_count(), 1);
    assert_eq!(remote.prepare_count(), 1);
    assert_eq!(remote.commit_count(), 1);
    assert_eq!(cluster.branch.parked_count(), 0);
    assert_eq!(cluster.branch.stats().committed, 1);
}

#[test]
fn test_remote_prepare_failure_rolls_back_root() {
    let cluster = Cluster::new();
    let local = MockResource::new("orders");
    let remote = MockResource::new("stock").failing_prepare();

    cluster.root.begin().unwrap();
    cluster.root.enlist(local.clone()).unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, remote.clone());

    assert!(cluster.root.commit().unwrap_err().is_rollback());
    assert_eq!(local.commit_count(), 0);
    assert_eq!(local.rollback_count(), 1);
    assert_eq!(remote.commit_count(), 0);
    assert_eq!(remote.rollback_count(), 1);
    assert_eq!(
        cluster.transport.sent(),
        vec![XaCommand::Prepare, XaCommand::Rollback]
    );
}

#[test]
fn test_lone_remote_branch_commits_in_one_phase() {
    let cluster = Cluster::new();
    let remote = MockResource::new("stock");

    cluster.root.begin().unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, remote.clone());

    assert_eq!(cluster.root.commit().unwrap(), XaState::Committed);
    assert_eq!(cluster.transport.sent(), vec![XaCommand::Commit]);
    // The branch holds a single resource, so it commits in one phase too.
    assert_eq!(remote.prepare_count(), 0);
    assert_eq!(remote.commit_count(), 1);
}

#[test]
fn test_root_rollback_reaches_branch() {
    let cluster = Cluster::new();
    let remote = MockResource::new("stock");

    cluster.root.begin().unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, remote.clone());

    assert_eq!(cluster.root.rollback().unwrap(), XaState::RolledBack);
    assert_eq!(cluster.transport.sent(), vec![XaCommand::Rollback]);
    assert_eq!(remote.rollback_count(), 1);
    assert_eq!(cluster.branch.parked_count(), 0);
}

#[test]
fn test_branch_marked_rollback_only_votes_no() {
    let cluster = Cluster::new();
    let local = MockResource::new("orders");
    let remote = MockResource::new("stock");

    cluster.root.begin().unwrap();
    cluster.root.enlist(local.clone()).unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, remote.clone());

    assert!(cluster.branch.mark_rollback_only(ctx.xid.global_id));
    assert!(cluster.root.commit().unwrap_err().is_rollback());
    assert_eq!(local.commit_count(), 0);
    assert_eq!(remote.commit_count(), 0);
    assert_eq!(remote.rollback_count(), 1);
}

#[test]
fn test_unreachable_branch_rolls_back_root() {
    let cluster = Cluster::new();
    let local = MockResource::new("orders");

    cluster.root.begin().unwrap();
    cluster.root.enlist(local.clone()).unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, MockResource::new("stock"));
    cluster.transport.set_unreachable(true);

    assert!(cluster.root.commit().unwrap_err().is_rollback());
    assert_eq!(local.commit_count(), 0);
    assert_eq!(local.rollback_count(), 1);
    // The branch is still waiting for a decision.
    assert_eq!(cluster.branch.parked_count(), 1);
}

#[test]
fn test_slow_branch_times_out() {
    let cluster = Cluster::new();
    let local = MockResource::new("orders");
    let remote = MockResource::new("stock");

    cluster.root.begin().unwrap();
    cluster.root.enlist(local.clone()).unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, remote.clone());
    cluster.transport.set_delay(Duration::from_millis(400));

    let started = Instant::now();
    assert!(cluster.root.commit().unwrap_err().is_rollback());
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(local.commit_count(), 0);
    assert_eq!(local.rollback_count(), 1);

    // Late commands still settle the branch, never with a commit.
    assert!(wait_for(Duration::from_secs(5), || cluster.branch.parked_count() == 0));
    assert_eq!(remote.commit_count(), 0);
}

#[test]
fn test_abandoned_branch_expires() {
    let cluster = Cluster::with_config(XaConfig {
        transaction_timeout: Duration::from_millis(10),
        ..Default::default()
    });
    let remote = MockResource::new("stock");

    cluster.root.begin().unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, remote.clone());
    assert_eq!(cluster.branch.parked_count(), 1);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(cluster.branch.expire_due().len(), 1);
    assert_eq!(cluster.branch.parked_count(), 0);
    assert_eq!(remote.rollback_count(), 1);

    // The root's later commit finds nothing to commit remotely.
    assert!(cluster.root.commit().is_err());
    assert_eq!(remote.commit_count(), 0);
}

#[test]
fn test_second_call_joins_same_branch() {
    let cluster = Cluster::new();
    let first = MockResource::new("stock");
    let second = MockResource::new("ledger");

    cluster.root.begin().unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, first.clone());
    cluster.call_branch(ctx, second.clone());
    assert_eq!(cluster.branch.parked_count(), 1);

    let joined = cluster.branch.transaction(ctx.xid.global_id).unwrap();
    assert_eq!(joined.coordinator().resource_count(), 2);

    cluster.root.commit().unwrap();
    assert_eq!(first.commit_count(), 1);
    assert_eq!(second.commit_count(), 1);
}

#[test]
fn test_default_configs_derive_distinct_branches() {
    // Both sides left at the default node id.
    let cluster = Cluster::build(XaConfig::default(), XaConfig::default());
    let db = MockResource::new("db");
    let stock = MockResource::new("stock");

    let tx = cluster.root.begin().unwrap();
    cluster.root.enlist(db.clone()).unwrap();
    let ctx = cluster.root.enlist_remote(cluster.transport.clone()).unwrap();
    cluster.call_branch(ctx, stock.clone());

    let local = tx.branch_xid(&ResourceId::new("db")).unwrap();
    let joined = cluster.branch.transaction(ctx.xid.global_id).unwrap();
    let remote = joined.branch_xid(&ResourceId::new("stock")).unwrap();
    assert_eq!(local.global_id, remote.global_id);
    assert_eq!(local.branch_id.node_id(), remote.branch_id.node_id());
    assert_ne!(local, remote);
    assert_ne!(ctx.xid, remote);

    assert_eq!(cluster.root.commit().unwrap(), XaState::Committed);
    assert_eq!(db.xids(), vec![local]);
    assert_eq!(stock.xids(), vec![remote]);
    assert_eq!(stock.commit_count(), 1);
}
