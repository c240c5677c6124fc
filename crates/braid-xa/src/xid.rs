//! Transaction and branch identifier generation.
//!
//! Global ids follow the `GlobalId` bit layout (48 bits timestamp, 8 bits
//! node, 8 bits instance) and are strictly increasing within one generator.
//! Branch ids are drawn from a counter kept per global id, so two callers
//! deriving from the same parent never receive the same branch.
//!
//! Every generator carries a 16-bit instance tag: a per-process random seed
//! plus a per-process counter. Generators in one process always differ, and
//! processes sharing a node id (the default) still derive distinct branches
//! under a global id they both work in.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::OnceLock;

use braid_common::types::{BranchId, GlobalId, Xid};
use braid_common::utils::timestamp_us;

static PROCESS_SEED: OnceLock<u16> = OnceLock::new();
static NEXT_INSTANCE: AtomicU16 = AtomicU16::new(0);

fn next_instance() -> u16 {
    let seed = *PROCESS_SEED.get_or_init(|| rand::random::<u16>() ^ (std::process::id() as u16));
    seed.wrapping_add(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
}

/// Thread-safe Xid generator
#[derive(Debug)]
pub struct XidGenerator {
    node_id: u8,
    instance: u16,
    /// Timestamp of the last issued global id
    last_ticket: AtomicU64,
    /// Branch counters keyed by global id
    branches: DashMap<GlobalId, AtomicU64>,
}

impl XidGenerator {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            instance: next_instance(),
            last_ticket: AtomicU64::new(0),
            branches: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn instance(&self) -> u16 {
        self.instance
    }

    /// Generate a global id unique for the lifetime of this generator.
    ///
    /// More than one id per microsecond runs the ticket ahead of the clock.
    pub fn new_global_id(&self) -> GlobalId {
        let now = timestamp_us();
        // The closure always returns Some, so both arms carry the previous value.
        let prev = match self.last_ticket.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        }) {
            Ok(prev) | Err(prev) => prev,
        };
        let ticket = now.max(prev + 1);
        GlobalId::new(ticket, self.node_id, self.instance as u8)
    }

    /// Derive a fresh branch under the parent's global transaction.
    pub fn derive_branch(&self, parent: &Xid) -> Xid {
        let seq = self
            .branches
            .entry(parent.global_id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        parent.with_branch(BranchId::new(self.node_id, self.instance, seq))
    }

    /// Forget the branch counter of a finished transaction.
    pub fn release(&self, global_id: GlobalId) {
        self.branches.remove(&global_id);
    }

    /// Number of global transactions with a live branch counter.
    pub fn tracked(&self) -> usize {
        self.branches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_global_ids_unique_and_increasing() {
        let gen = XidGenerator::new(3);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.new_global_id();
            assert!(id.0 > last);
            assert_eq!(id.node_id(), 3);
            last = id.0;
        }
    }

    #[test]
    fn test_derive_branch_keeps_global() {
        let gen = XidGenerator::new(1);
        let root = Xid::root(gen.new_global_id());
        let a = gen.derive_branch(&root);
        let b = gen.derive_branch(&a);
        assert_eq!(a.global_id, root.global_id);
        assert_eq!(b.global_id, root.global_id);
        assert_ne!(a.branch_id, b.branch_id);
        assert!(!a.branch_id.is_root());
    }

    #[test]
    fn test_concurrent_branches_never_collide() {
        let gen = Arc::new(XidGenerator::new(1));
        let root = Xid::root(gen.new_global_id());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || {
                    (0..500).map(|_| gen.derive_branch(&root)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for xid in h.join().unwrap() {
                assert!(seen.insert(xid.branch_id), "duplicate branch {}", xid);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_generators_on_one_node_stay_apart() {
        let a = XidGenerator::new(1);
        let b = XidGenerator::new(1);
        assert_ne!(a.instance(), b.instance());

        let root = Xid::root(a.new_global_id());
        let mine = a.derive_branch(&root);
        let theirs = b.derive_branch(&root);
        assert_eq!(mine.branch_id.sequence(), theirs.branch_id.sequence());
        assert_ne!(mine, theirs);
        assert_ne!(a.new_global_id(), b.new_global_id());
    }

    #[test]
    fn test_release_drops_counter() {
        let gen = XidGenerator::new(1);
        let root = Xid::root(gen.new_global_id());
        gen.derive_branch(&root);
        assert_eq!(gen.tracked(), 1);
        gen.release(root.global_id);
        assert_eq!(gen.tracked(), 0);
    }
}
