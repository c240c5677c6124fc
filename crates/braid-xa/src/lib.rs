//! # Braid XA
//!
//! XA two-phase commit coordination providing:
//! - Per-thread transaction stacks and a global transaction registry
//! - Coordinator / sub-coordinator trees with one- and two-phase commit
//! - Resource enlistment with join, suspend and resume
//! - Expiry of abandoned transactions
//! - Remote branches driven by PREPARE/COMMIT/ROLLBACK commands

pub mod authority;
pub mod context;
pub mod coordinator;
pub mod directory;
pub mod executor;
pub mod remote;
pub mod resource;
pub mod sub_coordinator;
pub mod testing;
pub mod timer;
pub mod transaction;
pub mod xid;

// Re-export key types for convenience
pub use authority::{Finally, LocalCoordinator, RemoteProxy};
pub use context::TransactionContext;
pub use coordinator::Coordinator;
pub use directory::{DirectoryStats, TransactionDirectory};
pub use executor::Executor;
pub use remote::{CommandReply, CommandTransport, RemoteBranch, XaCommand};
pub use resource::{AdapterState, ResourceAdapter, XaResource};
pub use sub_coordinator::{BranchVote, CommitTally, SubCoordinator, Synchronization};
pub use timer::{ExpiryListener, ExpiryTimer};
pub use transaction::Transaction;
pub use xid::XidGenerator;
