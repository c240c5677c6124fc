//! Core types for Braid

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a global (root) transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub u64);

/// Identifier of a branch under one global transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub u64);

impl GlobalId {
    pub const INVALID: GlobalId = GlobalId(0);

    /// Microsecond timestamps keep their low 48 bits and wrap about every
    /// 8.9 years. Ids only need to be unique among transactions alive at the
    /// same time.
    pub const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF_FFFF;

    pub fn new(timestamp_us: u64, node_id: u8, instance: u8) -> Self {
        // Format: 48 bits timestamp | 8 bits node | 8 bits instance
        let id = ((timestamp_us & Self::TIMESTAMP_MASK) << 16)
            | ((node_id as u64) << 8)
            | (instance as u64);
        GlobalId(id)
    }

    pub fn timestamp_us(&self) -> u64 {
        self.0 >> 16
    }

    pub fn node_id(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    /// Low byte of the generator instance that issued the id.
    pub fn instance(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl BranchId {
    /// Branch of the transaction that began the global transaction.
    pub const ROOT: BranchId = BranchId(0);

    pub const SEQUENCE_MASK: u64 = 0xFF_FFFF_FFFF;

    pub fn new(node_id: u8, instance: u16, sequence: u64) -> Self {
        // Format: 8 bits node | 16 bits instance | 40 bits sequence
        BranchId(
            ((node_id as u64) << 56)
                | ((instance as u64) << 40)
                | (sequence & Self::SEQUENCE_MASK),
        )
    }

    pub fn node_id(&self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// Generator instance that derived the branch.
    pub fn instance(&self) -> u16 {
        ((self.0 >> 40) & 0xFFFF) as u16
    }

    pub fn sequence(&self) -> u64 {
        self.0 & Self::SEQUENCE_MASK
    }

    pub fn is_root(&self) -> bool {
        *self == BranchId::ROOT
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// XA transaction identifier: a global id plus a branch qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub global_id: GlobalId,
    pub branch_id: BranchId,
}

impl Xid {
    pub fn new(global_id: GlobalId, branch_id: BranchId) -> Self {
        Self {
            global_id,
            branch_id,
        }
    }

    /// Root branch of a global transaction.
    pub fn root(global_id: GlobalId) -> Self {
        Self::new(global_id, BranchId::ROOT)
    }

    pub fn with_branch(&self, branch_id: BranchId) -> Self {
        Self::new(self.global_id, branch_id)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.global_id, self.branch_id)
    }
}

impl FromStr for Xid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (global, branch) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument(format!("xid without branch: {s}")))?;
        let global = global
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::invalid_argument(format!("bad global id {global:?}: {e}")))?;
        let branch = branch
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::invalid_argument(format!("bad branch id {branch:?}: {e}")))?;
        Ok(Xid::new(GlobalId(global), BranchId(branch)))
    }
}

/// Logical identity of an enlisted resource. Two enlistments with the same
/// id on one branch refer to the same participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Transaction state
// ============================================================================

/// Global transaction state.
///
/// Numeric codes follow the JTA `Status` constants; `HeuristicMixed` has no
/// JTA counterpart and uses the next free code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaState {
    /// Transaction is active
    Active,
    /// A participant asked for the transaction to be rolled back
    MarkedRollback,
    /// All branches prepared
    Prepared,
    /// Committed
    Committed,
    /// Rolled back
    RolledBack,
    /// Outcome cannot be determined
    Unknown,
    /// No transaction
    NoTransaction,
    /// Prepare phase in progress
    Preparing,
    /// Commit phase in progress
    Committing,
    /// Rollback in progress
    RollingBack,
    /// Some branches committed while others did not
    HeuristicMixed,
}

impl XaState {
    pub fn code(&self) -> i32 {
        match self {
            XaState::Active => 0,
            XaState::MarkedRollback => 1,
            XaState::Prepared => 2,
            XaState::Committed => 3,
            XaState::RolledBack => 4,
            XaState::Unknown => 5,
            XaState::NoTransaction => 6,
            XaState::Preparing => 7,
            XaState::Committing => 8,
            XaState::RollingBack => 9,
            XaState::HeuristicMixed => 10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => XaState::Active,
            1 => XaState::MarkedRollback,
            2 => XaState::Prepared,
            3 => XaState::Committed,
            4 => XaState::RolledBack,
            5 => XaState::Unknown,
            6 => XaState::NoTransaction,
            7 => XaState::Preparing,
            8 => XaState::Committing,
            9 => XaState::RollingBack,
            10 => XaState::HeuristicMixed,
            _ => return None,
        })
    }

    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            XaState::Committed | XaState::RolledBack | XaState::HeuristicMixed | XaState::Unknown
        )
    }

    /// States a suspended transaction may be resumed from.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            XaState::Active | XaState::Preparing | XaState::Committing
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            XaState::Active => "ACTIVE",
            XaState::MarkedRollback => "MARKED_ROLLBACK",
            XaState::Prepared => "PREPARED",
            XaState::Committed => "COMMITTED",
            XaState::RolledBack => "ROLLEDBACK",
            XaState::Unknown => "UNKNOWN",
            XaState::NoTransaction => "NO_TRANSACTION",
            XaState::Preparing => "PREPARING",
            XaState::Committing => "COMMITTING",
            XaState::RollingBack => "ROLLING_BACK",
            XaState::HeuristicMixed => "HEURISTIC_MIXED",
        }
    }
}

impl fmt::Display for XaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Resource protocol flags
// ============================================================================

/// Flag passed to a participant when it is associated with a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartFlag {
    /// First association of this participant with the branch (`TMNOFLAGS`)
    NoFlags,
    /// Participant already belongs to the branch (`TMJOIN`)
    Join,
    /// Participant was suspended and is being resumed (`TMRESUME`)
    Resume,
}

/// Flag passed to a participant when it is dissociated from a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndFlag {
    /// Work completed normally (`TMSUCCESS`)
    Success,
    /// Work failed, branch will be rolled back (`TMFAIL`)
    Fail,
    /// Association is suspended, not ended (`TMSUSPEND`)
    Suspend,
}

/// Participant vote in the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// Prepared, ready to commit (`XA_OK`)
    Ok,
    /// Nothing to commit (`XA_RDONLY`)
    ReadOnly,
}
