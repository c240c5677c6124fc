//! Transaction context carried across process boundaries.
//!
//! The transport is not part of this crate. Callers hand [`transmit`] a
//! header writer on outbound calls and [`acquire`] a header reader on
//! inbound calls.
//!
//! [`transmit`]: TransactionContext::transmit
//! [`acquire`]: TransactionContext::acquire

use serde::{Deserialize, Serialize};

use braid_common::prelude::*;

use crate::remote::XaCommand;

pub const HEADER_GLOBAL_ID: &str = "x-braid-global-id";
pub const HEADER_BRANCH_ID: &str = "x-braid-branch-id";
pub const HEADER_COMMAND: &str = "x-braid-command";

/// Propagated transaction identity plus an optional pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub xid: Xid,
    pub command: Option<XaCommand>,
}

impl TransactionContext {
    pub fn new(xid: Xid) -> Self {
        Self { xid, command: None }
    }

    pub fn with_command(mut self, command: XaCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Write the context into transport headers.
    pub fn transmit<W>(&self, mut write: W)
    where
        W: FnMut(&str, String),
    {
        write(HEADER_GLOBAL_ID, self.xid.global_id.0.to_string());
        write(HEADER_BRANCH_ID, self.xid.branch_id.0.to_string());
        if let Some(command) = self.command {
            write(HEADER_COMMAND, command.as_str().to_string());
        }
    }

    /// Rebuild a context from transport headers.
    ///
    /// Returns `Ok(None)` when the call carries no transaction.
    pub fn acquire<R>(read: R) -> Result<Option<Self>>
    where
        R: Fn(&str) -> Option<String>,
    {
        let Some(global) = read(HEADER_GLOBAL_ID) else {
            return Ok(None);
        };
        let global = parse_id(HEADER_GLOBAL_ID, &global)?;
        let branch = match read(HEADER_BRANCH_ID) {
            Some(b) => parse_id(HEADER_BRANCH_ID, &b)?,
            None => 0,
        };
        let command = match read(HEADER_COMMAND) {
            Some(c) => Some(c.parse::<XaCommand>()?),
            None => None,
        };
        Ok(Some(Self {
            xid: Xid::new(GlobalId(global), BranchId(branch)),
            command,
        }))
    }
}

fn parse_id(header: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| RemoteError::MalformedContext(format!("{header}={value:?}: {e}")).into())
}
