//! Remote branches.
//!
//! A transaction that calls into another process enlists a [`RemoteBranch`]
//! for that endpoint. During 2PC the branch forwards PREPARE, COMMIT and
//! ROLLBACK over a [`CommandTransport`]; the other side answers through
//! [`TransactionDirectory::handle_command`](crate::directory::TransactionDirectory::handle_command).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use braid_common::prelude::*;

use crate::context::TransactionContext;
use crate::executor::Executor;
use crate::resource::XaResource;

/// Command sent from the root coordinator to a remote branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaCommand {
    Prepare,
    Commit,
    Rollback,
}

impl XaCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            XaCommand::Prepare => "PREPARE",
            XaCommand::Commit => "COMMIT",
            XaCommand::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for XaCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for XaCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PREPARE" => Ok(XaCommand::Prepare),
            "COMMIT" => Ok(XaCommand::Commit),
            "ROLLBACK" => Ok(XaCommand::Rollback),
            other => Err(RemoteError::MalformedContext(format!("unknown command {other:?}")).into()),
        }
    }
}

/// Answer of a remote branch to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandReply {
    Yes,
    No,
    Error,
}

/// Carries commands to the process hosting a remote branch.
///
/// Implementations perform one blocking round trip. The caller applies the
/// configured read timeout.
pub trait CommandTransport: Send + Sync {
    /// Address of the remote side, used as the branch identity.
    fn endpoint(&self) -> &str;

    /// Deliver `context.command` for `context.xid` and wait for the answer.
    fn send_command(&self, context: &TransactionContext) -> Result<CommandReply>;
}

/// Enlistable stand-in for a branch that lives in another process.
pub struct RemoteBranch {
    id: ResourceId,
    transport: Arc<dyn CommandTransport>,
    timeout: Duration,
}

impl RemoteBranch {
    pub fn new(transport: Arc<dyn CommandTransport>, timeout: Duration) -> Self {
        Self {
            id: ResourceId::new(format!("remote:{}", transport.endpoint())),
            transport,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `command` and wait at most `timeout` for the reply. A late
    /// reply is discarded.
    pub fn send(&self, xid: &Xid, command: XaCommand) -> Result<CommandReply> {
        let context = TransactionContext::new(*xid).with_command(command);
        let transport = self.transport.clone();
        let sent = Executor::global()?
            .run_with_timeout(self.timeout, move || transport.send_command(&context));

        match sent {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                warn!("{} to {} for {} failed: {}", command, self.endpoint(), xid, e);
                Err(RemoteError::Failed(self.endpoint().to_string()).into())
            }
            None => {
                warn!(
                    "{} to {} for {} timed out after {:?}",
                    command,
                    self.endpoint(),
                    xid,
                    self.timeout
                );
                Err(RemoteError::Timeout(self.endpoint().to_string()).into())
            }
        }
    }

    fn expect_yes(&self, xid: &Xid, command: XaCommand) -> Result<()> {
        match self.send(xid, command)? {
            CommandReply::Yes => Ok(()),
            CommandReply::No => Err(RemoteError::Refused(self.endpoint().to_string()).into()),
            CommandReply::Error => Err(RemoteError::Failed(self.endpoint().to_string()).into()),
        }
    }
}

impl XaResource for RemoteBranch {
    fn id(&self) -> ResourceId {
        self.id.clone()
    }

    fn start(&self, xid: &Xid, flag: StartFlag) -> Result<()> {
        debug!("Remote branch {} joined {} ({:?})", self.endpoint(), xid, flag);
        Ok(())
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> Result<()> {
        debug!("Remote branch {} left {} ({:?})", self.endpoint(), xid, flag);
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.expect_yes(xid, XaCommand::Prepare)?;
        Ok(Vote::Ok)
    }

    fn commit(&self, xid: &Xid, _one_phase: bool) -> Result<()> {
        // An unprepared remote branch runs its own full commit on COMMIT,
        // which covers the one-phase case.
        self.expect_yes(xid, XaCommand::Commit)
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.expect_yes(xid, XaCommand::Rollback)
    }
}

impl fmt::Debug for RemoteBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBranch")
            .field("endpoint", &self.endpoint())
            .field("timeout", &self.timeout)
            .finish()
    }
}
