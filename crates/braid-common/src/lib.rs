//! # Braid Common
//!
//! Common types, errors, configuration and utilities shared by the Braid crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{Error, Result};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, RemoteError, ResourceError, Result, TransactionError};
    pub use super::types::*;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
