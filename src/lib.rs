//! Client implementation for the OSMO workflow-execution service. The library half of this
//! crate carries everything the `osmo` CLI needs to authenticate, submit workflows, and hold
//! long-lived control channels (port-forward, exec, rsync) open against the OSMO router.

pub mod client;
pub mod config;
pub mod datasets;
pub mod error;
pub mod limit;
pub mod login;
pub mod rsync;
pub mod tunnel;
pub mod version;
pub mod workflow;

pub use error::OsmoError;
pub use version::Version;

pub type Result<T> = std::result::Result<T, OsmoError>;

/// User-Agent prefix sent by the CLI binary.
pub const CLIENT_USER_AGENT_PREFIX: &str = "osmo-cli";
/// User-Agent prefix used when the crate is embedded as a library (the rsync daemon included).
pub const LIB_USER_AGENT_PREFIX: &str = "osmo-lib";
