//! # Roost SFTP
//!
//! Multi-tenant SFTP gateway for a fleet of isolated server directories
//! managed by an external control plane.
//!
//! Each authenticated session is confined to one tenant's data directory.
//! Every file operation is mediated by the capability set issued by the
//! control plane at login, a lexical path sandbox, a global read-only
//! switch, and a cached disk-quota check.
//!
//! ## Architecture
//!
//! - [`server::Server`] binds the listener and accepts SSH connections
//! - [`oracle::CredentialOracle`] validates logins against the control plane
//! - [`handler::FsHandler`] applies the security invariants to every
//!   filesystem operation
//! - [`session::SftpSession`] speaks the SFTP v3 wire protocol
//! - [`quota::QuotaCache`] keeps the per-tenant disk accounting

pub mod config;
pub mod error;
pub mod handler;
pub mod host_key;
pub mod oracle;
pub mod permissions;
pub mod protocol;
pub mod quota;
pub mod sandbox;
pub mod server;
pub mod session;

pub use config::{ControlPlane, LogFormat, OwnershipTarget, Settings};
pub use error::{Error, Result};
pub use handler::{FsHandler, SessionPrincipal};
pub use oracle::{AuthGrant, CredentialOracle};
pub use permissions::{Capability, PermissionSet};
pub use quota::QuotaCache;
pub use server::Server;
pub use session::SftpSession;
