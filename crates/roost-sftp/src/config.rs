//! Gateway settings and the control-plane configuration document.
//!
//! The gateway itself is configured entirely from the command line; the
//! JSON document at `--config-path` belongs to the control plane and only a
//! handful of keys are consumed from it: the oracle base URL, the first API
//! key, the data root, and the name of the system user that owns tenant
//! files.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Fallback data root when the control plane does not set `sftp.path`.
pub const DEFAULT_DATA_ROOT: &str = "/srv/daemon-data";

/// Fallback system user owning tenant files.
pub const DEFAULT_SYSTEM_USER: &str = "pterodactyl";

/// Runtime settings threaded into the server and every session handler.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the TCP listener binds.
    pub bind_address: String,
    /// Port the TCP listener binds.
    pub bind_port: u16,
    /// Directory holding gateway state (the `.sftp/id_rsa` host key lives
    /// under it). This is the parent directory of the configuration file.
    pub base_path: PathBuf,
    /// Directory holding one `<tenant>/server.json` per tenant.
    pub server_data_folder: PathBuf,
    /// Directory holding one `<tenant>/` data directory per tenant.
    pub data_root: PathBuf,
    /// Reject every mutating operation when set.
    pub read_only: bool,
    /// Skip the disk quota check entirely when set.
    pub disable_disk_check: bool,
    /// Ownership applied to every file the gateway creates or moves.
    pub owner: OwnershipTarget,
}

/// The `(uid, gid)` pair chowned onto files the gateway creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipTarget {
    pub uid: u32,
    pub gid: u32,
}

impl OwnershipTarget {
    /// Ownership of the running process. Useful for tests and for
    /// deployments without a dedicated system user.
    pub fn current() -> Self {
        // getuid/getgid cannot fail.
        unsafe {
            Self {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text.
    Text,
    /// Structured JSON for log aggregation.
    Json,
}

/// The slice of the control plane's configuration document the gateway
/// reads. Everything else in the file is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlane {
    #[serde(default)]
    keys: Vec<String>,
    remote: RemoteSection,
    #[serde(default)]
    sftp: SftpSection,
    #[serde(default)]
    docker: DockerSection,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteSection {
    base: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SftpSection {
    path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DockerSection {
    #[serde(default)]
    container: ContainerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContainerSection {
    username: Option<String>,
}

impl ControlPlane {
    /// Read and parse the configuration document.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            Error::Config(format!(
                "could not read configuration at {}: {e}",
                path.display()
            ))
        })?;

        serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("could not parse configuration: {e}")))
    }

    /// Parse from an in-memory document.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Config(format!("could not parse configuration: {e}")))
    }

    /// Base URL of the control plane API.
    pub fn remote_base(&self) -> &str {
        &self.remote.base
    }

    /// Bearer token for the oracle: the first configured API key.
    pub fn api_token(&self) -> Result<&str> {
        self.keys
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::Config("no API keys present in configuration".into()))
    }

    /// Root directory holding tenant data directories.
    pub fn data_root(&self) -> PathBuf {
        match self.sftp.path.as_deref() {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_DATA_ROOT),
        }
    }

    /// Name of the system user that owns tenant files.
    pub fn system_username(&self) -> &str {
        self.docker
            .container
            .username
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_USER)
    }
}

/// Resolve a system user name to the uid/gid pair the gateway chowns with.
pub fn lookup_system_user(name: &str) -> Result<OwnershipTarget> {
    let c_name = CString::new(name)
        .map_err(|_| Error::Config(format!("invalid system user name: {name}")))?;

    // getpwnam is only called once, at startup, before any threads that
    // could race on the passwd buffer exist.
    let passwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if passwd.is_null() {
        return Err(Error::Config(format!("system user {name} does not exist")));
    }

    unsafe {
        Ok(OwnershipTarget {
            uid: (*passwd).pw_uid,
            gid: (*passwd).pw_gid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "debug": false,
        "keys": ["key-one", "key-two"],
        "remote": {"base": "https://panel.example.com"},
        "sftp": {"path": "/var/lib/tenants"},
        "docker": {"container": {"username": "gamesd"}}
    }"#;

    #[test]
    fn test_full_document() {
        let cp = ControlPlane::from_slice(DOCUMENT.as_bytes()).unwrap();
        assert_eq!(cp.remote_base(), "https://panel.example.com");
        assert_eq!(cp.api_token().unwrap(), "key-one");
        assert_eq!(cp.data_root(), PathBuf::from("/var/lib/tenants"));
        assert_eq!(cp.system_username(), "gamesd");
    }

    #[test]
    fn test_defaults_applied() {
        let cp = ControlPlane::from_slice(
            br#"{"keys": ["k"], "remote": {"base": "https://panel.example.com"}}"#,
        )
        .unwrap();
        assert_eq!(cp.data_root(), PathBuf::from(DEFAULT_DATA_ROOT));
        assert_eq!(cp.system_username(), DEFAULT_SYSTEM_USER);
    }

    #[test]
    fn test_missing_keys_is_an_error() {
        let cp = ControlPlane::from_slice(
            br#"{"remote": {"base": "https://panel.example.com"}}"#,
        )
        .unwrap();
        assert!(cp.api_token().is_err());
    }

    #[test]
    fn test_missing_remote_fails_to_parse() {
        assert!(ControlPlane::from_slice(br#"{"keys": ["k"]}"#).is_err());
    }

    #[test]
    fn test_empty_sftp_path_falls_back() {
        let cp = ControlPlane::from_slice(
            br#"{"keys": ["k"], "remote": {"base": "x"}, "sftp": {"path": ""}}"#,
        )
        .unwrap();
        assert_eq!(cp.data_root(), PathBuf::from(DEFAULT_DATA_ROOT));
    }

    #[test]
    fn test_current_ownership_is_stable() {
        let a = OwnershipTarget::current();
        let b = OwnershipTarget::current();
        assert_eq!(a, b);
    }
}
