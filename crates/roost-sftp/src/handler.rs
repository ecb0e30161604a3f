//! Per-session filesystem handler.
//!
//! Every operation a peer can perform funnels through one of the four
//! families here, and each family applies the same invariants in the same
//! order: resolve the path through the sandbox, check the capability tag,
//! gate writes on the read-only switch and the quota, and chown whatever
//! was created. Nothing below this module ever sees an unresolved path.

use std::ffi::CString;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::OwnershipTarget;
use crate::error::{Error, Result};
use crate::permissions::{Capability, PermissionSet};
use crate::protocol::FileAttrs;
use crate::quota::QuotaCache;
use crate::sandbox;

/// The authenticated identity bound to one session. Immutable for the
/// session's lifetime.
#[derive(Debug, Clone)]
pub struct SessionPrincipal {
    /// Tenant identifier; also the subdirectory name under the data root.
    pub tenant_id: String,
    /// Login name, kept for logging only.
    pub username: String,
    /// Capability tags granted by the control plane.
    pub permissions: PermissionSet,
}

/// Methods dispatched through [`FsHandler::file_cmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdMethod {
    Setstat,
    Rename,
    Rmdir,
    Mkdir,
    Symlink,
    Remove,
}

/// A non-I/O filesystem command.
#[derive(Debug)]
pub struct CmdRequest<'a> {
    pub method: CmdMethod,
    pub filepath: &'a str,
    /// Destination for `Rename`, link location for `Symlink`.
    pub target: Option<&'a str>,
    /// Client-supplied attributes; only consulted by `Setstat`.
    pub attrs: Option<&'a FileAttrs>,
}

/// Methods dispatched through [`FsHandler::file_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    List,
    Stat,
}

/// One directory entry with its attribute block.
#[derive(Debug, Clone)]
pub struct NamedEntry {
    pub name: String,
    pub attrs: FileAttrs,
}

/// Random-access view over a pre-materialized entry list.
///
/// The directory is read eagerly; consumers page through it by offset, and
/// an offset at or past the end signals end-of-sequence (an empty slice).
#[derive(Debug)]
pub struct DirLister {
    entries: Vec<NamedEntry>,
}

impl DirLister {
    pub fn new(entries: Vec<NamedEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `max` entries starting at `offset`.
    pub fn list_at(&self, offset: usize, max: usize) -> &[NamedEntry] {
        if offset >= self.entries.len() {
            return &[];
        }
        let end = (offset + max).min(self.entries.len());
        &self.entries[offset..end]
    }
}

/// Filesystem handler for one authenticated session.
pub struct FsHandler {
    principal: SessionPrincipal,
    root: PathBuf,
    server_config: PathBuf,
    read_only: bool,
    owner: OwnershipTarget,
    quota: Arc<QuotaCache>,
    /// Serializes the stat+open decision of concurrent read/write requests
    /// on this session. Held only across that decision, never across the
    /// subsequent I/O on the returned file.
    lock: Mutex<()>,
}

impl FsHandler {
    pub fn new(
        principal: SessionPrincipal,
        root: PathBuf,
        server_config: PathBuf,
        read_only: bool,
        owner: OwnershipTarget,
        quota: Arc<QuotaCache>,
    ) -> Self {
        Self {
            principal,
            root,
            server_config,
            read_only,
            owner,
            quota,
            lock: Mutex::new(()),
        }
    }

    pub fn principal(&self) -> &SessionPrincipal {
        &self.principal
    }

    /// Open a file for reading. Requires `edit-files` (the legacy tag name
    /// for read access).
    pub async fn file_read(&self, filepath: &str) -> Result<fs::File> {
        let p = self.resolve(filepath)?;

        self.require(Capability::EditFiles)?;

        let _guard = self.lock.lock().await;

        match fs::metadata(&p).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::FileNotFound(filepath.to_string()));
            }
            Err(e) => {
                error!(
                    event = "stat_failed",
                    tenant = %self.principal.tenant_id,
                    source = ?p,
                    error = %e,
                    "could not stat file for reading"
                );
                return Err(Error::Io(e));
            }
            Ok(_) => {}
        }

        fs::OpenOptions::new().read(true).open(&p).await.map_err(|e| {
            error!(
                event = "open_read_failed",
                tenant = %self.principal.tenant_id,
                source = ?p,
                error = %e,
                "could not open file for reading"
            );
            Error::Io(e)
        })
    }

    /// Open a file for writing, creating it (and its parent directories)
    /// when absent. New files require `create-files`; overwriting an
    /// existing file requires `save-files`.
    pub async fn file_write(&self, filepath: &str) -> Result<fs::File> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let p = self.resolve(filepath)?;

        if !self
            .quota
            .has_space(&self.principal.tenant_id, &self.root, &self.server_config)
            .await
        {
            info!(
                event = "write_denied_quota",
                tenant = %self.principal.tenant_id,
                "denying file write due to space limit"
            );
            return Err(Error::QuotaExceeded(self.principal.tenant_id.clone()));
        }

        let _guard = self.lock.lock().await;

        match fs::metadata(&p).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.require(Capability::CreateFiles)?;

                if let Some(parent) = p.parent() {
                    fs::DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(parent)
                        .await
                        .map_err(|e| {
                            error!(
                                event = "mkdir_for_file_failed",
                                tenant = %self.principal.tenant_id,
                                source = ?p,
                                path = ?parent,
                                error = %e,
                                "could not create path for file"
                            );
                            Error::Io(e)
                        })?;
                }

                let file = self.create_truncate(&p).await?;
                self.chown(&p);
                Ok(file)
            }
            Err(e) => {
                error!(
                    event = "stat_failed",
                    tenant = %self.principal.tenant_id,
                    source = ?p,
                    error = %e,
                    "could not stat file for writing"
                );
                Err(Error::Io(e))
            }
            Ok(_) => {
                self.require(Capability::SaveFiles)?;

                let file = self.create_truncate(&p).await?;
                self.chown(&p);
                Ok(file)
            }
        }
    }

    /// Dispatch a non-I/O command. The read-only switch rejects every
    /// method before dispatch, `Setstat` included.
    pub async fn file_cmd(&self, request: CmdRequest<'_>) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let p = self.resolve(request.filepath)?;

        // A rename or symlink destination resolves under the same root;
        // escapes there surface as an unsupported operation rather than a
        // missing file.
        let target = match request.target {
            Some(raw) => Some(
                sandbox::resolve(&self.root, raw)
                    .map_err(|_| self.target_escape(raw))?,
            ),
            None => None,
        };

        match request.method {
            CmdMethod::Setstat => {
                // The gateway does not honor client mode bits, times, or
                // ownership; only the file-vs-directory distinction
                // survives.
                let mode = if request.attrs.map_or(false, FileAttrs::requests_directory) {
                    0o755
                } else {
                    0o644
                };

                let perms = std::fs::Permissions::from_mode(mode);
                fs::set_permissions(&p, perms).await.map_err(|e| {
                    error!(
                        event = "setstat_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        error = %e,
                        "failed to perform setstat"
                    );
                    Error::Io(e)
                })?;
                return Ok(());
            }
            CmdMethod::Rename => {
                self.require(Capability::MoveFiles)?;

                let t = target
                    .as_ref()
                    .ok_or_else(|| Error::protocol("rename without a target path"))?;
                fs::rename(&p, t).await.map_err(|e| {
                    error!(
                        event = "rename_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        target = ?t,
                        error = %e,
                        "failed to rename file"
                    );
                    Error::Io(e)
                })?;
            }
            CmdMethod::Rmdir => {
                self.require(Capability::DeleteFiles)?;

                fs::remove_dir_all(&p).await.map_err(|e| {
                    error!(
                        event = "rmdir_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        error = %e,
                        "failed to remove directory"
                    );
                    Error::Io(e)
                })?;
                // Nothing left to chown.
                return Ok(());
            }
            CmdMethod::Mkdir => {
                self.require(Capability::CreateFiles)?;

                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(&p)
                    .await
                    .map_err(|e| {
                        error!(
                            event = "mkdir_failed",
                            tenant = %self.principal.tenant_id,
                            source = ?p,
                            error = %e,
                            "failed to create directory"
                        );
                        Error::Io(e)
                    })?;
            }
            CmdMethod::Symlink => {
                self.require(Capability::CreateFiles)?;

                let t = target
                    .as_ref()
                    .ok_or_else(|| Error::protocol("symlink without a target path"))?;
                fs::symlink(&p, t).await.map_err(|e| {
                    error!(
                        event = "symlink_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        target = ?t,
                        error = %e,
                        "failed to create symlink"
                    );
                    Error::Io(e)
                })?;
            }
            CmdMethod::Remove => {
                self.require(Capability::DeleteFiles)?;

                fs::remove_file(&p).await.map_err(|e| {
                    error!(
                        event = "remove_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        error = %e,
                        "failed to remove file"
                    );
                    Error::Io(e)
                })?;
                return Ok(());
            }
        }

        // Rename, Mkdir, and Symlink fall through here; the created or
        // moved node takes the configured ownership.
        let created: &Path = target.as_deref().unwrap_or(&p);
        self.chown(created);

        Ok(())
    }

    /// Directory listings and stat calls. Both require `list-files`.
    pub async fn file_list(&self, method: ListMethod, filepath: &str) -> Result<DirLister> {
        let p = self.resolve(filepath)?;

        self.require(Capability::ListFiles)?;

        match method {
            ListMethod::List => {
                let mut reader = fs::read_dir(&p).await.map_err(|e| {
                    error!(
                        event = "list_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        error = %e,
                        "error listing directory"
                    );
                    Error::Io(e)
                })?;

                let mut entries = Vec::new();
                while let Some(entry) = reader.next_entry().await.map_err(Error::Io)? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    match entry.metadata().await {
                        Ok(metadata) => entries.push(NamedEntry {
                            name,
                            attrs: FileAttrs::from_metadata(&metadata),
                        }),
                        Err(e) => {
                            debug!(
                                event = "list_entry_skipped",
                                entry = %name,
                                error = %e,
                                "skipping unreadable directory entry"
                            );
                        }
                    }
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));

                Ok(DirLister::new(entries))
            }
            ListMethod::Stat => match fs::metadata(&p).await {
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(Error::FileNotFound(filepath.to_string()))
                }
                Err(e) => {
                    error!(
                        event = "stat_failed",
                        tenant = %self.principal.tenant_id,
                        source = ?p,
                        error = %e,
                        "error running stat on file"
                    );
                    Err(Error::Io(e))
                }
                Ok(metadata) => {
                    let name = p
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "/".to_string());
                    Ok(DirLister::new(vec![NamedEntry {
                        name,
                        attrs: FileAttrs::from_metadata(&metadata),
                    }]))
                }
            },
        }
    }

    fn resolve(&self, filepath: &str) -> Result<PathBuf> {
        sandbox::resolve(&self.root, filepath).map_err(|e| {
            warn!(
                event = "path_escape_rejected",
                tenant = %self.principal.tenant_id,
                user = %self.principal.username,
                requested = %filepath,
                "rejected path outside the tenant root"
            );
            e
        })
    }

    fn target_escape(&self, raw: &str) -> Error {
        warn!(
            event = "target_escape_rejected",
            tenant = %self.principal.tenant_id,
            user = %self.principal.username,
            requested = %raw,
            "rejected target path outside the tenant root"
        );
        Error::TargetEscape(raw.to_string())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.principal.permissions.can(capability) {
            Ok(())
        } else {
            Err(Error::CapabilityDenied(capability.tag()))
        }
    }

    async fn create_truncate(&self, p: &Path) -> Result<fs::File> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(p)
            .await
            .map_err(|e| {
                error!(
                    event = "open_write_failed",
                    tenant = %self.principal.tenant_id,
                    source = ?p,
                    error = %e,
                    "could not open file for writing"
                );
                Error::Io(e)
            })
    }

    /// Apply the configured ownership. Failure is logged and swallowed: the
    /// node exists and is usable, wrong ownership is an operational issue
    /// rather than a client-visible one.
    fn chown(&self, path: &Path) {
        if let Err(e) = chown_path(path, self.owner) {
            warn!(
                event = "chown_failed",
                tenant = %self.principal.tenant_id,
                file = ?path,
                uid = self.owner.uid,
                gid = self.owner.gid,
                error = %e,
                "could not set ownership"
            );
        }
    }
}

fn chown_path(path: &Path, owner: OwnershipTarget) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(ErrorKind::InvalidInput, "path contains a null byte")
    })?;

    let rc = unsafe { libc::chown(c_path.as_ptr(), owner.uid, owner.gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
