//! Capability gradient, wildcard, and read-only switch behavior.

use std::sync::Arc;

use roost_sftp::handler::{CmdMethod, CmdRequest, ListMethod};
use roost_sftp::protocol::StatusCode;
use roost_sftp::{
    Error, FsHandler, OwnershipTarget, PermissionSet, QuotaCache, SessionPrincipal,
};
use tempfile::TempDir;
use tokio::fs;

fn handler(temp: &TempDir, tags: &[&str], read_only: bool) -> FsHandler {
    let root = temp.path().join("data").join("tenant-a");
    std::fs::create_dir_all(&root).unwrap();

    FsHandler::new(
        SessionPrincipal {
            tenant_id: "tenant-a".to_string(),
            username: "alice".to_string(),
            permissions: PermissionSet::new(tags.iter().map(|t| t.to_string()).collect()),
        },
        root,
        temp.path().join("servers/tenant-a/server.json"),
        read_only,
        OwnershipTarget::current(),
        Arc::new(QuotaCache::new(true)),
    )
}

fn tenant_root(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join("data").join("tenant-a")
}

#[tokio::test]
async fn test_list_only_principal_gradient() {
    let temp = TempDir::new().unwrap();
    let fs_handler = handler(&temp, &["list-files"], false);

    fs::write(tenant_root(&temp).join("file.txt"), b"x").await.unwrap();

    // Listing works.
    assert!(fs_handler.file_list(ListMethod::List, "/").await.is_ok());

    // Everything else is denied with PermissionDenied, and nothing changes
    // on disk.
    let err = fs_handler.file_read("file.txt").await.unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::PermissionDenied as u32);

    let err = fs_handler.file_write("file.txt").await.unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::PermissionDenied as u32);

    let err = fs_handler
        .file_cmd(CmdRequest {
            method: CmdMethod::Rename,
            filepath: "file.txt",
            target: Some("moved.txt"),
            attrs: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::PermissionDenied as u32);

    assert!(tenant_root(&temp).join("file.txt").exists());
    assert!(!tenant_root(&temp).join("moved.txt").exists());
}

#[tokio::test]
async fn test_wildcard_passes_every_gate() {
    let temp = TempDir::new().unwrap();
    let fs_handler = handler(&temp, &["*"], false);

    assert!(fs_handler.file_write("a.txt").await.is_ok());
    assert!(fs_handler.file_read("a.txt").await.is_ok());
    assert!(fs_handler.file_list(ListMethod::List, "/").await.is_ok());
    assert!(fs_handler
        .file_cmd(CmdRequest {
            method: CmdMethod::Mkdir,
            filepath: "dir",
            target: None,
            attrs: None,
        })
        .await
        .is_ok());
    assert!(fs_handler
        .file_cmd(CmdRequest {
            method: CmdMethod::Rename,
            filepath: "a.txt",
            target: Some("b.txt"),
            attrs: None,
        })
        .await
        .is_ok());
    assert!(fs_handler
        .file_cmd(CmdRequest {
            method: CmdMethod::Remove,
            filepath: "b.txt",
            target: None,
            attrs: None,
        })
        .await
        .is_ok());
}

#[tokio::test]
async fn test_unknown_tags_deny() {
    let temp = TempDir::new().unwrap();
    let fs_handler = handler(&temp, &["administrator", "everything"], false);

    let err = fs_handler.file_list(ListMethod::List, "/").await.unwrap_err();
    assert!(matches!(err, Error::CapabilityDenied(_)));
}

#[tokio::test]
async fn test_read_only_rejects_every_mutation_for_owners() {
    let temp = TempDir::new().unwrap();
    let fs_handler = handler(&temp, &["*"], true);

    fs::write(tenant_root(&temp).join("file.txt"), b"x").await.unwrap();

    // Reads and listings still work.
    assert!(fs_handler.file_read("file.txt").await.is_ok());
    assert!(fs_handler.file_list(ListMethod::List, "/").await.is_ok());

    // Writes are unsupported operations, not permission failures.
    let err = fs_handler.file_write("file.txt").await.unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::OpUnsupported as u32);

    for method in [
        CmdMethod::Setstat,
        CmdMethod::Mkdir,
        CmdMethod::Remove,
        CmdMethod::Rmdir,
    ] {
        let err = fs_handler
            .file_cmd(CmdRequest {
                method,
                filepath: "file.txt",
                target: None,
                attrs: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly), "method {method:?}");
    }

    // No side effects happened.
    assert!(tenant_root(&temp).join("file.txt").exists());
    assert_eq!(
        fs::read(tenant_root(&temp).join("file.txt")).await.unwrap(),
        b"x"
    );
}

#[tokio::test]
async fn test_setstat_needs_no_capability() {
    let temp = TempDir::new().unwrap();
    let fs_handler = handler(&temp, &[], false);

    fs::write(tenant_root(&temp).join("f"), b"x").await.unwrap();

    assert!(fs_handler
        .file_cmd(CmdRequest {
            method: CmdMethod::Setstat,
            filepath: "f",
            target: None,
            attrs: None,
        })
        .await
        .is_ok());
}
