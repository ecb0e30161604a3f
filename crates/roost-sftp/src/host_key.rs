//! Host key identity.
//!
//! The gateway presents a single RSA host key persisted at
//! `<base_path>/.sftp/id_rsa`. The key is generated once per deployment:
//! a restart with the file present reuses it untouched, so clients keep a
//! stable fingerprint.

use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::info;

use crate::error::{Error, Result};

/// Directory under the base path holding gateway key material.
pub const HOST_KEY_DIR: &str = ".sftp";

/// File name of the persisted private key.
pub const HOST_KEY_FILE: &str = "id_rsa";

const KEY_BITS: usize = 2048;

/// Load the host key, generating and persisting it first when absent.
pub async fn load_or_generate(base_path: &Path) -> Result<russh_keys::key::KeyPair> {
    let dir = base_path.join(HOST_KEY_DIR);
    let path = dir.join(HOST_KEY_FILE);

    if !path.exists() {
        info!(event = "host_key_generating", path = ?path, "creating new host key");
        generate(&dir, &path)?;
    }

    let pem = tokio::fs::read_to_string(&path).await?;
    russh_keys::decode_secret_key(&pem, None)
        .map_err(|e| Error::Config(format!("failed to load host key: {e}")))
}

/// Generate a fresh key and persist it as PKCS#1 PEM. The key file is
/// created `0600`, its directory `0755`.
fn generate(dir: &Path, path: &Path) -> Result<()> {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS)
        .map_err(|e| Error::Config(format!("failed to generate host key: {e}")))?;

    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Config(format!("failed to encode host key: {e}")))?;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())?;

    Ok(())
}
