//! Process-wide SSH keypair.
//!
//! One keypair is generated under `local.keys_dir` on first start and
//! reused across all providers and nodes. Key-based auth only; the
//! private key file is written with mode 0600.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tracing::{debug, info};

use crate::error::{RemoteError, RemoteResult};

const KEY_PREFIX: &str = "yakey";

/// The loaded (or freshly generated) process keypair.
#[derive(Clone)]
pub struct KeyStore {
    pub keypair: Arc<KeyPair>,
    /// Key file name, also used as the key comment and cloud key name.
    pub name: String,
    pub path: PathBuf,
}

impl KeyStore {
    /// Load the first `yakey*` private key from `keys_dir`, generating a
    /// new ed25519 key if none exists.
    pub fn load_or_generate(keys_dir: &Path) -> RemoteResult<Self> {
        std::fs::create_dir_all(keys_dir)?;

        let mut entries: Vec<_> = std::fs::read_dir(keys_dir)?
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_name().to_string_lossy().starts_with(KEY_PREFIX)
                    && e.path().is_file()
            })
            .collect();
        entries.sort_by_key(|e| e.file_name());

        if let Some(entry) = entries.first() {
            let path = entry.path();
            let keypair = russh_keys::load_secret_key(&path, None)
                .map_err(|e| RemoteError::Keys(format!("cannot load {}: {e}", path.display())))?;
            let name = entry.file_name().to_string_lossy().to_string();
            debug!(key = %name, "loaded ssh key");
            return Ok(Self {
                keypair: Arc::new(keypair),
                name,
                path,
            });
        }

        let keypair = KeyPair::generate_ed25519()
            .ok_or_else(|| RemoteError::Keys("ed25519 key generation failed".to_string()))?;
        let name = format!("{KEY_PREFIX}-{}", random_suffix(8));
        let path = keys_dir.join(&name);

        let file = std::fs::File::create(&path)?;
        russh_keys::encode_pkcs8_pem(&keypair, &file)
            .map_err(|e| RemoteError::Keys(format!("cannot write {}: {e}", path.display())))?;
        set_private_mode(&path)?;
        info!(key = %name, "generated ssh key");

        Ok(Self {
            keypair: Arc::new(keypair),
            name,
            path,
        })
    }

    /// OpenSSH `authorized_keys` line for the public half.
    pub fn public_openssh(&self) -> String {
        format!(
            "{} {} {}",
            self.keypair.name(),
            self.keypair.public_key_base64(),
            self.name
        )
    }
}

#[cfg(unix)]
fn set_private_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_private_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range('a'..='z')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = KeyStore::load_or_generate(dir.path()).unwrap();
        assert!(first.name.starts_with(KEY_PREFIX));
        assert!(first.path.is_file());

        let second = KeyStore::load_or_generate(dir.path()).unwrap();
        assert_eq!(second.name, first.name);
        assert_eq!(second.public_openssh(), first.public_openssh());
    }

    #[test]
    fn public_line_has_algorithm_key_and_comment() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::load_or_generate(dir.path()).unwrap();
        let line = keys.public_openssh();
        let parts: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ssh-ed25519");
        assert_eq!(parts[2], keys.name);
    }

    #[cfg(unix)]
    #[test]
    fn private_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::load_or_generate(dir.path()).unwrap();
        let mode = std::fs::metadata(&keys.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
