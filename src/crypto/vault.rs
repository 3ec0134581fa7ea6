use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::{DecryptionFailure, VaultError};

/// Tag stored as the first byte of every ciphertext.
pub type KeyVersion = u8;

/// OAEP overhead for SHA-256: two digests plus two framing bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

const KEY_FILE_PREFIX: &str = "vault-v";
const KEY_FILE_SUFFIX: &str = ".pem";

struct VersionedKey {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl VersionedKey {
    fn new(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }
}

/// Versioned RSA keyring used to seal logins, passwords and session cookies.
///
/// New ciphertext is always produced under the current (highest) version;
/// every loaded version can still open what it sealed earlier.
pub struct Vault {
    keys: BTreeMap<KeyVersion, VersionedKey>,
    current: KeyVersion,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .field("current", &self.current)
            .finish()
    }
}

impl Vault {
    /// Wrap an existing private key as the only (and current) version.
    pub fn from_key(version: KeyVersion, key: RsaPrivateKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, VersionedKey::new(key));
        Self {
            keys,
            current: version,
        }
    }

    /// Generate a fresh in-memory vault. Nothing is written to disk.
    pub fn generate(bits: usize) -> Result<Self, VaultError> {
        Ok(Self::from_key(1, generate_key(bits)?))
    }

    /// Load every persisted key version from `dir`, creating version 1 when
    /// the directory holds none.
    pub fn load_or_create(dir: &Path, bits: usize) -> Result<Self, VaultError> {
        let mut keys = BTreeMap::new();

        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                let Some(version) = key_version_from_path(&path) else {
                    continue;
                };
                let pem = fs::read_to_string(&path)?;
                let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                    VaultError::KeyStorage(format!("{}: {}", path.display(), e))
                })?;
                keys.insert(version, VersionedKey::new(private));
            }
        }

        match keys.keys().next_back().copied() {
            Some(current) => {
                tracing::info!(
                    "🔐 Loaded {} vault key version(s), current v{}",
                    keys.len(),
                    current
                );
                Ok(Self { keys, current })
            }
            None => {
                tracing::info!("🔐 No vault keys in {}, generating v1", dir.display());
                let vault = Self::generate(bits)?;
                vault.persist(dir)?;
                Ok(vault)
            }
        }
    }

    /// Write every key version to `dir` as PKCS#8 PEM.
    pub fn persist(&self, dir: &Path) -> Result<(), VaultError> {
        fs::create_dir_all(dir)?;

        for (version, key) in &self.keys {
            let pem = key
                .private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| VaultError::KeyStorage(e.to_string()))?;
            let path = key_path(dir, *version);
            fs::write(&path, pem.as_bytes())?;
            restrict_permissions(&path)?;
        }

        Ok(())
    }

    /// Add a new key version and make it current. Older versions stay loaded
    /// so existing ciphertext keeps decrypting.
    pub fn rotate(&mut self, bits: usize) -> Result<KeyVersion, VaultError> {
        let next = self
            .current
            .checked_add(1)
            .ok_or_else(|| VaultError::KeyGeneration("key version space exhausted".into()))?;

        self.keys.insert(next, VersionedKey::new(generate_key(bits)?));
        self.current = next;
        tracing::info!("🔄 Vault rotated to key v{}", next);

        Ok(next)
    }

    pub fn current_version(&self) -> KeyVersion {
        self.current
    }

    pub fn versions(&self) -> Vec<KeyVersion> {
        self.keys.keys().copied().collect()
    }

    /// Longest plaintext (in bytes) the current key can seal.
    pub fn max_plaintext_len(&self) -> usize {
        self.current_key()
            .public
            .size()
            .saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        let max = self.max_plaintext_len();
        if plaintext.len() > max {
            return Err(VaultError::PlaintextTooLong {
                len: plaintext.len(),
                max,
            });
        }

        let sealed = self
            .current_key()
            .public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(sealed.len() + 1);
        out.push(self.current);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String, DecryptionFailure> {
        let (&version, body) = ciphertext
            .split_first()
            .ok_or(DecryptionFailure::Truncated)?;

        let key = self
            .keys
            .get(&version)
            .ok_or(DecryptionFailure::UnknownKeyVersion(version))?;

        if body.len() != key.public.size() {
            return Err(DecryptionFailure::Truncated);
        }

        let opened = key
            .private
            .decrypt(Oaep::new::<Sha256>(), body)
            .map_err(|_| DecryptionFailure::Rejected)?;

        String::from_utf8(opened).map_err(|_| DecryptionFailure::NotUtf8)
    }

    fn current_key(&self) -> &VersionedKey {
        // `current` is always inserted alongside its key.
        &self.keys[&self.current]
    }
}

fn generate_key(bits: usize) -> Result<RsaPrivateKey, VaultError> {
    RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| VaultError::KeyGeneration(e.to_string()))
}

fn key_path(dir: &Path, version: KeyVersion) -> PathBuf {
    dir.join(format!("{KEY_FILE_PREFIX}{version}{KEY_FILE_SUFFIX}"))
}

fn key_version_from_path(path: &Path) -> Option<KeyVersion> {
    path.file_name()?
        .to_str()?
        .strip_prefix(KEY_FILE_PREFIX)?
        .strip_suffix(KEY_FILE_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

/// Small keys generated once per test binary; RSA key generation is slow.
#[cfg(test)]
pub(crate) fn shared_test_key(slot: usize) -> RsaPrivateKey {
    use std::sync::OnceLock;

    static KEYS: OnceLock<[RsaPrivateKey; 2]> = OnceLock::new();
    KEYS.get_or_init(|| {
        [
            generate_key(1024).expect("test key"),
            generate_key(1024).expect("test key"),
        ]
    })[slot]
        .clone()
}

#[cfg(test)]
pub(crate) fn test_vault() -> Vault {
    Vault::from_key(1, shared_test_key(0))
}
