use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{bundle::encrypted_sibling, settings::RecipientSet};

/// Errors produced by encryption backends.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    /// The keyring could not be queried or is unusable.
    #[error("keyring failure: {reason}")]
    Keyring { reason: String },
    /// Supplied bytes are not recognizable key material.
    #[error("invalid key material: {reason}")]
    InvalidKey { reason: String },
    /// Key material was recognized but the keyring refused it.
    #[error("key import failed: {reason}")]
    Import { reason: String },
    /// Encrypting a specific file failed.
    #[error("encrypting {} failed: {reason}", path.display())]
    Encrypt { path: PathBuf, reason: String },
}

/// Contract for the encryption backend: keyring inspection plus the file transform.
#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    /// Short name used for logging.
    fn name(&self) -> &'static str;

    /// Fingerprints of every key currently usable as a recipient.
    async fn list_imported_fingerprints(&self) -> Result<BTreeSet<String>, EncryptionError>;

    /// Fingerprints carried by `material` without importing it.
    async fn inspect_key(&self, material: &[u8]) -> Result<BTreeSet<String>, EncryptionError>;

    /// Import every key in `material` into the keyring.
    async fn import_key(&self, material: &[u8]) -> Result<(), EncryptionError>;

    /// Encrypt `path` to all `recipients`, returning the encrypted sibling's path.
    async fn encrypt_file(
        &self,
        path: &Path,
        recipients: &RecipientSet,
    ) -> Result<PathBuf, EncryptionError>;
}

/// In-memory keyring that simulates encryption for tests and smoke runs.
/// Key material is plain text with one `fpr:<FINGERPRINT>` line per key.
/// This is not cryptographically secure.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyring {
    inner: Arc<Mutex<MemoryKeyringInner>>,
}

#[derive(Debug, Default)]
struct MemoryKeyringInner {
    imported: BTreeSet<String>,
    list_calls: usize,
    inspect_calls: usize,
    import_calls: usize,
    reject_imports: bool,
    fail_encryption: bool,
}

impl InMemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyring pre-populated with `fingerprints`.
    pub fn with_keys<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keyring = Self::new();
        if let Ok(mut state) = keyring.inner.lock() {
            state.imported = RecipientSet::from_iter(fingerprints).as_set().clone();
        }
        keyring
    }

    /// Build key material this keyring understands.
    pub fn key_material<I, S>(fingerprints: I) -> Vec<u8>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        fingerprints
            .into_iter()
            .map(|fp| format!("fpr:{}\n", fp.as_ref()))
            .collect::<String>()
            .into_bytes()
    }

    pub fn fingerprints(&self) -> BTreeSet<String> {
        self.state().map(|s| s.imported.clone()).unwrap_or_default()
    }

    pub fn list_calls(&self) -> usize {
        self.state().map(|s| s.list_calls).unwrap_or_default()
    }

    pub fn inspect_calls(&self) -> usize {
        self.state().map(|s| s.inspect_calls).unwrap_or_default()
    }

    pub fn import_calls(&self) -> usize {
        self.state().map(|s| s.import_calls).unwrap_or_default()
    }

    /// Make every subsequent import fail.
    pub fn reject_imports(&self, reject: bool) {
        if let Ok(mut state) = self.state() {
            state.reject_imports = reject;
        }
    }

    /// Make every subsequent `encrypt_file` fail.
    pub fn fail_encryption(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_encryption = fail;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryKeyringInner>, EncryptionError> {
        self.inner.lock().map_err(|err| EncryptionError::Keyring {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

fn parse_material(material: &[u8]) -> Result<BTreeSet<String>, EncryptionError> {
    let text = std::str::from_utf8(material).map_err(|e| EncryptionError::InvalidKey {
        reason: e.to_string(),
    })?;
    let found: BTreeSet<String> = text
        .lines()
        .filter_map(|line| line.trim().strip_prefix("fpr:"))
        .filter_map(RecipientSet::normalize)
        .collect();
    if found.is_empty() {
        return Err(EncryptionError::InvalidKey {
            reason: "no keys found".to_string(),
        });
    }
    Ok(found)
}

#[async_trait]
impl EncryptionProvider for InMemoryKeyring {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_imported_fingerprints(&self) -> Result<BTreeSet<String>, EncryptionError> {
        let mut state = self.state()?;
        state.list_calls += 1;
        Ok(state.imported.clone())
    }

    async fn inspect_key(&self, material: &[u8]) -> Result<BTreeSet<String>, EncryptionError> {
        self.state()?.inspect_calls += 1;
        parse_material(material)
    }

    async fn import_key(&self, material: &[u8]) -> Result<(), EncryptionError> {
        let mut state = self.state()?;
        state.import_calls += 1;
        if state.reject_imports {
            return Err(EncryptionError::Import {
                reason: "import rejected".to_string(),
            });
        }
        let keys = parse_material(material)?;
        state.imported.extend(keys);
        Ok(())
    }

    async fn encrypt_file(
        &self,
        path: &Path,
        recipients: &RecipientSet,
    ) -> Result<PathBuf, EncryptionError> {
        let encrypt_err = |reason: String| EncryptionError::Encrypt {
            path: path.to_path_buf(),
            reason,
        };
        {
            let state = self.state()?;
            if state.fail_encryption {
                return Err(encrypt_err("simulated failure".to_string()));
            }
            if let Some(missing) = recipients.iter().find(|fp| !state.imported.contains(*fp)) {
                return Err(encrypt_err(format!("no public key for {missing}")));
            }
        }

        let plaintext = fs::read(path).map_err(|e| encrypt_err(e.to_string()))?;
        let output = encrypted_sibling(path);
        fs::write(&output, mask(&plaintext)).map_err(|e| encrypt_err(e.to_string()))?;
        Ok(output)
    }
}

const MASK_BYTE: u8 = 0xA5;

fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}
