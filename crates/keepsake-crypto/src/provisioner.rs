use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use keepsake_core::{encryption::EncryptionProvider, settings::RecipientSet};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Fatal outcomes of key provisioning. Any of these stops the run: bundles are
/// never encrypted to a partial recipient set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("unable to query keyring: {reason}")]
    Keyring { reason: String },
    #[error("no key directory configured; missing public key(s) for {}", join(missing))]
    NoKeyDir { missing: BTreeSet<String> },
    #[error("unable to read key directory {}: {reason}", path.display())]
    KeyDirUnreadable { path: PathBuf, reason: String },
    #[error("no key files found in {}", path.display())]
    KeyDirEmpty { path: PathBuf },
    #[error("missing public key(s) for {}; add the keys or remove the fingerprints", join(missing))]
    Unresolved { missing: BTreeSet<String> },
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// Readiness of the keyring for this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyringState {
    #[default]
    Unchecked,
    Ready,
    Fatal(ProvisionError),
}

/// Reconciles the recipients a run needs against the provider's keyring,
/// importing missing keys from a directory of candidate key files.
///
/// The outcome is memoized: once `Ready` or `Fatal`, later calls return the
/// cached result without touching the keyring or the key directory.
#[derive(Debug, Default)]
pub struct KeyProvisioner {
    key_dir: Option<PathBuf>,
    state: KeyringState,
}

impl KeyProvisioner {
    pub fn new(key_dir: Option<PathBuf>) -> Self {
        Self {
            key_dir,
            state: KeyringState::Unchecked,
        }
    }

    pub fn state(&self) -> &KeyringState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == KeyringState::Ready
    }

    /// Make sure every fingerprint in `required` is on the keyring.
    pub async fn ensure_ready<P>(
        &mut self,
        provider: &P,
        required: &RecipientSet,
    ) -> Result<(), ProvisionError>
    where
        P: EncryptionProvider + ?Sized,
    {
        match &self.state {
            KeyringState::Ready => return Ok(()),
            KeyringState::Fatal(err) => return Err(err.clone()),
            KeyringState::Unchecked => {}
        }

        match self.reconcile(provider, required).await {
            Ok(()) => {
                self.state = KeyringState::Ready;
                Ok(())
            }
            Err(err) => {
                error!("{err}");
                self.state = KeyringState::Fatal(err.clone());
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(provider = provider.name()))]
    async fn reconcile<P>(&self, provider: &P, required: &RecipientSet) -> Result<(), ProvisionError>
    where
        P: EncryptionProvider + ?Sized,
    {
        let imported: BTreeSet<String> = provider
            .list_imported_fingerprints()
            .await
            .map_err(|e| ProvisionError::Keyring {
                reason: e.to_string(),
            })?
            .iter()
            .filter_map(|fp| RecipientSet::normalize(fp))
            .collect();

        let mut missing: BTreeSet<String> =
            required.as_set().difference(&imported).cloned().collect();
        if missing.is_empty() {
            info!("All fingerprints have imported keys");
            return Ok(());
        }
        info!("Not all recipients on keyring, missing keys: {}", join(&missing));

        let Some(key_dir) = &self.key_dir else {
            return Err(ProvisionError::NoKeyDir { missing });
        };
        let candidates = candidate_files(key_dir)?;
        if candidates.is_empty() {
            return Err(ProvisionError::KeyDirEmpty {
                path: key_dir.clone(),
            });
        }

        // Every file is read even after `missing` drains: one file may carry
        // several keys and the scan order carries no meaning.
        for file in &candidates {
            let material = match fs::read(file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("unable to read key file {}: {err}", file.display());
                    continue;
                }
            };
            let carried = match provider.inspect_key(&material).await {
                Ok(found) => found,
                Err(err) => {
                    warn!("skipping {}: {err}", file.display());
                    continue;
                }
            };
            debug!(file = %file.display(), ?carried, "key read");

            let matched: Vec<String> = carried
                .iter()
                .filter_map(|fp| RecipientSet::normalize(fp))
                .filter(|fp| missing.contains(fp))
                .collect();
            if matched.is_empty() {
                continue;
            }

            match provider.import_key(&material).await {
                Ok(()) => {
                    for fp in &matched {
                        missing.remove(fp);
                    }
                    info!("imported {} from {}", matched.join(", "), file.display());
                }
                Err(err) => warn!("importing {} failed: {err}", file.display()),
            }
        }

        if !missing.is_empty() {
            return Err(ProvisionError::Unresolved { missing });
        }
        info!("All supplied fingerprint keys added to keyring.");
        Ok(())
    }
}

/// Regular files in `dir` (symlinks followed), sorted by name.
fn candidate_files(dir: &Path) -> Result<Vec<PathBuf>, ProvisionError> {
    let unreadable = |reason: String| ProvisionError::KeyDirUnreadable {
        path: dir.to_path_buf(),
        reason,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| unreadable(e.to_string()))? {
        let path = entry.map_err(|e| unreadable(e.to_string()))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
