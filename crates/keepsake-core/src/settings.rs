use std::{
    collections::BTreeSet,
    path::PathBuf,
};

/// Name of the private keyring directory kept inside the data directory.
pub const KEYRING_DIR: &str = "keyring";

/// Immutable snapshot of run parameters, built once before any archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory bundles are written to and pruned from.
    pub data_dir: PathBuf,
    /// Paths to archive, in processing order.
    pub sources: Vec<PathBuf>,
    /// Bundles kept per lineage; 0 keeps everything.
    pub retention: usize,
    /// Present when encryption is enabled.
    pub encryption: Option<EncryptionSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub recipients: RecipientSet,
    /// Directory of candidate key files used to fill keyring gaps.
    pub key_dir: Option<PathBuf>,
    /// Delete the plaintext bundle after successful encryption.
    pub remove_unencrypted: bool,
}

impl Settings {
    pub fn keyring_dir(&self) -> PathBuf {
        self.data_dir.join(KEYRING_DIR)
    }

    pub fn retention_enabled(&self) -> bool {
        self.retention > 0
    }

    pub fn recipients(&self) -> Option<&RecipientSet> {
        self.encryption.as_ref().map(|e| &e.recipients)
    }
}

/// Normalized set of recipient fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet(BTreeSet<String>);

impl RecipientSet {
    /// Parse a single fingerprint or a comma-delimited list.
    pub fn parse(raw: &str) -> Self {
        raw.split(',').collect()
    }

    /// Canonical form: no whitespace, upper-case. Empty input yields `None`.
    pub fn normalize(fingerprint: &str) -> Option<String> {
        let cleaned: String = fingerprint
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        (!cleaned.is_empty()).then_some(cleaned)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_set(&self) -> &BTreeSet<String> {
        &self.0
    }
}

impl<S: AsRef<str>> FromIterator<S> for RecipientSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .filter_map(|fp| Self::normalize(fp.as_ref()))
                .collect(),
        )
    }
}
