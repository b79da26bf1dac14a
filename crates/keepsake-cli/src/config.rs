use std::{
    fs,
    path::{Path, PathBuf},
};

use dirs::config_dir;
use keepsake_core::settings::{EncryptionSettings, RecipientSet, Settings};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cli::Overrides;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/keepsake";

/// Configuration problems. All of them stop the process before any archiving.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no config dir available")]
    NoConfigDir,
    #[error("unable to read config file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("invalid config file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("unable to write config file {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },
    #[error("no paths to back up; set KEEPSAKE_PATH or `paths` in the config file")]
    NoSources,
    #[error("KEEPSAKE_NUMBER_COPIES needs to be a number, got {value:?}")]
    InvalidRetention { value: String },
    #[error(
        "encryption enabled but no fingerprints found; set KEEPSAKE_ENCRYPTION_FINGERPRINTS or disable KEEPSAKE_ENCRYPTION_ENABLE"
    )]
    NoRecipients,
    #[error("unable to create data directory {}: {reason}", path.display())]
    DataDirCreate { path: PathBuf, reason: String },
    #[error("unable to write to data directory {}: {reason}", path.display())]
    DataDirUnwritable { path: PathBuf, reason: String },
}

/// Config file loaded from `~/.config/keepsake/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Directory bundles are written to.
    pub data_dir: Option<PathBuf>,
    /// Paths to back up.
    pub paths: Option<Vec<PathBuf>>,
    /// Bundles kept per path (0 keeps everything).
    pub copies: Option<usize>,
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub enabled: Option<bool>,
    pub fingerprints: Option<Fingerprints>,
    pub key_dir: Option<PathBuf>,
    pub remove_unencrypted: Option<bool>,
}

/// `fingerprints = "ABCD"` or `fingerprints = ["ABCD", "EF01"]`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Fingerprints {
    One(String),
    Many(Vec<String>),
}

impl Fingerprints {
    fn into_set(self) -> RecipientSet {
        match self {
            Fingerprints::One(raw) => RecipientSet::parse(&raw),
            Fingerprints::Many(list) => list.iter().flat_map(|raw| raw.split(',')).collect(),
        }
    }
}

impl FileConfig {
    /// Starter file written by `keepsake config init`.
    pub fn starter() -> Self {
        Self {
            data_dir: Some(PathBuf::from(DEFAULT_DATA_DIR)),
            paths: Some(Vec::new()),
            copies: Some(0),
            encryption: Some(EncryptionConfig {
                enabled: Some(false),
                fingerprints: Some(Fingerprints::Many(Vec::new())),
                key_dir: None,
                remove_unencrypted: Some(false),
            }),
        }
    }
}

/// Load the file config (explicit path or platform default) and merge the
/// overrides into an immutable `Settings`.
pub fn settings(overrides: &Overrides) -> Result<Settings, ConfigError> {
    let path = match &overrides.config {
        Some(path) => path.clone(),
        None => default_path()?,
    };
    let file = load_from_path(&path)?;
    resolve(file, overrides)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<FileConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if contents.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf, ConfigError> {
    let base = config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join("keepsake").join("config.toml"))
}

/// Write `config` to `path` unless a file is already there, creating parent
/// directories as needed.
pub fn write_if_missing(config: &FileConfig, path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let write_err = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
    }
    let body = toml::to_string_pretty(config).map_err(|e| write_err(e.to_string()))?;
    fs::write(path, body).map_err(|e| write_err(e.to_string()))?;
    Ok(path.to_path_buf())
}

/// Merge `overrides` over `file`. Pure: touches neither environment nor disk.
pub fn resolve(file: FileConfig, overrides: &Overrides) -> Result<Settings, ConfigError> {
    let data_dir = match overrides.data_dir.clone().or(file.data_dir) {
        Some(dir) => dir,
        None => {
            let dir = PathBuf::from(DEFAULT_DATA_DIR);
            warn!(
                "KEEPSAKE_DATA_DIR not set. Defaulting to {}",
                dir.display()
            );
            dir
        }
    };
    info!("keepsake data directory is {}", data_dir.display());

    let sources: Vec<PathBuf> = match &overrides.paths {
        Some(raw) => raw
            .split(':')
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .collect(),
        None => file.paths.unwrap_or_default(),
    };
    if sources.is_empty() {
        return Err(ConfigError::NoSources);
    }

    let retention = match &overrides.copies {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidRetention { value: raw.clone() })?,
        None => file.copies.unwrap_or(0),
    };

    let file_enc = file.encryption.unwrap_or_default();
    let enabled = overrides
        .encrypt
        .as_deref()
        .map(parse_bool)
        .or(file_enc.enabled)
        .unwrap_or(false);
    info!("Backup encryption enabled: {enabled}");

    let encryption = if enabled {
        let recipients = match &overrides.fingerprints {
            Some(raw) => RecipientSet::parse(raw),
            None => file_enc
                .fingerprints
                .map(Fingerprints::into_set)
                .unwrap_or_default(),
        };
        if recipients.is_empty() {
            return Err(ConfigError::NoRecipients);
        }
        let key_dir = overrides.key_dir.clone().or(file_enc.key_dir);
        if key_dir.is_none() {
            warn!("No KEEPSAKE_ENCRYPTION_PUBLIC_KEY_DIR set, this is not an issue if the public keys are already imported.");
        }
        let remove_unencrypted = overrides
            .remove_unencrypted
            .as_deref()
            .map(parse_bool)
            .or(file_enc.remove_unencrypted)
            .unwrap_or(false);
        Some(EncryptionSettings {
            recipients,
            key_dir,
            remove_unencrypted,
        })
    } else {
        None
    };

    Ok(Settings {
        data_dir,
        sources,
        retention,
        encryption,
    })
}

/// Create the data directory if needed and prove it is writable.
pub fn prepare_data_dir(settings: &Settings) -> Result<(), ConfigError> {
    let dir = &settings.data_dir;
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::DataDirCreate {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        info!("Created directory {}", dir.display());
    }
    tempfile::NamedTempFile::new_in(dir)
        .map(drop)
        .map_err(|e| ConfigError::DataDirUnwritable {
            path: dir.clone(),
            reason: e.to_string(),
        })
}

/// `true`/`1` (any case) enable a flag; anything else disables it.
pub fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1")
}
