use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::Serialize;

/// Timestamp layout used in bundle file names (`20240131-235959`).
pub const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Same layout with the separator removed, used when parsing names back.
const PARSE_FORMAT: &str = "%Y%m%d%H%M%S";

pub const BUNDLE_EXTENSION: &str = ".tar.gz";
pub const ENCRYPTED_EXTENSION: &str = ".asc";

/// Grouping key for a source path: its last path segment.
/// Returns `None` for paths without one (e.g. `/` or `..`).
pub fn lineage_name(source: &Path) -> Option<String> {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// `{stamp}-{lineage}.tar.gz`
pub fn bundle_file_name(created_at: &NaiveDateTime, lineage: &str) -> String {
    format!(
        "{}-{lineage}{BUNDLE_EXTENSION}",
        created_at.format(STAMP_FORMAT)
    )
}

/// Path of the encrypted sibling for a plaintext bundle (`...tar.gz.asc`).
pub fn encrypted_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

/// One artifact produced by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub lineage: String,
    /// Creation time, second precision, UTC.
    pub created_at: NaiveDateTime,
    pub path: PathBuf,
    pub encrypted: bool,
}

impl Bundle {
    /// Plaintext bundle for `lineage` created at `created_at` inside `data_dir`.
    pub fn new(data_dir: &Path, lineage: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let lineage = lineage.into();
        let created_at = created_at.naive_utc().trunc_subsecs(0);
        let path = data_dir.join(bundle_file_name(&created_at, &lineage));
        Self {
            lineage,
            created_at,
            path,
            encrypted: false,
        }
    }

    /// The same bundle after encryption, pointing at its `.asc` sibling.
    pub fn into_encrypted(self, path: PathBuf) -> Self {
        Self {
            path,
            encrypted: true,
            ..self
        }
    }
}

/// A bundle reconstructed from a file found in the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    pub created_at: NaiveDateTime,
    pub lineage: String,
    pub path: PathBuf,
    pub encrypted: bool,
}

impl ArchiveRecord {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Outcome of matching one directory entry against a lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    /// Belongs to the lineage and carries a valid timestamp.
    Record(ArchiveRecord),
    /// Has the lineage suffix but the date/time fields do not parse.
    Unparsable,
    /// Belongs to another lineage or is not a bundle at all.
    Foreign,
}

/// Classify `file_name` (an entry of `dir`) for `lineage`.
///
/// The name is split on `-` into at most three parts: date, time and suffix.
/// The suffix must be exactly `{lineage}.tar.gz` or `{lineage}.tar.gz.asc`, so
/// lineages sharing a prefix or containing `-` never bleed into each other.
pub fn match_record(dir: &Path, file_name: &str, lineage: &str) -> NameMatch {
    let mut parts = file_name.splitn(3, '-');
    let (Some(date), Some(time), Some(suffix)) = (parts.next(), parts.next(), parts.next()) else {
        return NameMatch::Foreign;
    };

    let plain = format!("{lineage}{BUNDLE_EXTENSION}");
    let encrypted = if suffix == plain {
        false
    } else if suffix.strip_suffix(ENCRYPTED_EXTENSION) == Some(plain.as_str()) {
        true
    } else {
        return NameMatch::Foreign;
    };

    match parse_stamp(date, time) {
        Some(created_at) => NameMatch::Record(ArchiveRecord {
            created_at,
            lineage: lineage.to_string(),
            path: dir.join(file_name),
            encrypted,
        }),
        None => NameMatch::Unparsable,
    }
}

fn parse_stamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(date, 8) || !digits(time, 6) {
        return None;
    }
    NaiveDateTime::parse_from_str(&format!("{date}{time}"), PARSE_FORMAT).ok()
}
