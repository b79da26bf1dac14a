//! Retention engine: rebuilds each lineage from the file names in the data
//! directory and deletes the oldest bundles beyond the configured limit.
//!
//! Known behavior: a unit whose file is read-only is still dropped from the
//! working set, so the loop ends on the in-memory count and the stale file
//! stays on disk past the limit. Each call attempts deletion once; there is no
//! retry. The `read_only_bundle_survives_past_limit` test pins this down.
//!
//! "Read-only" means the file's own permission bits (`Permissions::readonly`),
//! not an effective-access check for the running user. Root therefore still
//! leaves a read-only bundle alone, and a writable-bit file owned by someone
//! else is attempted; if `remove_file` then fails it lands in `left_in_place`
//! the same way (see `read_only_unit_still_counts_as_processed`).

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

use keepsake_core::bundle::{match_record, ArchiveRecord, NameMatch};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetentionError {
    #[error("unable to list data directory {}: {reason}", path.display())]
    ListDir { path: PathBuf, reason: String },
}

/// What a single `prune` call saw and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Retention units (distinct timestamps) found for the lineage.
    pub units: usize,
    /// Units still counted after pruning.
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    /// Files whose unit was pruned but which could not be removed.
    pub left_in_place: Vec<PathBuf>,
    /// Entries with the lineage suffix but an unreadable timestamp.
    pub unparsable: Vec<PathBuf>,
}

/// Prunes bundles inside one data directory.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    data_dir: PathBuf,
}

impl RetentionManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Records of `lineage`, oldest first (ties broken by file name).
    pub fn records(&self, lineage: &str) -> Result<Vec<ArchiveRecord>, RetentionError> {
        self.scan(lineage).map(|(records, _)| records)
    }

    /// Keep at most `limit` units of `lineage`; `limit == 0` keeps everything.
    pub fn prune(&self, lineage: &str, limit: usize) -> Result<PruneReport, RetentionError> {
        if limit == 0 {
            debug!(lineage, "retention disabled, skipping prune");
            return Ok(PruneReport::default());
        }

        let (records, unparsable) = self.scan(lineage)?;
        let mut units = group_units(records);
        info!("{} existing backups for {lineage}.", units.len());

        let mut report = PruneReport {
            units: units.len(),
            unparsable,
            ..PruneReport::default()
        };

        while units.len() > limit {
            let Some(unit) = units.pop_front() else {
                break;
            };
            for record in unit {
                remove_record(&record.path, &mut report);
            }
        }

        report.kept = units.len();
        Ok(report)
    }

    fn scan(&self, lineage: &str) -> Result<(Vec<ArchiveRecord>, Vec<PathBuf>), RetentionError> {
        let list_err = |reason: String| RetentionError::ListDir {
            path: self.data_dir.clone(),
            reason,
        };
        let entries = fs::read_dir(&self.data_dir).map_err(|e| list_err(e.to_string()))?;

        let mut records = Vec::new();
        let mut unparsable = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| list_err(e.to_string()))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            match match_record(&self.data_dir, name, lineage) {
                NameMatch::Record(record) => {
                    debug!("Found {name} in backup directory.");
                    records.push(record);
                }
                NameMatch::Unparsable => {
                    warn!("Found file in backup directory that does not have a parsable timestamp. {name}");
                    unparsable.push(entry.path());
                }
                NameMatch::Foreign => {}
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.file_name().cmp(&b.file_name()))
        });
        Ok((records, unparsable))
    }
}

/// Plaintext and `.asc` files sharing a timestamp form one unit.
fn group_units(records: Vec<ArchiveRecord>) -> VecDeque<Vec<ArchiveRecord>> {
    let mut units: VecDeque<Vec<ArchiveRecord>> = VecDeque::new();
    for record in records {
        match units.back_mut() {
            Some(unit) if unit[0].created_at == record.created_at => unit.push(record),
            _ => units.push_back(vec![record]),
        }
    }
    units
}

fn remove_record(path: &Path, report: &mut PruneReport) {
    let writable = match fs::metadata(path) {
        Ok(meta) => !meta.permissions().readonly(),
        Err(err) => {
            warn!(path = %path.display(), "unable to stat bundle: {err}");
            report.left_in_place.push(path.to_path_buf());
            return;
        }
    };
    if !writable {
        warn!(path = %path.display(), "bundle is read-only, leaving it in place");
        report.left_in_place.push(path.to_path_buf());
        return;
    }

    info!("Deleting copy {}.", path.display());
    match fs::remove_file(path) {
        Ok(()) => report.deleted.push(path.to_path_buf()),
        Err(err) => {
            warn!(path = %path.display(), "unable to delete bundle: {err}");
            report.left_in_place.push(path.to_path_buf());
        }
    }
}
