use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced while writing a bundle. All of them are recoverable per
/// source path; the orchestrator logs, counts and moves on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArchiveError {
    /// The path to archive does not exist (or vanished mid-write).
    #[error("source path does not exist: {}", path.display())]
    SourceMissing { path: PathBuf },
    /// The destination bundle could not be opened for writing.
    #[error("access denied creating {}: {reason}", path.display())]
    DestinationDenied { path: PathBuf, reason: String },
    /// Any other failure while producing the bundle.
    #[error("archive failure: {reason}")]
    Io { reason: String },
}

/// Contract for anything that can turn a source path into a compressed bundle.
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    /// Write a bundle of `source` to `dest`. On error the destination may hold
    /// a partially written file; cleaning it up is the caller's job.
    async fn create_bundle(&self, source: &Path, dest: &Path) -> Result<(), ArchiveError>;
}
