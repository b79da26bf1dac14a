use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use keepsake_core::archive::{ArchiveError, ArchiveWriter};
use tar::Builder;
use tracing::{debug, instrument};

/// Writes `.tar.gz` bundles. Entries are stored under the source path with its
/// root stripped (`/etc/hosts` becomes `etc/hosts`); symlinks are stored as links.
#[derive(Debug, Clone)]
pub struct TarGzWriter {
    level: Compression,
}

impl TarGzWriter {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Gzip level 0-9.
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for TarGzWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveWriter for TarGzWriter {
    #[instrument(skip_all, fields(source = %source.display()))]
    async fn create_bundle(&self, source: &Path, dest: &Path) -> Result<(), ArchiveError> {
        let file = File::create(dest).map_err(|err| match err.kind() {
            ErrorKind::PermissionDenied => ArchiveError::DestinationDenied {
                path: dest.to_path_buf(),
                reason: err.to_string(),
            },
            _ => io_err(err),
        })?;

        let mut builder = Builder::new(GzEncoder::new(file, self.level));
        builder.follow_symlinks(false);

        let metadata = fs::symlink_metadata(source).map_err(|err| source_err(source, err))?;
        let name = entry_name(source);
        debug!(entry = %name.display(), dir = metadata.is_dir(), "adding to bundle");
        let appended = if metadata.is_dir() {
            builder.append_dir_all(&name, source)
        } else {
            builder.append_path_with_name(source, &name)
        };
        appended.map_err(|err| source_err(source, err))?;

        let mut file = builder
            .into_inner()
            .and_then(GzEncoder::finish)
            .map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(())
    }
}

fn entry_name(source: &Path) -> PathBuf {
    let name: PathBuf = source
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if name.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        name
    }
}

fn source_err(source: &Path, err: io::Error) -> ArchiveError {
    if err.kind() == ErrorKind::NotFound {
        ArchiveError::SourceMissing {
            path: source.to_path_buf(),
        }
    } else {
        io_err(err)
    }
}

fn io_err(err: io::Error) -> ArchiveError {
    ArchiveError::Io {
        reason: err.to_string(),
    }
}
