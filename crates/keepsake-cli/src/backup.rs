use std::{
    collections::BTreeSet,
    fs,
    io::ErrorKind,
    path::Path,
};

use chrono::{DateTime, Utc};
use keepsake_core::{
    archive::{ArchiveError, ArchiveWriter},
    bundle::{lineage_name, Bundle, STAMP_FORMAT},
    encryption::EncryptionProvider,
    settings::Settings,
};
use keepsake_crypto::provisioner::{KeyProvisioner, ProvisionError};
use keepsake_storage::retention::RetentionManager;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that abort a whole run. Per-path problems never surface here; they
/// are logged and counted in `RunReport::errors`.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("encryption is enabled but no encryption provider is attached")]
    ProviderMissing,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub bundles: Vec<Bundle>,
    pub errors: usize,
}

/// Sequences archive -> encrypt -> prune for every configured source path.
pub struct Backup<'a> {
    settings: &'a Settings,
    writer: &'a dyn ArchiveWriter,
    encryptor: Option<&'a dyn EncryptionProvider>,
    keys: KeyProvisioner,
    retention: RetentionManager,
}

impl<'a> Backup<'a> {
    pub fn new(settings: &'a Settings, writer: &'a dyn ArchiveWriter) -> Self {
        let key_dir = settings.encryption.as_ref().and_then(|e| e.key_dir.clone());
        Self {
            settings,
            writer,
            encryptor: None,
            keys: KeyProvisioner::new(key_dir),
            retention: RetentionManager::new(settings.data_dir.clone()),
        }
    }

    pub fn with_encryption(mut self, provider: &'a dyn EncryptionProvider) -> Self {
        self.encryptor = Some(provider);
        self
    }

    pub async fn run(&mut self) -> Result<RunReport, BackupError> {
        self.run_at(Utc::now()).await
    }

    /// One run where every bundle carries the `started` timestamp.
    pub async fn run_at(&mut self, started: DateTime<Utc>) -> Result<RunReport, BackupError> {
        let settings = self.settings;
        info!("Started backups at {}", started.format(STAMP_FORMAT));
        if settings.encryption.is_some() && self.encryptor.is_none() {
            return Err(BackupError::ProviderMissing);
        }

        let mut report = RunReport::default();
        let mut seen = BTreeSet::new();
        for source in &settings.sources {
            debug!("Current path: {}", source.display());
            let Some(lineage) = lineage_name(source) else {
                error!("Unable to derive a bundle name from {}", source.display());
                report.errors += 1;
                continue;
            };
            if !seen.insert(lineage.clone()) {
                error!(
                    "{} shares the name {lineage:?} with an earlier path in this run, skipping",
                    source.display()
                );
                report.errors += 1;
                continue;
            }

            let mut bundle = Bundle::new(&settings.data_dir, lineage, started);
            if let Err(err) = self.writer.create_bundle(source, &bundle.path).await {
                report.errors += 1;
                match err {
                    ArchiveError::DestinationDenied { .. } => {
                        error!("Access was denied while creating bundle. {err}");
                    }
                    _ => {
                        error!("Unable to add {} to bundle. Reason: {err}", source.display());
                        discard_partial(&bundle.path);
                    }
                }
                continue;
            }
            info!(
                "Successfully created bundle for {}. {}",
                source.display(),
                bundle.path.display()
            );

            if let Some(encryption) = &settings.encryption {
                let provider = self.encryptor.ok_or(BackupError::ProviderMissing)?;
                self.keys
                    .ensure_ready(provider, &encryption.recipients)
                    .await?;
                match provider
                    .encrypt_file(&bundle.path, &encryption.recipients)
                    .await
                {
                    Ok(path) => bundle = bundle.into_encrypted(path),
                    Err(err) => {
                        error!("encryption failed. reason: {err}");
                        report.errors += 1;
                    }
                }
            }

            if settings.retention_enabled() {
                match self.retention.prune(&bundle.lineage, settings.retention) {
                    Ok(pruned) => debug!(
                        lineage = %bundle.lineage,
                        deleted = pruned.deleted.len(),
                        kept = pruned.kept,
                        "retention applied"
                    ),
                    Err(err) => {
                        warn!("retention failed for {}: {err}", bundle.lineage);
                        report.errors += 1;
                    }
                }
            }

            report.bundles.push(bundle);
        }

        info!("Backup completed with {} errors.", report.errors);
        Ok(report)
    }
}

/// Apply retention to every configured lineage. Returns the number of lineages
/// that could not be pruned.
pub fn prune_all(settings: &Settings) -> usize {
    if !settings.retention_enabled() {
        info!("retention disabled (copies = 0), nothing to prune");
        return 0;
    }
    let retention = RetentionManager::new(settings.data_dir.clone());
    let mut errors = 0;
    for lineage in settings.sources.iter().filter_map(|s| lineage_name(s)) {
        match retention.prune(&lineage, settings.retention) {
            Ok(report) => info!(
                "{lineage}: kept {}, deleted {}, left in place {}",
                report.kept,
                report.deleted.len(),
                report.left_in_place.len()
            ),
            Err(err) => {
                warn!("retention failed for {lineage}: {err}");
                errors += 1;
            }
        }
    }
    errors
}

fn discard_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed partial bundle {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("unable to remove partial bundle {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use keepsake_core::{
        bundle::encrypted_sibling,
        encryption::InMemoryKeyring,
        settings::{EncryptionSettings, RecipientSet},
    };
    use keepsake_storage::tar_writer::TarGzWriter;

    use super::*;

    struct DeniedWriter;

    #[async_trait]
    impl ArchiveWriter for DeniedWriter {
        async fn create_bundle(&self, _source: &Path, dest: &Path) -> Result<(), ArchiveError> {
            Err(ArchiveError::DestinationDenied {
                path: dest.to_path_buf(),
                reason: "read-only filesystem".into(),
            })
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        data_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().expect("tempdir");
            let data_dir = root.path().join("data");
            fs::create_dir_all(&data_dir).expect("data dir");
            Self { root, data_dir }
        }

        fn source(&self, name: &str) -> PathBuf {
            let path = self.root.path().join("src").join(name);
            fs::create_dir_all(&path).expect("source dir");
            fs::write(path.join("file.txt"), name).expect("source file");
            path
        }

        fn missing(&self, name: &str) -> PathBuf {
            self.root.path().join("src").join(name)
        }

        fn key_dir(&self) -> PathBuf {
            let dir = self.root.path().join("keys");
            fs::create_dir_all(&dir).expect("key dir");
            dir
        }

        fn settings(&self, sources: Vec<PathBuf>, retention: usize) -> Settings {
            Settings {
                data_dir: self.data_dir.clone(),
                sources,
                retention,
                encryption: None,
            }
        }

        fn data_files(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(&self.data_dir)
                .expect("read_dir")
                .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    fn encrypted(settings: Settings, recipients: &str, key_dir: Option<PathBuf>) -> Settings {
        Settings {
            encryption: Some(EncryptionSettings {
                recipients: RecipientSet::parse(recipients),
                key_dir,
                remove_unencrypted: false,
            }),
            ..settings
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_source_is_isolated() {
        let fx = Fixture::new();
        let settings = fx.settings(vec![fx.missing("missing"), fx.source("etc")], 0);
        let writer = TarGzWriter::new();

        let report = Backup::new(&settings, &writer)
            .run_at(at(1))
            .await
            .expect("run should succeed");

        assert_eq!(report.errors, 1);
        assert_eq!(report.bundles.len(), 1);
        assert_eq!(fx.data_files(), vec!["20240201-120000-etc.tar.gz"]);
    }

    #[tokio::test]
    async fn denied_destination_is_counted() {
        let fx = Fixture::new();
        let settings = fx.settings(vec![fx.source("etc"), fx.source("var")], 0);

        let report = Backup::new(&settings, &DeniedWriter)
            .run_at(at(1))
            .await
            .expect("run should succeed");

        assert_eq!(report.errors, 2);
        assert!(report.bundles.is_empty());
    }

    #[tokio::test]
    async fn encrypts_each_bundle() {
        let fx = Fixture::new();
        let settings = encrypted(
            fx.settings(vec![fx.source("etc"), fx.source("var")], 0),
            "AAAA",
            None,
        );
        let writer = TarGzWriter::new();
        let keyring = InMemoryKeyring::with_keys(["AAAA"]);

        let report = Backup::new(&settings, &writer)
            .with_encryption(&keyring)
            .run_at(at(1))
            .await
            .expect("run should succeed");

        assert_eq!(report.errors, 0);
        assert!(report.bundles.iter().all(|b| b.encrypted));
        assert_eq!(
            fx.data_files(),
            vec![
                "20240201-120000-etc.tar.gz",
                "20240201-120000-etc.tar.gz.asc",
                "20240201-120000-var.tar.gz",
                "20240201-120000-var.tar.gz.asc",
            ]
        );
        assert_eq!(keyring.list_calls(), 1, "readiness is checked once per run");
    }

    #[tokio::test]
    async fn provisions_keys_before_first_encryption() {
        let fx = Fixture::new();
        let key_dir = fx.key_dir();
        fs::write(key_dir.join("b.asc"), InMemoryKeyring::key_material(["BBBB"]))
            .expect("key file");
        let settings = encrypted(
            fx.settings(vec![fx.source("etc")], 0),
            "AAAA,BBBB",
            Some(key_dir),
        );
        let writer = TarGzWriter::new();
        let keyring = InMemoryKeyring::with_keys(["AAAA"]);

        let report = Backup::new(&settings, &writer)
            .with_encryption(&keyring)
            .run_at(at(1))
            .await
            .expect("run should succeed");

        assert_eq!(report.errors, 0);
        assert!(keyring.fingerprints().contains("BBBB"));
    }

    #[tokio::test]
    async fn unresolved_recipients_abort_the_run() {
        let fx = Fixture::new();
        let settings = encrypted(
            fx.settings(vec![fx.source("etc"), fx.source("var")], 0),
            "AAAA,BBBB",
            Some(fx.key_dir()),
        );
        let writer = TarGzWriter::new();
        let keyring = InMemoryKeyring::new();

        let err = Backup::new(&settings, &writer)
            .with_encryption(&keyring)
            .run_at(at(1))
            .await
            .expect_err("empty key dir must abort");

        assert!(matches!(
            err,
            BackupError::Provision(ProvisionError::KeyDirEmpty { .. })
        ));
        // The first bundle was written before the gate; nothing after it.
        assert_eq!(fx.data_files(), vec!["20240201-120000-etc.tar.gz"]);
    }

    #[tokio::test]
    async fn encryption_failure_keeps_going() {
        let fx = Fixture::new();
        let settings = encrypted(
            fx.settings(vec![fx.source("etc"), fx.source("var")], 0),
            "AAAA",
            None,
        );
        let writer = TarGzWriter::new();
        let keyring = InMemoryKeyring::with_keys(["AAAA"]);
        keyring.fail_encryption(true);

        let report = Backup::new(&settings, &writer)
            .with_encryption(&keyring)
            .run_at(at(1))
            .await
            .expect("run should succeed");

        assert_eq!(report.errors, 2);
        assert_eq!(report.bundles.len(), 2);
        assert!(report.bundles.iter().all(|b| !b.encrypted));
        assert!(!encrypted_sibling(&report.bundles[0].path).exists());
    }

    #[tokio::test]
    async fn missing_provider_fails_closed() {
        let fx = Fixture::new();
        let settings = encrypted(fx.settings(vec![fx.source("etc")], 0), "AAAA", None);
        let writer = TarGzWriter::new();

        let err = Backup::new(&settings, &writer)
            .run_at(at(1))
            .await
            .expect_err("no provider");
        assert!(matches!(err, BackupError::ProviderMissing));
        assert!(fx.data_files().is_empty());
    }

    #[tokio::test]
    async fn prunes_after_each_bundle() {
        let fx = Fixture::new();
        let settings = fx.settings(vec![fx.source("etc")], 2);
        let writer = TarGzWriter::new();

        for day in 1..=4 {
            Backup::new(&settings, &writer)
                .run_at(at(day))
                .await
                .expect("run should succeed");
        }

        assert_eq!(
            fx.data_files(),
            vec!["20240203-120000-etc.tar.gz", "20240204-120000-etc.tar.gz"]
        );
    }

    #[tokio::test]
    async fn duplicate_lineage_is_skipped() {
        let fx = Fixture::new();
        let first = fx.source("a/etc");
        let second = fx.source("b/etc");
        let settings = fx.settings(vec![first, second], 0);
        let writer = TarGzWriter::new();

        let report = Backup::new(&settings, &writer)
            .run_at(at(1))
            .await
            .expect("run should succeed");

        assert_eq!(report.errors, 1);
        assert_eq!(report.bundles.len(), 1);
    }

    #[test]
    fn prune_all_covers_every_lineage() {
        let fx = Fixture::new();
        for day in 1..=3 {
            for lineage in ["etc", "var"] {
                fs::write(fx.data_dir.join(format!("2024010{day}-000000-{lineage}.tar.gz")), b"x")
                    .expect("bundle");
            }
        }
        let settings = fx.settings(vec![fx.missing("etc"), fx.missing("var")], 1);

        assert_eq!(prune_all(&settings), 0);
        assert_eq!(
            fx.data_files(),
            vec!["20240103-000000-etc.tar.gz", "20240103-000000-var.tar.gz"]
        );
    }
}
