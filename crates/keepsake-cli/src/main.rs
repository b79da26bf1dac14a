mod backup;
mod cli;
mod config;

use std::collections::BTreeMap;

use crate::cli::{Command, ConfigCommand, Overrides};
use clap::Parser;
use color_eyre::Result;
use keepsake_core::{
    bundle::{lineage_name, ArchiveRecord},
    settings::Settings,
};
use keepsake_crypto::{gpg::GpgProvider, provisioner::KeyProvisioner};
use keepsake_storage::{retention::RetentionManager, tar_writer::TarGzWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point: one invocation, one action. Scheduling is left to cron/systemd.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    match cli.command.clone().unwrap_or(Command::Run) {
        Command::Run => run_backup(&config::settings(&cli.overrides)?).await?,
        Command::Prune => run_prune(&config::settings(&cli.overrides)?)?,
        Command::List { json } => list_bundles(&config::settings(&cli.overrides)?, json)?,
        Command::Keys => check_keys(&config::settings(&cli.overrides)?).await?,
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&cli.overrides)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info so cron mail stays readable.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("keepsake {}", env!("CARGO_PKG_VERSION"));
}

/// gpg adapter for the run, with its keyring home prepared. `None` when
/// encryption is disabled.
fn gpg_for(settings: &Settings) -> Result<Option<GpgProvider>> {
    let Some(encryption) = &settings.encryption else {
        return Ok(None);
    };
    let gpg = GpgProvider::new(settings.keyring_dir())
        .remove_unencrypted(encryption.remove_unencrypted);
    gpg.ensure_home()?;
    Ok(Some(gpg))
}

async fn run_backup(settings: &Settings) -> Result<()> {
    config::prepare_data_dir(settings)?;
    let writer = TarGzWriter::new();
    let gpg = gpg_for(settings)?;

    let mut backup = backup::Backup::new(settings, &writer);
    if let Some(gpg) = &gpg {
        backup = backup.with_encryption(gpg);
    }
    let report = backup.run().await?;
    println!(
        "Created {} bundle(s) with {} error(s).",
        report.bundles.len(),
        report.errors
    );
    Ok(())
}

fn run_prune(settings: &Settings) -> Result<()> {
    config::prepare_data_dir(settings)?;
    let errors = backup::prune_all(settings);
    println!("Prune finished with {errors} error(s).");
    Ok(())
}

fn list_bundles(settings: &Settings, json: bool) -> Result<()> {
    let retention = RetentionManager::new(settings.data_dir.clone());
    let mut lineages: BTreeMap<String, Vec<ArchiveRecord>> = BTreeMap::new();
    for lineage in settings.sources.iter().filter_map(|s| lineage_name(s)) {
        let records = retention.records(&lineage)?;
        lineages.insert(lineage, records);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&lineages)?);
        return Ok(());
    }
    for (lineage, records) in &lineages {
        println!("{lineage} ({} file(s))", records.len());
        for record in records {
            let marker = if record.encrypted { " [encrypted]" } else { "" };
            println!("    {}{marker}", record.file_name());
        }
    }
    Ok(())
}

async fn check_keys(settings: &Settings) -> Result<()> {
    let Some(encryption) = &settings.encryption else {
        println!("Encryption disabled; no keys required.");
        return Ok(());
    };
    config::prepare_data_dir(settings)?;
    let gpg = GpgProvider::new(settings.keyring_dir());
    gpg.ensure_home()?;

    let mut keys = KeyProvisioner::new(encryption.key_dir.clone());
    keys.ensure_ready(&gpg, &encryption.recipients).await?;
    println!(
        "Keyring: ready ({} recipient(s))",
        encryption.recipients.len()
    );
    Ok(())
}

fn init_config(overrides: &Overrides) -> Result<()> {
    let path = match &overrides.config {
        Some(path) => path.clone(),
        None => config::default_path()?,
    };
    let path = config::write_if_missing(&config::FileConfig::starter(), &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
