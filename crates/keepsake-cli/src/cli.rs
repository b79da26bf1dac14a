use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "keepsake",
    about = "Timestamped, pruned and optionally encrypted backups of local paths",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Optional subcommand; defaults to a backup run when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Settings taken from flags or the environment. Each one wins over the
/// config file. Values stay raw here and are validated in `config::resolve`.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Config file to read instead of the platform default.
    #[arg(long, global = true, env = "KEEPSAKE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Paths to back up, separated by `:`.
    #[arg(long = "path", global = true, env = "KEEPSAKE_PATH", value_name = "PATHS")]
    pub paths: Option<String>,

    /// Directory bundles are written to.
    #[arg(long, global = true, env = "KEEPSAKE_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Bundles to keep per path; 0 keeps everything.
    #[arg(long, global = true, env = "KEEPSAKE_NUMBER_COPIES", value_name = "N")]
    pub copies: Option<String>,

    /// Encrypt bundles (`true`/`1` to enable).
    #[arg(long, global = true, env = "KEEPSAKE_ENCRYPTION_ENABLE", value_name = "BOOL")]
    pub encrypt: Option<String>,

    /// Recipient fingerprints, separated by `,`.
    #[arg(
        long,
        global = true,
        env = "KEEPSAKE_ENCRYPTION_FINGERPRINTS",
        value_name = "FPRS"
    )]
    pub fingerprints: Option<String>,

    /// Directory of public key files used to fill keyring gaps.
    #[arg(
        long,
        global = true,
        env = "KEEPSAKE_ENCRYPTION_PUBLIC_KEY_DIR",
        value_name = "DIR"
    )]
    pub key_dir: Option<PathBuf>,

    /// Delete plaintext bundles after encryption (`true`/`1` to enable).
    #[arg(
        long,
        global = true,
        env = "KEEPSAKE_ENCRYPTION_REMOVE_UNENCRYPTED",
        value_name = "BOOL"
    )]
    pub remove_unencrypted: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Archive every configured path, encrypt and prune.
    Run,
    /// Apply retention to every configured path without archiving.
    Prune,
    /// Show existing bundles per configured path, oldest first.
    List {
        /// Print JSON instead of plain lines.
        #[arg(long)]
        json: bool,
    },
    /// Make sure every recipient key is on the keyring.
    Keys,
    /// Print version and exit.
    Version,
    /// Manage the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a starter config file if one does not exist.
    Init,
}
