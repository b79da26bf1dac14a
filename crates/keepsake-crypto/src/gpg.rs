use std::{
    collections::BTreeSet,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use async_trait::async_trait;
use keepsake_core::{
    bundle::encrypted_sibling,
    encryption::{EncryptionError, EncryptionProvider},
    settings::RecipientSet,
};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, instrument, warn};

/// `EncryptionProvider` backed by the `gpg` executable and a private keyring home.
#[derive(Debug, Clone)]
pub struct GpgProvider {
    program: PathBuf,
    home: PathBuf,
    remove_unencrypted: bool,
}

impl GpgProvider {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("gpg"),
            home: home.into(),
            remove_unencrypted: false,
        }
    }

    /// Use a specific gpg binary instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Delete the plaintext bundle once its encrypted sibling is written.
    pub fn remove_unencrypted(mut self, remove: bool) -> Self {
        self.remove_unencrypted = remove;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Create the keyring home with owner-only permissions; gpg refuses to use
    /// a group/world readable home without warnings.
    pub fn ensure_home(&self) -> Result<(), EncryptionError> {
        fs::create_dir_all(&self.home).map_err(keyring_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.home, fs::Permissions::from_mode(0o700))
                .map_err(keyring_err)?;
        }
        Ok(())
    }

    async fn exec<I, S>(&self, args: I, stdin: Option<&[u8]>) -> Result<Output, EncryptionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--homedir")
            .arg(&self.home)
            .args(["--batch", "--no-tty"])
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Executing: {:?}", cmd.as_std());

        let mut child = cmd.spawn().map_err(|e| EncryptionError::Keyring {
            reason: format!("failed to spawn {}: {e}", self.program.display()),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(keyring_err)?;
        }

        child.wait_with_output().await.map_err(keyring_err)
    }
}

#[async_trait]
impl EncryptionProvider for GpgProvider {
    fn name(&self) -> &'static str {
        "gpg"
    }

    #[instrument(skip_all)]
    async fn list_imported_fingerprints(&self) -> Result<BTreeSet<String>, EncryptionError> {
        let output = self.exec(["--with-colons", "--list-keys"], None).await?;
        if !output.status.success() {
            return Err(EncryptionError::Keyring {
                reason: stderr_of(&output),
            });
        }
        let found = primary_fingerprints(&String::from_utf8_lossy(&output.stdout));
        debug!(?found, "keyring fingerprints");
        Ok(found)
    }

    #[instrument(skip_all)]
    async fn inspect_key(&self, material: &[u8]) -> Result<BTreeSet<String>, EncryptionError> {
        let output = self
            .exec(["--with-colons", "--show-keys"], Some(material))
            .await?;
        let found = primary_fingerprints(&String::from_utf8_lossy(&output.stdout));
        if !output.status.success() || found.is_empty() {
            return Err(EncryptionError::InvalidKey {
                reason: stderr_of(&output),
            });
        }
        debug!(?found, "key read");
        Ok(found)
    }

    #[instrument(skip_all)]
    async fn import_key(&self, material: &[u8]) -> Result<(), EncryptionError> {
        let output = self.exec(["--import"], Some(material)).await?;
        if !output.status.success() {
            return Err(EncryptionError::Import {
                reason: stderr_of(&output),
            });
        }
        info!("gpg import ok: {}", stderr_of(&output));
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    async fn encrypt_file(
        &self,
        path: &Path,
        recipients: &RecipientSet,
    ) -> Result<PathBuf, EncryptionError> {
        let output_path = encrypted_sibling(path);
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("--yes"),
            OsStr::new("--trust-model"),
            OsStr::new("always"),
            OsStr::new("--compress-level"),
            OsStr::new("1"),
            OsStr::new("--cipher-algo"),
            OsStr::new("AES256"),
            OsStr::new("--output"),
            output_path.as_os_str(),
        ];
        for recipient in recipients.iter() {
            args.push(OsStr::new("--recipient"));
            args.push(OsStr::new(recipient));
        }
        args.push(OsStr::new("--encrypt"));
        args.push(path.as_os_str());

        let output = self.exec(args, None).await?;
        if !output.status.success() {
            return Err(EncryptionError::Encrypt {
                path: path.to_path_buf(),
                reason: stderr_of(&output),
            });
        }
        info!("encryption successful: {}", output_path.display());

        if self.remove_unencrypted {
            debug!("removing unencrypted file {}", path.display());
            if let Err(err) = fs::remove_file(path) {
                warn!("unable to remove unencrypted file {}: {err}", path.display());
            }
        }
        Ok(output_path)
    }
}

/// Fingerprints of primary keys in `gpg --with-colons` output. Subkey
/// fingerprints are skipped: recipients are addressed by primary key.
pub fn primary_fingerprints(colons: &str) -> BTreeSet<String> {
    let mut after_primary = false;
    let mut found = BTreeSet::new();
    for line in colons.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") | Some("sec") => after_primary = true,
            Some("fpr") if after_primary => {
                if let Some(fp) = fields.get(9).and_then(|fp| RecipientSet::normalize(fp)) {
                    found.insert(fp);
                }
                after_primary = false;
            }
            _ => after_primary = false,
        }
    }
    found
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn keyring_err<E: ToString>(err: E) -> EncryptionError {
    EncryptionError::Keyring {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = "\
tru::1:1700000000:0:3:1:5
pub:u:255:22:AAAA1111BBBB2222:1700000000:::u:::scESC::::::ed25519:::0:
fpr:::::::::0123456789ABCDEF0123456789ABCDEF01234567:
uid:u::::1700000000::HASH::Ops Team <ops@example.com>::::::::::0:
sub:u:255:18:CCCC3333DDDD4444:1700000000::::::e::::::cv25519::
fpr:::::::::FEDCBA9876543210FEDCBA9876543210FEDCBA98:
pub:-:3072:1:EEEE5555FFFF6666:1690000000:::-:::scESC::::::::0:
fpr:::::::::1111222233334444555566667777888899990000:
";

    #[test]
    fn parses_primary_fingerprints_only() {
        let found = primary_fingerprints(LIST_OUTPUT);
        assert_eq!(
            found.into_iter().collect::<Vec<_>>(),
            vec![
                "0123456789ABCDEF0123456789ABCDEF01234567",
                "1111222233334444555566667777888899990000",
            ]
        );
    }

    #[test]
    fn empty_output_has_no_fingerprints() {
        assert!(primary_fingerprints("").is_empty());
        assert!(primary_fingerprints("gpg: keybox created\n").is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_keyring_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = GpgProvider::new(dir.path().join("keyring"))
            .with_program(dir.path().join("no-such-gpg"));
        let err = provider
            .list_imported_fingerprints()
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, EncryptionError::Keyring { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn home_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let provider = GpgProvider::new(dir.path().join("keyring"));
        provider.ensure_home().expect("create home");
        let mode = fs::metadata(provider.home())
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    /// Stand-in gpg that records its argv next to itself and, when `exit` is 0,
    /// writes the file named by `--output`.
    #[cfg(unix)]
    fn fake_gpg(dir: &Path, exit: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("gpg");
        let body = format!(
            r#"#!/bin/sh
printf '%s\n' "$@" > "$(dirname "$0")/argv"
if [ {exit} -ne 0 ]; then
  echo "gpg: encryption failed" >&2
  exit {exit}
fi
prev=""
for arg in "$@"; do
  [ "$prev" = "--output" ] && printf 'ciphertext' > "$arg"
  prev="$arg"
done
exit 0
"#
        );
        fs::write(&script, body).expect("write fake gpg");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod fake gpg");
        script
    }

    #[cfg(unix)]
    fn recorded_argv(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("argv"))
            .expect("read argv")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encrypt_passes_every_recipient_and_removes_plaintext() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("20240101-000000-etc.tar.gz");
        fs::write(&input, b"plain-bundle").expect("write input");

        let provider = GpgProvider::new(dir.path().join("keyring"))
            .with_program(fake_gpg(dir.path(), 0))
            .remove_unencrypted(true);
        let output = provider
            .encrypt_file(&input, &RecipientSet::parse("aaaa1111,bbbb2222"))
            .await
            .expect("encrypt should succeed");

        assert_eq!(output, encrypted_sibling(&input));
        let argv = recorded_argv(dir.path());
        let recipients: Vec<&str> = argv
            .windows(2)
            .filter(|w| w[0] == "--recipient")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(recipients, vec!["AAAA1111", "BBBB2222"]);

        let out_at = argv
            .iter()
            .position(|a| a == "--output")
            .expect("--output passed");
        assert_eq!(argv[out_at + 1], output.to_string_lossy());
        assert_eq!(argv.last(), Some(&input.to_string_lossy().into_owned()));

        assert_eq!(fs::read(&output).expect("read ciphertext"), b"ciphertext");
        assert!(!input.exists(), "plaintext should be removed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encrypt_keeps_plaintext_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("20240101-000000-etc.tar.gz");
        fs::write(&input, b"plain-bundle").expect("write input");

        let provider =
            GpgProvider::new(dir.path().join("keyring")).with_program(fake_gpg(dir.path(), 0));
        let output = provider
            .encrypt_file(&input, &RecipientSet::parse("aaaa1111"))
            .await
            .expect("encrypt should succeed");

        assert!(output.exists());
        assert!(input.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_encryption_keeps_plaintext() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("20240101-000000-etc.tar.gz");
        fs::write(&input, b"plain-bundle").expect("write input");

        let provider = GpgProvider::new(dir.path().join("keyring"))
            .with_program(fake_gpg(dir.path(), 2))
            .remove_unencrypted(true);
        let err = provider
            .encrypt_file(&input, &RecipientSet::parse("aaaa1111"))
            .await
            .expect_err("non-zero exit must fail");

        match err {
            EncryptionError::Encrypt { path, reason } => {
                assert_eq!(path, input);
                assert!(reason.contains("encryption failed"), "{reason}");
            }
            other => panic!("expected Encrypt error, got {other:?}"),
        }
        assert!(input.exists());
        assert!(!encrypted_sibling(&input).exists());
    }
}
