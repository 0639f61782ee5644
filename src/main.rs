// Attachment Vault CLI
// =======================================================
// Operator tool around the attachment vault: provision a key, encrypt a
// file the way the upload path does, decrypt a stored file, make temporary
// plaintext copies of a stored directory, and purge scratch areas.
//
// The master key is read from --key or the FILE_ENCRYPTION_KEY variable.

use anyhow::{anyhow, Context, Result};
use attachment_vault::{
    config::KEY_ENV_VAR, naming, scan, Decryptor, Encryptor, MasterKey, PlaintextUpload,
    ScratchArea, VaultConfig,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hex-encoded 32-byte master key
    #[arg(long, global = true, env = KEY_ENV_VAR, hide_env_values = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh random master key
    Keygen,

    /// Encrypt a file into a storage directory and print its record as JSON
    Encrypt {
        /// Plaintext file to encrypt
        #[arg(short, long)]
        input: PathBuf,

        /// Directory the ciphertext is written to
        #[arg(short, long)]
        dest: PathBuf,

        /// Name recorded for the file; defaults to the input's file name
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long, default_value = "application/octet-stream")]
        mime_type: String,

        /// Delete the plaintext once the ciphertext is in place
        #[arg(long, default_value = "false")]
        remove_source: bool,
    },

    /// Decrypt a stored file; legacy plaintext files are copied as they are
    Decrypt {
        /// Stored file, named `<iv hex>-<name>.enc` if encrypted
        #[arg(short, long)]
        input: PathBuf,

        /// Output path; defaults to the logical name in the current directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Make temporary plaintext copies of a stored file or directory
    Scan {
        /// Stored file or directory (not recursive)
        #[arg(short, long)]
        input: PathBuf,

        /// Scratch root; each scan gets its own subdirectory
        #[arg(short, long)]
        scratch: PathBuf,
    },

    /// Delete everything in a scratch root
    Purge {
        #[arg(short, long)]
        scratch: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen => {
            println!("{}", MasterKey::generate().to_hex());
        }

        Commands::Encrypt {
            input,
            dest,
            name,
            mime_type,
            remove_source,
        } => {
            let config = load_config(cli.key.as_deref())?;
            let encryptor = Encryptor::new(config.key);
            let original_name = match name {
                Some(name) => name.clone(),
                None => file_name(input)?,
            };

            let record = if *remove_source {
                let size_bytes = tokio::fs::metadata(input)
                    .await
                    .with_context(|| format!("Failed to stat {}", input.display()))?
                    .len();
                let upload = PlaintextUpload {
                    temp_path: input.clone(),
                    original_name,
                    mime_type: mime_type.clone(),
                    size_bytes,
                };
                encryptor.encrypt_upload(&upload, dest).await
            } else {
                encryptor
                    .encrypt_file(input, dest, &original_name, mime_type)
                    .await
            }
            .context("Failed to encrypt file")?;

            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Decrypt { input, output } => {
            let config = load_config(cli.key.as_deref())?;
            let output_path = match output {
                Some(path) => path.clone(),
                None => {
                    let stored = file_name(input)?;
                    let logical = naming::parse_encrypted(&stored)
                        .map(|parsed| parsed.bare_name().to_string())
                        .unwrap_or(stored);
                    PathBuf::from(logical)
                }
            };

            let written = Decryptor::new(config.key)
                .decrypt_path_to(input, &output_path)
                .await
                .context("Failed to decrypt file")?;
            println!(
                "File decrypted successfully: {:?} ({written} bytes)",
                output_path
            );
        }

        Commands::Scan { input, scratch } => {
            let config = load_config(cli.key.as_deref())?;
            let total = scan::count_entries(input)
                .await
                .context("Failed to read input")?;

            let progress = ProgressBar::new(total as u64);
            progress.set_style(ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
            )?);
            let output = ScratchArea::new(scratch)
                .decrypt_with(&Decryptor::new(config.key), input, |path| {
                    progress.set_message(
                        path.file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    );
                    progress.inc(1);
                })
                .await
                .context("Failed to decrypt to scratch")?;
            progress.finish_and_clear();

            println!("Decrypted {} file(s) to {:?}", total, output.path());
        }

        Commands::Purge { scratch } => {
            let report = ScratchArea::new(scratch)
                .purge()
                .await
                .context("Failed to purge scratch area")?;
            println!(
                "Purged {:?}: {} deleted, {} failed",
                scratch, report.deleted, report.failed
            );
        }
    }

    Ok(())
}

/// The key is only required by commands that encrypt or decrypt.
fn load_config(key: Option<&str>) -> Result<VaultConfig> {
    let key = key.ok_or_else(|| anyhow!("no master key: pass --key or set {KEY_ENV_VAR}"))?;
    Ok(VaultConfig::from_hex(key)?)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{:?} has no usable file name", path))
}
