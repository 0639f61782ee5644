// Scan Module - Temporary Decrypted Copies
// =======================================================
// Produces short-lived plaintext copies of stored attachments for preview.
// The input is either one stored file or a directory of them (not
// recursive). Encrypted entries are decrypted under their logical name;
// anything else is copied byte for byte. In-progress `.part` files left by
// the encryptor are not stored files and are skipped.
//
// Each call writes into its own freshly created subdirectory of the scratch
// root, so concurrent scans never clobber each other. The scratch root as a
// whole is emptied by `purge`, typically on a timer.

use crate::decryptor::Decryptor;
use crate::encryptor::PART_SUFFIX;
use crate::error::{IoResultExt, Result, VaultError};
use crate::naming;
use rand::{rngs::OsRng, RngCore};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Where the decrypted output of a scan ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutput {
    /// The input was a single file; this is its decrypted copy.
    File(PathBuf),
    /// The input was a directory; this directory holds one copy per entry.
    Directory(PathBuf),
}

impl ScanOutput {
    pub fn path(&self) -> &Path {
        match self {
            ScanOutput::File(path) | ScanOutput::Directory(path) => path,
        }
    }
}

/// Outcome of emptying the scratch root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Scratch directory for one tenant.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scratch area of a system under the uploads root:
    /// `<uploads>/system-<id>/temp`.
    pub fn for_system(uploads_root: &Path, system_id: &str) -> Self {
        Self::new(
            uploads_root
                .join(format!("system-{system_id}"))
                .join("temp"),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decrypt `input` into a new scan directory.
    pub async fn decrypt(&self, decryptor: &Decryptor, input: &Path) -> Result<ScanOutput> {
        self.decrypt_with(decryptor, input, |_| {}).await
    }

    /// Like [`ScratchArea::decrypt`], calling `on_entry` after each file has
    /// been written.
    pub async fn decrypt_with<F>(
        &self,
        decryptor: &Decryptor,
        input: &Path,
        mut on_entry: F,
    ) -> Result<ScanOutput>
    where
        F: FnMut(&Path),
    {
        let metadata = fs::metadata(input).await.at(input)?;
        if !metadata.is_file() && !metadata.is_dir() {
            return Err(VaultError::NotFound(input.to_path_buf()));
        }
        let session = self.new_session_dir().await?;

        let result = if metadata.is_file() {
            let dest = session.join(output_name(input.file_name().unwrap_or_default()));
            decryptor.decrypt_path_to(input, &dest).await.map(|_| {
                on_entry(input);
                ScanOutput::File(dest)
            })
        } else {
            decrypt_entries(decryptor, input, &session, &mut on_entry)
                .await
                .map(|()| ScanOutput::Directory(session.clone()))
        };

        match result {
            Ok(output) => {
                info!(input = %input.display(), output = %output.path().display(), "decrypted to scratch");
                Ok(output)
            }
            Err(err) => {
                // Don't leave a half-populated plaintext view behind.
                if let Err(remove_err) = fs::remove_dir_all(&session).await {
                    warn!(err = %remove_err, path = %session.display(), "failed to remove scan directory");
                }
                Err(err)
            }
        }
    }

    /// Delete everything in the scratch root. Per-entry failures are counted
    /// and logged; a missing root is an empty report.
    pub async fn purge(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(VaultError::io(&self.root, err)),
        };
        while let Some(entry) = entries.next_entry().await.at(&self.root)? {
            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path).await,
                Ok(_) => fs::remove_file(&path).await,
                Err(err) => Err(err),
            };
            match removed {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(%err, path = %path.display(), "failed to delete scratch entry");
                    report.failed += 1;
                }
            }
        }
        info!(
            root = %self.root.display(),
            deleted = report.deleted,
            failed = report.failed,
            "purged scratch area"
        );
        Ok(report)
    }

    /// Run [`ScratchArea::purge`] every `period`, starting one period from
    /// now, until the returned handle is aborted.
    pub fn spawn_periodic_purge(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(err) = self.purge().await {
                    warn!(%err, root = %self.root.display(), "scheduled purge failed");
                }
            }
        })
    }

    async fn new_session_dir(&self) -> Result<PathBuf> {
        let mut token = [0u8; 8];
        OsRng.fill_bytes(&mut token);
        let dir = self.root.join(format!("scan-{}", hex::encode(token)));
        // Start from an empty directory even if the token was seen before.
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(VaultError::io(&dir, err)),
        }
        fs::create_dir_all(&dir).await.at(&dir)?;
        debug!(path = %dir.display(), "created scan directory");
        Ok(dir)
    }
}

/// Count the regular files a scan of `input` would produce.
pub async fn count_entries(input: &Path) -> Result<usize> {
    let metadata = fs::metadata(input).await.at(input)?;
    if !metadata.is_dir() {
        return Ok(usize::from(metadata.is_file()));
    }
    let mut count = 0;
    let mut entries = fs::read_dir(input).await.at(input)?;
    while let Some(entry) = entries.next_entry().await.at(input)? {
        if is_in_progress(&entry.file_name()) {
            continue;
        }
        if fs::metadata(entry.path()).await.at(&entry.path())?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

async fn decrypt_entries<F>(
    decryptor: &Decryptor,
    dir: &Path,
    session: &Path,
    on_entry: &mut F,
) -> Result<()>
where
    F: FnMut(&Path),
{
    let mut written = HashSet::new();
    let mut entries = fs::read_dir(dir).await.at(dir)?;
    while let Some(entry) = entries.next_entry().await.at(dir)? {
        let path = entry.path();
        if is_in_progress(&entry.file_name()) {
            debug!(path = %path.display(), "skipping in-progress file");
            continue;
        }
        if !fs::metadata(&path).await.at(&path)?.is_file() {
            continue;
        }
        // Two uploads of the same document decrypt to the same logical
        // name. The later one keeps its stored name instead.
        let mut name = output_name(&entry.file_name());
        if written.contains(&name) {
            name = entry.file_name();
        }
        if !written.insert(name.clone()) {
            warn!(path = %path.display(), name = ?name, "output name already used in this scan, skipping");
            continue;
        }
        decryptor.decrypt_path_to(&path, &session.join(&name)).await?;
        on_entry(&path);
    }
    Ok(())
}

fn is_in_progress(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|name| name.ends_with(PART_SUFFIX))
}

/// Name of the plaintext copy of a stored file.
fn output_name(stored: &OsStr) -> OsString {
    match stored.to_str().and_then(naming::parse_encrypted) {
        Some(parsed) => parsed.logical_name.into(),
        None => stored.to_os_string(),
    }
}
