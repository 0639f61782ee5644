// Encryptor Module - Encrypting Uploads to Disk
// =======================================================
// Reads a plaintext source in chunks, encrypts it with a fresh IV, and
// stores the ciphertext under `<iv hex>-<name>.enc` in the destination
// directory. The IV lives only in the file name; the body is raw ciphertext.
//
// Writes go to a `.part` file that is renamed into place once the data is
// flushed and synced. If anything fails, or the future is dropped halfway,
// the partial file is removed, so a half-written ciphertext is never visible
// under its final name.

use crate::config::MasterKey;
use crate::crypto::{CbcEncryptor, Iv};
use crate::error::{IoResultExt, Result, VaultError};
use crate::naming;
use crate::record::{FileRecord, PlaintextUpload};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Size of each chunk read from the plaintext source.
const BUFFER_SIZE: usize = 64 * 1024;

/// Suffix of in-progress ciphertext files.
pub(crate) const PART_SUFFIX: &str = ".part";

/// Removes the file at `path` when dropped, unless `keep` was called.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial ciphertext"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(%err, path = %self.path.display(), "failed to remove partial ciphertext"),
        }
    }
}

/// Result of writing one ciphertext file.
struct Written {
    stored_name: String,
    path: PathBuf,
    iv: Iv,
    plaintext_len: u64,
}

/// Encrypts attachments with the process-wide master key.
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: MasterKey,
}

impl Encryptor {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Encrypt everything `reader` yields into `dest_dir`.
    ///
    /// The returned record's size is the number of plaintext bytes read.
    pub async fn encrypt_reader<R>(
        &self,
        reader: R,
        dest_dir: &Path,
        original_name: &str,
        mime_type: &str,
    ) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin,
    {
        let written = self.write_encrypted(reader, dest_dir, original_name).await?;
        let size_bytes = written.plaintext_len;
        Ok(record(written, original_name, mime_type, size_bytes))
    }

    /// Encrypt a buffer already held in memory.
    pub async fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        dest_dir: &Path,
        original_name: &str,
        mime_type: &str,
    ) -> Result<FileRecord> {
        self.encrypt_reader(plaintext, dest_dir, original_name, mime_type)
            .await
    }

    /// Encrypt the file at `source`. The source is left in place.
    pub async fn encrypt_file(
        &self,
        source: &Path,
        dest_dir: &Path,
        original_name: &str,
        mime_type: &str,
    ) -> Result<FileRecord> {
        let input = File::open(source).await.at(source)?;
        self.encrypt_reader(input, dest_dir, original_name, mime_type)
            .await
    }

    /// Encrypt a finished upload and delete its plaintext temp file.
    ///
    /// The temp file is removed only after the ciphertext has been synced and
    /// renamed into place. If the removal fails, the new ciphertext is
    /// discarded and the error returned, so no record exists for it.
    pub async fn encrypt_upload(
        &self,
        upload: &PlaintextUpload,
        dest_dir: &Path,
    ) -> Result<FileRecord> {
        let input = File::open(&upload.temp_path)
            .await
            .at(&upload.temp_path)?;
        let written = self
            .write_encrypted(input, dest_dir, &upload.original_name)
            .await?;

        if let Err(err) = fs::remove_file(&upload.temp_path).await {
            warn!(%err, path = %upload.temp_path.display(), "failed to remove plaintext upload");
            if let Err(err) = fs::remove_file(&written.path).await {
                warn!(%err, path = %written.path.display(), "failed to discard ciphertext");
            }
            return Err(VaultError::io(&upload.temp_path, err));
        }
        debug!(path = %upload.temp_path.display(), "removed plaintext upload");

        Ok(record(
            written,
            &upload.original_name,
            &upload.mime_type,
            upload.size_bytes,
        ))
    }

    async fn write_encrypted<R>(
        &self,
        mut reader: R,
        dest_dir: &Path,
        original_name: &str,
    ) -> Result<Written>
    where
        R: AsyncRead + Unpin,
    {
        fs::create_dir_all(dest_dir).await.at(dest_dir)?;

        let iv = Iv::random();
        let stored_name = naming::encrypted_name(&iv, original_name);
        let final_path = dest_dir.join(&stored_name);
        let part_path = dest_dir.join(format!("{stored_name}{PART_SUFFIX}"));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
            .at(&part_path)?;
        let guard = PartialFile::new(part_path.clone());
        let mut writer = BufWriter::new(file);

        let mut cipher = CbcEncryptor::new(&self.key, &iv);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut plaintext_len = 0u64;
        loop {
            // Read errors are reported against the destination; the reader
            // may not be a file at all.
            let bytes = reader.read(&mut buffer).await.at(&part_path)?;
            if bytes == 0 {
                break;
            }
            plaintext_len += bytes as u64;
            writer
                .write_all(&cipher.update(&buffer[..bytes]))
                .await
                .at(&part_path)?;
        }
        writer
            .write_all(&cipher.finalize())
            .await
            .at(&part_path)?;
        writer.flush().await.at(&part_path)?;
        writer.into_inner().sync_all().await.at(&part_path)?;

        fs::rename(&part_path, &final_path)
            .await
            .at(&final_path)?;
        guard.keep();

        info!(
            path = %final_path.display(),
            plaintext_len,
            "stored encrypted attachment"
        );
        Ok(Written {
            stored_name,
            path: final_path,
            iv,
            plaintext_len,
        })
    }
}

fn record(written: Written, original_name: &str, mime_type: &str, size_bytes: u64) -> FileRecord {
    FileRecord {
        original_name: original_name.to_string(),
        stored_name: written.stored_name,
        mime_type: mime_type.to_string(),
        size_bytes,
        storage_path: written.path,
        iv_hex: Some(written.iv.to_hex()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ciphertext_len, decrypt_bytes};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    fn encryptor() -> Encryptor {
        Encryptor::new(MasterKey::new([9; 32]))
    }

    /// Yields some bytes, then fails.
    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk gone")))
            } else {
                self.sent = true;
                buf.put_slice(&[1u8; 100]);
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn writes_ciphertext_under_iv_name() {
        let dir = TempDir::new().unwrap();
        let record = encryptor()
            .encrypt_bytes(b"hello test", dir.path(), "greeting.txt", "text/plain")
            .await
            .unwrap();

        assert_eq!(record.original_name, "greeting.txt");
        assert_eq!(record.mime_type, "text/plain");
        assert_eq!(record.size_bytes, 10);
        assert_eq!(record.storage_path, dir.path().join(&record.stored_name));
        let iv = record.iv().unwrap().unwrap();
        assert!(record.stored_name.starts_with(&iv.to_hex()));

        let body = std::fs::read(&record.storage_path).unwrap();
        assert_eq!(body.len() as u64, ciphertext_len(10));
        assert_eq!(
            decrypt_bytes(&MasterKey::new([9; 32]), &iv, &body).unwrap(),
            b"hello test"
        );
    }

    #[tokio::test]
    async fn creates_missing_destination() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("system-1").join("form-2");
        let record = encryptor()
            .encrypt_bytes(b"", &dest, "empty.bin", "application/octet-stream")
            .await
            .unwrap();
        assert!(record.storage_path.starts_with(&dest));
        assert_eq!(std::fs::metadata(&record.storage_path).unwrap().len(), 16);
    }

    #[tokio::test]
    async fn failed_read_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let err = encryptor()
            .encrypt_reader(FailingReader { sent: false }, dir.path(), "x.bin", "x/y")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Storage { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn encrypt_file_keeps_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("notes.txt");
        let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&source, &contents).unwrap();

        let dest = dir.path().join("stored");
        let record = encryptor()
            .encrypt_file(&source, &dest, "notes.txt", "text/plain")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&source).unwrap(), contents);
        assert_eq!(record.size_bytes, contents.len() as u64);

        let iv = record.iv().unwrap().unwrap();
        let body = std::fs::read(&record.storage_path).unwrap();
        assert_eq!(body.len() as u64, ciphertext_len(contents.len() as u64));
        assert_eq!(
            decrypt_bytes(&MasterKey::new([9; 32]), &iv, &body).unwrap(),
            contents
        );

        let err = encryptor()
            .encrypt_file(&dir.path().join("missing.txt"), &dest, "m.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn upload_plaintext_is_removed() {
        let dir = TempDir::new().unwrap();
        let temp_path = dir.path().join("upload-123");
        std::fs::write(&temp_path, b"attachment body").unwrap();
        let upload = PlaintextUpload {
            temp_path: temp_path.clone(),
            original_name: "Quarterly Report.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 15,
        };

        let dest = dir.path().join("form-1");
        let record = encryptor().encrypt_upload(&upload, &dest).await.unwrap();
        assert!(!temp_path.exists());
        assert!(record.stored_name.ends_with("-Quarterly_Report.pdf.enc"));
        assert_eq!(record.original_name, "Quarterly Report.pdf");
        assert_eq!(record.size_bytes, 15);
        let entries: Vec<_> = std::fs::read_dir(&dest).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn missing_upload_is_not_found() {
        let dir = TempDir::new().unwrap();
        let upload = PlaintextUpload {
            temp_path: dir.path().join("gone"),
            original_name: "a".into(),
            mime_type: "b".into(),
            size_bytes: 0,
        };
        let err = encryptor()
            .encrypt_upload(&upload, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn same_plaintext_gets_fresh_iv() {
        let dir = TempDir::new().unwrap();
        let enc = encryptor();
        let a = enc
            .encrypt_bytes(b"same bytes", dir.path(), "f.txt", "text/plain")
            .await
            .unwrap();
        let b = enc
            .encrypt_bytes(b"same bytes", dir.path(), "f.txt", "text/plain")
            .await
            .unwrap();
        assert_ne!(a.stored_name, b.stored_name);
        assert_ne!(a.iv_hex, b.iv_hex);
        assert_ne!(
            std::fs::read(&a.storage_path).unwrap(),
            std::fs::read(&b.storage_path).unwrap()
        );
    }
}
