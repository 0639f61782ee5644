// Decryptor Module - Streaming Attachments Back Out
// =======================================================
// Two ways in:
// - from a trusted `FileRecord`, which says whether the file is encrypted
//   (`iv` present) or a legacy plaintext file (`iv` absent);
// - from a bare path, where the file name alone decides: names of the form
//   `<iv hex>-<name>.enc` are decrypted, everything else is passed through.
//
// In both cases a spawned task reads the file in chunks and pushes plaintext
// into a bounded channel. The consumer gets the receiving end as a stream.
// When the consumer drops it (e.g. the client hung up), the next send fails
// and the task stops reading. A failure mid-stream is delivered as a final
// `Err` item; bytes already sent are not taken back, so consumers must treat
// an errored stream as a failed transfer.

use crate::config::MasterKey;
use crate::crypto::{CbcDecryptor, Iv};
use crate::error::{IoResultExt, Result, VaultError};
use crate::naming;
use crate::record::FileRecord;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Size of each chunk read from disk.
const CHUNK_LEN: usize = 64 * 1024;

/// Chunks buffered between the reader task and the consumer.
const CHANNEL_CAPACITY: usize = 4;

/// Plaintext chunks of one attachment. Ends early with an `Err` item if
/// reading or decryption fails.
pub type PlaintextStream = ReceiverStream<Result<Bytes>>;

/// Everything needed to answer a download request.
#[derive(Debug)]
pub struct Download {
    pub content_type: String,
    /// `inline; filename="<original name>"`
    pub content_disposition: String,
    pub body: PlaintextStream,
}

#[derive(Debug, Clone)]
pub struct Decryptor {
    key: MasterKey,
}

impl Decryptor {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Open the attachment described by `record`.
    ///
    /// `requested_name` is the file name the caller asked for; it must equal
    /// the record's stored name, otherwise the request is treated as
    /// not-found.
    pub async fn open(&self, record: &FileRecord, requested_name: &str) -> Result<PlaintextStream> {
        if requested_name != record.stored_name {
            debug!(
                requested_name,
                stored_name = %record.stored_name,
                "requested name does not match record"
            );
            return Err(VaultError::NotFound(PathBuf::from(requested_name)));
        }
        let iv = record.iv()?;
        self.open_with(&record.storage_path, iv).await
    }

    /// Open the attachment and attach the response headers the caller needs.
    pub async fn serve(&self, record: &FileRecord, requested_name: &str) -> Result<Download> {
        let body = self.open(record, requested_name).await?;
        Ok(Download {
            content_type: record.mime_type.clone(),
            content_disposition: format!(
                "inline; filename=\"{}\"",
                record.original_name.replace(['"', '\\'], "_")
            ),
            body,
        })
    }

    /// Open a stored file knowing only its path. The IV is taken from the
    /// file name; files without an encrypted name are streamed unchanged.
    pub async fn open_path(&self, path: &Path) -> Result<PlaintextStream> {
        let iv = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(naming::parse_encrypted)
            .map(|parsed| parsed.iv);
        self.open_with(path, iv).await
    }

    /// Decrypt (or copy, for legacy files) `source` into `dest`.
    ///
    /// Returns the number of plaintext bytes written. On failure `dest` is
    /// removed so no truncated output is left behind.
    pub async fn decrypt_path_to(&self, source: &Path, dest: &Path) -> Result<u64> {
        let mut stream = self.open_path(source).await?;
        let file = File::create(dest).await.at(dest)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        let outcome: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                writer.write_all(&chunk).await.at(dest)?;
                written += chunk.len() as u64;
            }
            writer.flush().await.at(dest)
        }
        .await;

        if let Err(err) = outcome {
            drop(writer);
            if let Err(remove_err) = fs::remove_file(dest).await {
                warn!(err = %remove_err, path = %dest.display(), "failed to remove partial output");
            }
            return Err(err);
        }
        Ok(written)
    }

    async fn open_with(&self, path: &Path, iv: Option<Iv>) -> Result<PlaintextStream> {
        let file = File::open(path).await.at(path)?;
        let cipher = iv.map(|iv| CbcDecryptor::new(&self.key, &iv));
        debug!(path = %path.display(), encrypted = cipher.is_some(), "streaming attachment");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let path = path.to_path_buf();
        tokio::spawn(async move {
            if let Err(err) = pump(file, &path, cipher, &tx).await {
                warn!(%err, path = %path.display(), "attachment stream aborted");
                // The receiver may already be gone; nothing left to do then.
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(ReceiverStream::new(rx))
    }
}

/// Read `file` to the end, decrypting if `cipher` is set, and forward chunks
/// to `tx`. Returns early without error if the receiver is dropped.
async fn pump(
    mut file: File,
    path: &Path,
    mut cipher: Option<CbcDecryptor>,
    tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_LEN];
    loop {
        let len = file.read(&mut buf).await.at(path)?;
        if len == 0 {
            break;
        }
        let chunk = match cipher.as_mut() {
            Some(cipher) => cipher.update(&buf[..len]),
            None => buf[..len].to_vec(),
        };
        if !send(tx, chunk).await {
            debug!(path = %path.display(), "consumer went away, stopping");
            return Ok(());
        }
    }
    if let Some(cipher) = cipher {
        let tail = cipher.finalize()?;
        send(tx, tail).await;
    }
    Ok(())
}

/// Returns `false` once the receiver has been dropped.
async fn send(tx: &mpsc::Sender<Result<Bytes>>, chunk: Vec<u8>) -> bool {
    if chunk.is_empty() {
        return !tx.is_closed();
    }
    tx.send(Ok(Bytes::from(chunk))).await.is_ok()
}

/// Drain a plaintext stream into memory, failing on the first error.
pub async fn read_all(mut stream: PlaintextStream) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    while let Some(chunk) = stream.next().await {
        output.extend_from_slice(&chunk?);
    }
    Ok(output)
}
