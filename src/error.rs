// Error Module - Failure Taxonomy
// =======================================================
// Every operation in the crate reports one of these variants. Callers map
// them to their own responses: configuration errors stop the process,
// storage errors may be retried, decryption errors must not be, and
// not-found becomes a 404.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The master key is missing or malformed. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Disk-level failure while reading or writing a file.
    #[error("storage failure at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Bad padding or truncated ciphertext. Wrong key or tampered file.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A metadata record that contradicts its own stored name or IV.
    #[error("invalid file record: {0}")]
    InvalidRecord(String),
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

impl VaultError {
    /// Classify an I/O error on `path`, keeping missing files distinct from
    /// other storage failures.
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            VaultError::NotFound(path.to_path_buf())
        } else {
            VaultError::Storage {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether the caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Storage { .. })
    }
}

/// Attach a path to an I/O result, as in `fs::read(p).at(p)?`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|err| VaultError::io(path, err))
    }
}
