// Attachment Vault - Encryption at Rest for Uploaded Files
// =======================================================
// Uploaded attachments are encrypted with AES-256-CBC under a single master
// key. Every file gets its own random IV, which is stored in the file name
// (`<iv hex>-<name>.enc`) rather than in the file body, so a stored file can
// be decrypted from its path alone. Files written before encryption was
// introduced keep their plain names and are served unchanged.
//
// Typical flow:
// - `Encryptor::encrypt_upload` turns a plaintext temp file into ciphertext
//   and returns the `FileRecord` the caller stores in its database;
// - `Decryptor::serve` turns that record back into a plaintext stream plus
//   response headers;
// - `ScratchArea::decrypt` makes temporary plaintext copies for preview.

pub mod config;
pub mod crypto;
pub mod decryptor;
pub mod encryptor;
pub mod error;
pub mod naming;
pub mod permanent;
pub mod record;
pub mod scan;

pub use config::{MasterKey, VaultConfig};
pub use decryptor::{Decryptor, Download, PlaintextStream};
pub use encryptor::Encryptor;
pub use error::{Result, VaultError};
pub use permanent::PermanentStore;
pub use record::{FileRecord, PlaintextUpload};
pub use scan::{PurgeReport, ScanOutput, ScratchArea};
