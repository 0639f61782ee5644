// Record Module - Attachment Metadata
// =======================================================
// Metadata describing one stored attachment. The record is owned and
// persisted by the caller's document store; the serialized field names match
// the attachment entries of stored form responses.

use crate::crypto::Iv;
use crate::error::{IoResultExt, Result, VaultError};
use crate::naming::{self, ENCRYPTED_SUFFIX};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Name supplied by the uploader, used for download headers.
    #[serde(rename = "originalname")]
    pub original_name: String,
    /// Name of the file on disk.
    #[serde(rename = "filename")]
    pub stored_name: String,
    #[serde(rename = "mimetype")]
    pub mime_type: String,
    /// Plaintext size. Informational only.
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "path")]
    pub storage_path: PathBuf,
    /// Present for encrypted files, absent for legacy plaintext ones.
    #[serde(rename = "iv", default, skip_serializing_if = "Option::is_none")]
    pub iv_hex: Option<String>,
}

impl FileRecord {
    pub fn is_encrypted(&self) -> bool {
        self.iv_hex.is_some()
    }

    /// The IV to decrypt with, or `None` for a legacy record.
    ///
    /// An encrypted record must have a stored name carrying the same IV and a
    /// storage path ending in `.enc`; anything else is rejected rather than
    /// served raw.
    pub fn iv(&self) -> Result<Option<Iv>> {
        let Some(iv_hex) = &self.iv_hex else {
            return Ok(None);
        };
        let iv = Iv::from_hex(iv_hex).ok_or_else(|| {
            VaultError::InvalidRecord(format!("`{iv_hex}` is not a 16-byte lowercase hex IV"))
        })?;
        match naming::parse_encrypted(&self.stored_name) {
            Some(parsed) if parsed.iv == iv => {}
            _ => {
                return Err(VaultError::InvalidRecord(format!(
                    "stored name `{}` does not carry IV {iv_hex}",
                    self.stored_name
                )))
            }
        }
        if !self
            .storage_path
            .to_string_lossy()
            .ends_with(ENCRYPTED_SUFFIX)
        {
            return Err(VaultError::InvalidRecord(format!(
                "encrypted record points at {}, which lacks the {ENCRYPTED_SUFFIX} suffix",
                self.storage_path.display()
            )));
        }
        Ok(Some(iv))
    }

    /// Delete the file backing this record. Called when the owning entity is
    /// deleted or its attachment replaced.
    pub async fn remove_backing_file(&self) -> Result<()> {
        tokio::fs::remove_file(&self.storage_path)
            .await
            .at(&self.storage_path)?;
        info!(path = %self.storage_path.display(), "removed attachment");
        Ok(())
    }
}

/// A finished upload waiting to be encrypted: the plaintext temp file
/// written by the upload handler plus what the client told us about it.
#[derive(Debug, Clone)]
pub struct PlaintextUpload {
    pub temp_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypted_record(iv: &Iv) -> FileRecord {
        let stored_name = naming::encrypted_name(iv, "scan.pdf");
        FileRecord {
            original_name: "scan.pdf".into(),
            storage_path: PathBuf::from("/uploads/system-2/form-7").join(&stored_name),
            stored_name,
            mime_type: "application/pdf".into(),
            size_bytes: 1234,
            iv_hex: Some(iv.to_hex()),
        }
    }

    #[test]
    fn encrypted_record_yields_iv() {
        let iv = Iv::random();
        assert_eq!(encrypted_record(&iv).iv().unwrap(), Some(iv));
    }

    #[test]
    fn legacy_record_has_no_iv() {
        let record = FileRecord {
            iv_hex: None,
            stored_name: "scan.pdf".into(),
            storage_path: "/uploads/scan.pdf".into(),
            ..encrypted_record(&Iv::random())
        };
        assert!(!record.is_encrypted());
        assert_eq!(record.iv().unwrap(), None);
    }

    #[test]
    fn mismatched_iv_is_invalid() {
        let mut record = encrypted_record(&Iv::random());
        record.iv_hex = Some(Iv::random().to_hex());
        assert!(matches!(record.iv(), Err(VaultError::InvalidRecord(_))));

        let mut record = encrypted_record(&Iv::random());
        record.storage_path.set_extension("pdf");
        assert!(matches!(record.iv(), Err(VaultError::InvalidRecord(_))));

        let mut record = encrypted_record(&Iv::random());
        record.iv_hex = Some("not hex".into());
        assert!(matches!(record.iv(), Err(VaultError::InvalidRecord(_))));
    }

    #[test]
    fn serializes_with_document_field_names() {
        let iv = Iv::from_bytes([0; 16]);
        let json = serde_json::to_value(encrypted_record(&iv)).unwrap();
        assert_eq!(json["originalname"], "scan.pdf");
        assert_eq!(json["mimetype"], "application/pdf");
        assert_eq!(json["size"], 1234);
        assert_eq!(json["iv"], "0".repeat(32));
        assert!(json["filename"].as_str().unwrap().ends_with("-scan.pdf.enc"));

        let legacy: FileRecord = serde_json::from_value(serde_json::json!({
            "originalname": "a.txt",
            "filename": "a.txt",
            "mimetype": "text/plain",
            "size": 3,
            "path": "/uploads/a.txt",
        }))
        .unwrap();
        assert_eq!(legacy.iv_hex, None);
    }
}
