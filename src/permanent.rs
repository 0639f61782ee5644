// Permanent Module - Long-Lived Documents
// =======================================================
// Per-system store of documents uploaded by administrators. Files are
// encrypted like any attachment, with a millisecond timestamp added in front
// of the name to keep repeated uploads of the same document apart:
// `<iv hex>-<millis>-<name>.enc`.

use crate::encryptor::Encryptor;
use crate::error::{IoResultExt, Result, VaultError};
use crate::record::FileRecord;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PermanentStore {
    dir: PathBuf,
    encryptor: Encryptor,
}

impl PermanentStore {
    pub fn new(dir: impl Into<PathBuf>, encryptor: Encryptor) -> Self {
        Self {
            dir: dir.into(),
            encryptor,
        }
    }

    /// `<uploads>/system-<id>/perm`
    pub fn for_system(uploads_root: &Path, system_id: &str, encryptor: Encryptor) -> Self {
        Self::new(
            uploads_root
                .join(format!("system-{system_id}"))
                .join("perm"),
            encryptor,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(
        &self,
        contents: &[u8],
        original_name: &str,
        mime_type: &str,
    ) -> Result<FileRecord> {
        let unique_name = format!("{}-{original_name}", Utc::now().timestamp_millis());
        let mut record = self
            .encryptor
            .encrypt_bytes(contents, &self.dir, &unique_name, mime_type)
            .await?;
        record.original_name = original_name.to_string();
        Ok(record)
    }

    /// Names of stored PDF documents, encrypted or not, sorted.
    pub async fn list_documents(&self) -> Result<Vec<String>> {
        fs::create_dir_all(&self.dir).await.at(&self.dir)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.at(&self.dir)?;
        while let Some(entry) = entries.next_entry().await.at(&self.dir)? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".pdf") || name.ends_with(".pdf.enc") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a stored document by its on-disk name.
    pub async fn remove(&self, stored_name: &str) -> Result<()> {
        if stored_name.is_empty()
            || stored_name.contains(['/', '\\'])
            || stored_name == "."
            || stored_name == ".."
        {
            return Err(VaultError::InvalidRecord(format!(
                "`{stored_name}` is not a plain file name"
            )));
        }
        let path = self.dir.join(stored_name);
        fs::remove_file(&path).await.at(&path)?;
        info!(path = %path.display(), "removed permanent file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterKey;
    use crate::decryptor::{read_all, Decryptor};
    use crate::naming;
    use tempfile::TempDir;

    fn store(root: &Path) -> PermanentStore {
        PermanentStore::for_system(root, "2", Encryptor::new(MasterKey::new([6; 32])))
    }

    #[tokio::test]
    async fn save_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        assert_eq!(store.dir(), dir.path().join("system-2").join("perm"));

        let record = store
            .save(b"%PDF-1.7 ...", "Site Plan.pdf", "application/pdf")
            .await
            .unwrap();
        assert_eq!(record.original_name, "Site Plan.pdf");
        let parsed = naming::parse_encrypted(&record.stored_name).unwrap();
        let (millis, rest) = parsed.bare_name().split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(rest, "Site_Plan.pdf");

        let stream = Decryptor::new(MasterKey::new([6; 32]))
            .open(&record, &record.stored_name)
            .await
            .unwrap();
        assert_eq!(read_all(stream).await.unwrap(), b"%PDF-1.7 ...");
    }

    #[tokio::test]
    async fn lists_pdf_documents_only() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        assert!(store.list_documents().await.unwrap().is_empty());

        let record = store.save(b"a", "a.pdf", "application/pdf").await.unwrap();
        std::fs::write(store.dir().join("legacy.pdf"), b"b").unwrap();
        std::fs::write(store.dir().join("notes.txt"), b"c").unwrap();

        let mut expected = vec![record.stored_name.clone(), "legacy.pdf".to_string()];
        expected.sort();
        assert_eq!(store.list_documents().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn remove_checks_names() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        let record = store.save(b"a", "a.pdf", "application/pdf").await.unwrap();

        assert!(matches!(
            store.remove("../perm/x").await,
            Err(VaultError::InvalidRecord(_))
        ));
        store.remove(&record.stored_name).await.unwrap();
        assert!(!record.storage_path.exists());
        assert!(matches!(
            store.remove(&record.stored_name).await,
            Err(VaultError::NotFound(_))
        ));
    }
}
