//! On-disk document store used as the fallback copy.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{Document, DocumentRevision, DocumentStore, StoreError};

/// Stores each document as `{dir}/{name}.json`, written atomically via a
/// temp file and rename. Revisions are content hashes; writes are
/// last-writer-wins because the local copy is never authoritative.
#[derive(Debug, Clone)]
pub struct LocalDocumentStore {
    dir: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn revision_for(bytes: &[u8]) -> DocumentRevision {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        DocumentRevision::Tag(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn read(&self, name: &str) -> Result<(Document, DocumentRevision), StoreError> {
        let path = self.document_path(name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Document::new(), DocumentRevision::Absent));
            }
            Err(err) => {
                return Err(StoreError::Transient(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            }
        };
        let document: Document = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Invalid(format!("{}: {err}", path.display())))?;
        Ok((document, Self::revision_for(&bytes)))
    }

    async fn write(
        &self,
        name: &str,
        document: &Document,
        _expected: &DocumentRevision,
        _message: &str,
    ) -> Result<DocumentRevision, StoreError> {
        let path = self.document_path(name);
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;

        fs::create_dir_all(&self.dir).await.map_err(|err| {
            StoreError::Transient(format!("creating {}: {err}", self.dir.display()))
        })?;

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let temp_path = self.dir.join(format!(".{name}.{nonce}.tmp"));

        let mut file = fs::File::create(&temp_path).await.map_err(|err| {
            StoreError::Transient(format!("creating {}: {err}", temp_path.display()))
        })?;
        file.write_all(&bytes).await.map_err(|err| {
            StoreError::Transient(format!("writing {}: {err}", temp_path.display()))
        })?;
        file.flush().await.map_err(|err| {
            StoreError::Transient(format!("flushing {}: {err}", temp_path.display()))
        })?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Transient(format!(
                "renaming {} -> {}: {err}",
                temp_path.display(),
                path.display()
            )));
        }

        Ok(Self::revision_for(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn absent_document_reads_as_empty_mapping() {
        let dir = tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());
        let (document, revision) = store.read("reviewed-marks").await.unwrap();
        assert!(document.is_empty());
        assert!(revision.is_absent());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_with_a_content_revision() {
        let dir = tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());

        let mut document = Document::new();
        document.insert("123-2024-1".into(), json!(true));
        let written = store
            .write("reviewed-marks", &document, &DocumentRevision::Absent, "toggle")
            .await
            .unwrap();

        let (read_back, revision) = store.read("reviewed-marks").await.unwrap();
        assert_eq!(read_back, document);
        assert_eq!(revision, written);
        assert!(!revision.is_absent());
    }

    #[tokio::test]
    async fn revision_tracks_content() {
        let dir = tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());

        let mut document = Document::new();
        document.insert("a".into(), json!(true));
        let first = store
            .write("marks", &document, &DocumentRevision::Absent, "first")
            .await
            .unwrap();

        document.insert("b".into(), json!(false));
        let second = store
            .write("marks", &document, &DocumentRevision::Absent, "second")
            .await
            .unwrap();
        assert_ne!(first, second);

        let same = store
            .write("marks", &document, &DocumentRevision::Absent, "same")
            .await
            .unwrap();
        assert_eq!(second, same);
    }

    #[tokio::test]
    async fn malformed_file_is_reported_as_invalid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marks.json"), b"not json").unwrap();
        let store = LocalDocumentStore::new(dir.path());
        assert!(matches!(
            store.read("marks").await,
            Err(StoreError::Invalid(_))
        ));
    }
}
