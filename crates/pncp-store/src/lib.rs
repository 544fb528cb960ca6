//! Versioned key/value document persistence with local-fallback recovery.
//!
//! Documents are flat JSON mappings addressed by a logical name (for
//! example `reviewed-marks`). The remote store is authoritative and only
//! offers optimistic concurrency; the local on-disk copy is best-effort,
//! overwritten by every successful remote read, and never presented as a
//! committed state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod local;
pub mod remote;

pub use local::LocalDocumentStore;
pub use remote::{RemoteDocumentStore, RemoteStoreConfig};

pub const CRATE_NAME: &str = "pncp-store";

/// A persisted document: a flat mapping of string keys to JSON values.
pub type Document = BTreeMap<String, JsonValue>;

/// Opaque version marker handed out by a store and required back on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRevision {
    /// The document did not exist when read.
    Absent,
    Tag(String),
}

impl DocumentRevision {
    pub fn is_absent(&self) -> bool {
        matches!(self, DocumentRevision::Absent)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision is stale; another writer committed meanwhile")]
    Conflict,
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    #[error("stored document is malformed: {0}")]
    Invalid(String),
}

/// One logical document store. An absent document reads as an empty
/// mapping with `DocumentRevision::Absent`, not as an error.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<(Document, DocumentRevision), StoreError>;

    /// Writes the full document, guarded by the revision obtained from the
    /// matching read. A stale revision fails with `Conflict`.
    async fn write(
        &self,
        name: &str,
        document: &Document,
        expected: &DocumentRevision,
        message: &str,
    ) -> Result<DocumentRevision, StoreError>;
}

/// Which store answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Remote,
    LocalFallback,
}

/// Whether a mutation reached the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed(DocumentRevision),
    /// The change lives only in the local copy; not durably committed.
    LocalOnly,
}

/// Remote-first composition of the two store implementations.
///
/// Every mutation goes through `apply`, the read-modify-write protocol:
/// read the latest document and revision, apply the logical change, write
/// with that revision. Conflicts re-read and reapply up to a bounded retry
/// count; exhaustion or a transient failure degrades to the local copy.
pub struct SyncedStore {
    remote: Box<dyn DocumentStore>,
    local: LocalDocumentStore,
    max_conflict_retries: usize,
}

impl SyncedStore {
    pub fn new(remote: Box<dyn DocumentStore>, local: LocalDocumentStore) -> Self {
        Self {
            remote,
            local,
            max_conflict_retries: 3,
        }
    }

    pub async fn read(
        &self,
        name: &str,
    ) -> Result<(Document, DocumentRevision, ReadSource), StoreError> {
        match self.remote.read(name).await {
            Ok((document, revision)) => {
                self.mirror(name, &document, "mirror of remote read").await;
                Ok((document, revision, ReadSource::Remote))
            }
            Err(StoreError::Transient(reason)) => {
                warn!(document = name, %reason, "remote read failed; serving local fallback");
                let (document, revision) = self.local.read(name).await?;
                Ok((document, revision, ReadSource::LocalFallback))
            }
            Err(other) => Err(other),
        }
    }

    /// Applies one logical change through the read-modify-write protocol.
    ///
    /// The closure must be reapplicable: on conflict it runs again over the
    /// re-read document instead of blindly overwriting the remote state.
    pub async fn apply<F>(
        &self,
        name: &str,
        message: &str,
        change: F,
    ) -> Result<WriteOutcome, StoreError>
    where
        F: Fn(&mut Document),
    {
        for attempt in 0..=self.max_conflict_retries {
            let (mut document, revision) = match self.remote.read(name).await {
                Ok(read) => read,
                Err(StoreError::Transient(reason)) => {
                    warn!(document = name, %reason, "remote read failed during mutation");
                    break;
                }
                Err(other) => return Err(other),
            };

            change(&mut document);

            match self.remote.write(name, &document, &revision, message).await {
                Ok(new_revision) => {
                    self.mirror(name, &document, message).await;
                    return Ok(WriteOutcome::Committed(new_revision));
                }
                Err(StoreError::Conflict) if attempt < self.max_conflict_retries => continue,
                Err(StoreError::Conflict) => {
                    warn!(document = name, "conflict retries exhausted; degrading to local copy");
                    break;
                }
                Err(StoreError::Transient(reason)) => {
                    warn!(document = name, %reason, "remote write failed; degrading to local copy");
                    break;
                }
                Err(other) => return Err(other),
            }
        }

        let (mut document, _) = self.local.read(name).await?;
        change(&mut document);
        self.local
            .write(name, &document, &DocumentRevision::Absent, message)
            .await?;
        Ok(WriteOutcome::LocalOnly)
    }

    async fn mirror(&self, name: &str, document: &Document, message: &str) {
        if let Err(err) = self
            .local
            .write(name, document, &DocumentRevision::Absent, message)
            .await
        {
            warn!(document = name, error = %err, "failed to mirror document locally");
        }
    }
}
