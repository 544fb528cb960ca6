//! Remote document store over a contents-style HTTP API.
//!
//! GET by path returns the base64-encoded document plus a revision sha;
//! PUT requires the content, the prior sha and a commit message, and fails
//! with a conflict status when the supplied sha is stale.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Document, DocumentRevision, DocumentStore, StoreError};

pub const DEFAULT_ENDPOINT: &str = "https://api.github.com";

/// Secret-backed configuration, constructed once at startup and injected.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub endpoint: String,
    pub token: String,
    /// `owner/name` repository slug.
    pub repository: String,
    pub branch: String,
    /// Directory inside the repository holding the documents.
    pub base_path: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl RemoteStoreConfig {
    pub fn new(token: String, repository: String, branch: String, base_path: String) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token,
            repository,
            branch,
            base_path,
            user_agent: "pncp-edital-watch/0.1".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

pub struct RemoteDocumentStore {
    client: reqwest::Client,
    config: RemoteStoreConfig,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    content: Option<String>,
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutResponseContent,
}

#[derive(Debug, Deserialize)]
struct PutResponseContent {
    sha: String,
}

fn transient(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Transient(format!("{context}: {err}"))
}

/// Conflict statuses the API uses for a stale revision: 409 (sha mismatch),
/// 412 (precondition) and 422 (create-over-existing).
fn is_conflict(status: StatusCode) -> bool {
    matches!(status.as_u16(), 409 | 412 | 422)
}

pub(crate) fn decode_document(encoded: &str) -> Result<Document, StoreError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| StoreError::Invalid(format!("base64 payload: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| StoreError::Invalid(format!("document payload: {err}")))
}

pub(crate) fn encode_document(document: &Document) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|err| StoreError::Invalid(err.to_string()))?;
    Ok(BASE64.encode(bytes))
}

impl RemoteDocumentStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|err| StoreError::Invalid(format!("token header: {err}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|err| transient("building http client", err))?;
        Ok(Self { client, config })
    }

    fn content_url(&self, name: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}/{name}.json",
            self.config.endpoint.trim_end_matches('/'),
            self.config.repository,
            self.config.base_path.trim_matches('/'),
        )
    }
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
    async fn read(&self, name: &str) -> Result<(Document, DocumentRevision), StoreError> {
        let url = self.content_url(name);
        let resp = self
            .client
            .get(&url)
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await
            .map_err(|err| transient("remote read", err))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok((Document::new(), DocumentRevision::Absent));
        }
        if !status.is_success() {
            return Err(StoreError::Transient(format!(
                "remote read returned {status} for {url}"
            )));
        }

        let body: ContentResponse = resp
            .json()
            .await
            .map_err(|err| transient("decoding read response", err))?;
        let document = match body.content.as_deref() {
            Some(encoded) if !encoded.is_empty() => decode_document(encoded)?,
            _ => Document::new(),
        };
        Ok((document, DocumentRevision::Tag(body.sha)))
    }

    async fn write(
        &self,
        name: &str,
        document: &Document,
        expected: &DocumentRevision,
        message: &str,
    ) -> Result<DocumentRevision, StoreError> {
        let url = self.content_url(name);
        let sha = match expected {
            DocumentRevision::Absent => None,
            DocumentRevision::Tag(tag) => Some(tag.as_str()),
        };
        let request = PutRequest {
            message,
            content: encode_document(document)?,
            branch: &self.config.branch,
            sha,
        };

        let resp = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| transient("remote write", err))?;

        let status = resp.status();
        if is_conflict(status) {
            return Err(StoreError::Conflict);
        }
        if !status.is_success() {
            return Err(StoreError::Transient(format!(
                "remote write returned {status} for {url}"
            )));
        }

        let body: PutResponse = resp
            .json()
            .await
            .map_err(|err| transient("decoding write response", err))?;
        info!(document = name, revision = %body.content.sha, "document committed");
        Ok(DocumentRevision::Tag(body.content.sha))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_url_joins_repository_base_path_and_name() {
        let store = RemoteDocumentStore::new(RemoteStoreConfig::new(
            "token".into(),
            "acme/tenders".into(),
            "main".into(),
            "/state/".into(),
        ))
        .unwrap();
        assert_eq!(
            store.content_url("reviewed-marks"),
            "https://api.github.com/repos/acme/tenders/contents/state/reviewed-marks.json"
        );
    }

    #[test]
    fn document_payload_round_trips_through_base64() {
        let mut document = Document::new();
        document.insert("123-2024-1".into(), json!(true));
        let encoded = encode_document(&document).unwrap();
        assert_eq!(decode_document(&encoded).unwrap(), document);
    }

    #[test]
    fn decode_tolerates_line_wrapped_payloads() {
        let mut document = Document::new();
        document.insert("uid".into(), json!(false));
        let encoded = encode_document(&document).unwrap();
        let wrapped: String = encoded
            .as_bytes()
            .chunks(8)
            .map(|chunk| format!("{}\n", String::from_utf8_lossy(chunk)))
            .collect();
        assert_eq!(decode_document(&wrapped).unwrap(), document);
    }

    #[test]
    fn decode_rejects_non_object_payloads() {
        let encoded = BASE64.encode(b"[1, 2, 3]");
        assert!(matches!(
            decode_document(&encoded),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn conflict_statuses_are_recognized() {
        assert!(is_conflict(StatusCode::CONFLICT));
        assert!(is_conflict(StatusCode::PRECONDITION_FAILED));
        assert!(is_conflict(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_conflict(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_conflict(StatusCode::UNAUTHORIZED));
    }
}
