//! Model endpoint clients and the LLM file store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{Error, Result};

use super::types::{GenerateRequest, GenerateResponse};

/// Chat-completion client over a Gemini-format endpoint.
///
/// Both the text and vision endpoints implement this trait; vision requests
/// simply carry image parts in their contents.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;
}

/// Configuration for endpoint clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

pub(crate) fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Google Gemini client.
pub struct GeminiClient {
    config: ClientConfig,
    http: Client,
}

impl GeminiClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[allow(dead_code)]
    status: Option<String>,
}

#[async_trait]
impl ChatClient for GeminiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url(),
            request.model,
            self.config.api_key
        );

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::http(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
                return Err(Error::llm_api("gemini", error.error.message));
            }
            return Err(Error::llm_api("gemini", format!("{status}: {body}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("failed to parse response: {e}")))
    }
}

/// Handle to a file uploaded to the model file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub uri: String,
}

/// The model provider's file store, used for single-image analysis.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<StoredFile>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Gemini file-store client (simple raw upload).
pub struct GeminiFileStore {
    config: ClientConfig,
    http: Client,
}

impl GeminiFileStore {
    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(GeminiClient::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    name: String,
    uri: String,
}

#[async_trait]
impl FileStore for GeminiFileStore {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<StoredFile> {
        let url = format!(
            "{}/upload/v1beta/files?key={}",
            self.base_url(),
            self.config.api_key
        );

        let response = self
            .http
            .post(&url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("content-type", mime_type.to_string())
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::FileStore(format!("upload failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::FileStore(format!("failed to read upload response: {e}")))?;

        if !status.is_success() {
            return Err(Error::FileStore(format!("upload failed ({status}): {body}")));
        }

        let parsed: UploadResponse = serde_json::from_str(&body)
            .map_err(|e| Error::FileStore(format!("failed to parse upload response: {e}")))?;

        Ok(StoredFile {
            name: parsed.file.name,
            uri: parsed.file.uri,
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let url = format!(
            "{}/v1beta/{}?key={}",
            self.base_url(),
            name,
            self.config.api_key
        );

        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::FileStore(format!("delete failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FileStore(format!("delete failed ({status})")));
        }
        Ok(())
    }
}
