//! External collaborator contracts.
//!
//! The pipeline core talks to every outside system through these traits:
//! translation, thumbnail resolution, image downloads, group-membership
//! tracking and flagged-user persistence. Production implementations live
//! with their services; tests supply in-memory fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{Error, Result};
use crate::llm::build_http_client;
use crate::model::FlaggedUser;

/// Text translation with retryable transient failures.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` from `source` (may be "auto") into `target`.
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;
}

/// Resolves outfit thumbnail URLs in batches.
///
/// Implementations return [`Error::PendingThumbnails`] when the platform has
/// not finished rendering part of the batch; the caller retries the
/// remainder under the thumbnail retry profile.
#[async_trait]
pub trait OutfitThumbnails: Send + Sync {
    async fn batch_thumbnails(&self, outfit_ids: &[u64]) -> Result<HashMap<u64, String>>;
}

/// Downloads raw image bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Records which users were seen in which inappropriate groups.
#[async_trait]
pub trait GroupTracker: Send + Sync {
    async fn track_memberships(&self, memberships: &HashMap<u64, Vec<u64>>) -> Result<()>;
}

/// Persists the flagged set produced by a batch.
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn save_flagged(&self, flagged: &HashMap<u64, FlaggedUser>) -> Result<()>;
}

/// Reqwest-backed [`ImageFetcher`].
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            http: build_http_client(timeout_secs),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::http(format!("image fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::http(format!("image fetch failed ({status})")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::http(format!("image body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}
