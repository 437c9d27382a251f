//! Avatar headshot analyzer.
//!
//! Runs only over already-flagged users whose profile carries a usable
//! thumbnail URL. Each headshot is downloaded, re-encoded, uploaded to the
//! model file store, analyzed with a focused clothing-presence prompt, and
//! deleted again best-effort.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::image::{reencode_png, CANONICAL_MIME};
use crate::llm::{ChatClient, Content, FileStore, GenerateRequest, GenerationConfig, Part};
use crate::model::{Reason, ReasonType, UserRecord};
use crate::reasons::ReasonMap;
use crate::retry::{acquire, retry, RetryPolicy};
use crate::services::ImageFetcher;

/// Template message for thumbnail reasons; the model only answers yes/no.
const MESSAGE: &str = "User's avatar headshot depicts missing or inappropriate clothing.";

const SYSTEM_PROMPT: &str = "\
You review a single avatar headshot image from a social platform.
Answer only whether the avatar is missing clothing or wears something \
designed to imitate nudity. Set `hasViolation` accordingly and \
`confidence` between 0.1 and 1.0.";

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "username": {"type": "STRING"},
            "hasViolation": {"type": "BOOLEAN"},
            "confidence": {"type": "NUMBER"}
        },
        "required": ["username", "hasViolation", "confidence"]
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThumbnailAnalysis {
    username: String,
    has_violation: bool,
    confidence: f64,
}

/// Outcome of one thumbnail-stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailOutcome {
    pub flagged: usize,
}

pub struct ThumbnailStage {
    vision: Arc<dyn ChatClient>,
    store: Arc<dyn FileStore>,
    fetcher: Arc<dyn ImageFetcher>,
    semaphore: Arc<Semaphore>,
    config: PipelineConfig,
}

impl ThumbnailStage {
    pub fn new(
        vision: Arc<dyn ChatClient>,
        store: Arc<dyn FileStore>,
        fetcher: Arc<dyn ImageFetcher>,
        semaphore: Arc<Semaphore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            vision,
            store,
            fetcher,
            semaphore,
            config,
        }
    }

    /// Analyze the given (already-flagged) users. Users with the sentinel
    /// thumbnail URL are skipped without side effects.
    pub async fn run(
        &self,
        users: &[Arc<UserRecord>],
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<ThumbnailOutcome> {
        let eligible: Vec<&Arc<UserRecord>> =
            users.iter().filter(|user| user.has_thumbnail()).collect();

        let mut outcome = ThumbnailOutcome::default();
        for staged in eligible.chunks(self.config.batch_size.thumbnail.max(1)) {
            let tasks: Vec<_> = staged
                .iter()
                .map(|user| self.analyze_user(Arc::clone(user), reasons, cancel))
                .collect();
            for result in join_all(tasks).await {
                outcome.flagged += result?;
            }
        }
        Ok(outcome)
    }

    async fn analyze_user(
        &self,
        user: Arc<UserRecord>,
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bytes = match self.fetch_image(&user.thumbnail_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(user_id = user.id, "thumbnail download failed: {e}");
                return Ok(0);
            }
        };

        let stored = match retry(&RetryPolicy::ai(), cancel, || {
            let bytes = bytes.clone();
            async move { self.store.upload(bytes, CANONICAL_MIME).await }
        })
        .await
        {
            Ok(stored) => stored,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(user_id = user.id, "thumbnail upload failed: {e}");
                return Ok(0);
            }
        };

        let analysis = self.request_analysis(&user, &stored.uri, cancel).await;

        // The uploaded file is owned by this task: delete before acting on
        // the analysis, whatever it returned.
        if let Err(e) = self.store.delete(&stored.name).await {
            warn!(user_id = user.id, file = %stored.name, "thumbnail file delete failed: {e}");
        }

        let analysis = match analysis {
            Ok(analysis) => analysis,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(user_id = user.id, "thumbnail analysis failed: {e}");
                return Ok(0);
            }
        };

        if analysis.username != user.name {
            warn!(user_id = user.id, name = %analysis.username, "thumbnail analysis named the wrong user");
            return Ok(0);
        }
        if !analysis.has_violation {
            return Ok(0);
        }
        if !(0.1..=1.0).contains(&analysis.confidence) {
            debug!(user_id = user.id, confidence = analysis.confidence, "thumbnail confidence out of range");
            return Ok(0);
        }

        let added = reasons.add(
            user.id,
            Reason::new(ReasonType::Thumbnail, MESSAGE, analysis.confidence, vec![]),
        );
        Ok(usize::from(added))
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self.fetcher.fetch(url).await?;
        reencode_png(&bytes)
    }

    async fn request_analysis(
        &self,
        user: &UserRecord,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<ThumbnailAnalysis> {
        let prompt = format!("Analyze the avatar headshot of user \"{}\".", user.name);
        let request = GenerateRequest::new(&self.config.model.vision)
            .with_system(SYSTEM_PROMPT)
            .with_content(Content::user(vec![
                Part::text(prompt),
                Part::file(uri, CANONICAL_MIME),
            ]))
            .with_config(GenerationConfig::json(
                response_schema(),
                self.config.model.temperature,
            ));

        let response = retry(&RetryPolicy::ai(), cancel, || {
            let request = request.clone();
            async move {
                let _permit = acquire(&self.semaphore, cancel).await?;
                self.vision.generate(request).await
            }
        })
        .await?;

        response.json_payload()
    }
}
