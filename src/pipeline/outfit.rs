//! Outfit image analyzer.
//!
//! Runs only over users some earlier stage already flagged. Resolves the
//! user's saved outfits to thumbnails, re-encodes them, and submits the set
//! to the vision model as one multi-image request: a text part naming the
//! outfits in order, then one image part per outfit in the same order.

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
use crate::llm::{ChatClient, Content, GenerateRequest, GenerationConfig, Part};
use crate::model::{Reason, ReasonType, UserRecord};
use crate::reasons::ReasonMap;
use crate::retry::{acquire, retry, RetryPolicy};
use crate::services::{ImageFetcher, OutfitThumbnails};

use super::NO_VIOLATIONS;

/// Display name for the avatar image appended after the outfit list.
const CURRENT_AVATAR: &str = "Current Avatar";

const SYSTEM_PROMPT: &str = "\
You review avatar outfit images from a social platform for policy \
violations such as depicted nudity or clothing designed to imitate it.
The request names each outfit and then attaches the images in the same \
order.
If any outfit violates policy, give a one-sentence `reason`, list the \
offending outfit names in `evidence` exactly as provided, and set \
`confidence` between 0.1 and 1.0. Use the reason NO_VIOLATIONS when \
nothing violates policy.";

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "username": {"type": "STRING"},
            "reason": {"type": "STRING"},
            "evidence": {"type": "ARRAY", "items": {"type": "STRING"}},
            "confidence": {"type": "NUMBER"}
        },
        "required": ["username", "reason", "evidence", "confidence"]
    })
}

#[derive(Debug, Deserialize)]
struct OutfitAnalysis {
    username: String,
    reason: String,
    #[serde(default)]
    evidence: Vec<String>,
    confidence: f64,
}

/// Outcome of one outfit-stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutfitOutcome {
    pub flagged: usize,
}

pub struct OutfitStage {
    vision: Arc<dyn ChatClient>,
    thumbnails: Arc<dyn OutfitThumbnails>,
    fetcher: Arc<dyn ImageFetcher>,
    semaphore: Arc<Semaphore>,
    config: PipelineConfig,
}

impl OutfitStage {
    pub fn new(
        vision: Arc<dyn ChatClient>,
        thumbnails: Arc<dyn OutfitThumbnails>,
        fetcher: Arc<dyn ImageFetcher>,
        semaphore: Arc<Semaphore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            vision,
            thumbnails,
            fetcher,
            semaphore,
            config,
        }
    }

    /// Analyze the given (already-flagged) users.
    pub async fn run(
        &self,
        users: &[Arc<UserRecord>],
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<OutfitOutcome> {
        let mut outcome = OutfitOutcome::default();
        for staged in users.chunks(self.config.batch_size.outfit.max(1)) {
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
        let images = match self.collect_images(&user, cancel).await {
            Ok(images) => images,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(user_id = user.id, "outfit image collection failed: {e}");
                return Ok(0);
            }
        };
        if images.is_empty() {
            return Ok(0);
        }

        let analysis = match self.request_analysis(&user, &images, cancel).await {
            Ok(analysis) => analysis,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(user_id = user.id, "outfit analysis failed: {e}");
                return Ok(0);
            }
        };

        if analysis.username != user.name {
            warn!(user_id = user.id, name = %analysis.username, "outfit analysis named the wrong user");
            return Ok(0);
        }
        if analysis.reason == NO_VIOLATIONS {
            return Ok(0);
        }
        if !(0.1..=1.0).contains(&analysis.confidence) {
            debug!(user_id = user.id, confidence = analysis.confidence, "outfit confidence out of range");
            return Ok(0);
        }

        // Evidence names the model invented are dropped, not fatal.
        let known: Vec<&str> = images.iter().map(|(name, _)| name.as_str()).collect();
        let evidence: Vec<String> = analysis
            .evidence
            .into_iter()
            .filter(|name| known.contains(&name.as_str()))
            .collect();

        let added = reasons.add(
            user.id,
            Reason::new(
                ReasonType::Outfit,
                analysis.reason,
                analysis.confidence,
                evidence,
            ),
        );
        Ok(usize::from(added))
    }

    /// Resolve, download and re-encode this user's outfit images, in outfit
    /// order, with the current avatar appended last.
    async fn collect_images(
        &self,
        user: &UserRecord,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let outfits: Vec<_> = user.outfits.iter().take(self.config.max_outfits).collect();

        let mut sources: Vec<(String, String)> = Vec::new();
        if !outfits.is_empty() {
            let ids: Vec<u64> = outfits.iter().map(|o| o.outfit_id).collect();
            let urls = retry(&RetryPolicy::thumbnail(), cancel, || {
                let ids = ids.clone();
                async move { self.thumbnails.batch_thumbnails(&ids).await }
            })
            .await?;

            for outfit in &outfits {
                if let Some(url) = urls.get(&outfit.outfit_id) {
                    sources.push((outfit.name.clone(), url.clone()));
                }
            }
        }
        if user.has_thumbnail() {
            sources.push((CURRENT_AVATAR.to_string(), user.thumbnail_url.clone()));
        }

        let mut images = Vec::with_capacity(sources.len());
        for (name, url) in sources {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.fetch_image(&url).await {
                Ok(bytes) => images.push((name, bytes)),
                Err(e) => warn!(user_id = user.id, %url, "outfit thumbnail skipped: {e}"),
            }
        }
        Ok(images)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self.fetcher.fetch(url).await?;
        reencode_png(&bytes)
    }

    async fn request_analysis(
        &self,
        user: &UserRecord,
        images: &[(String, Vec<u8>)],
        cancel: &CancellationToken,
    ) -> Result<OutfitAnalysis> {
        let mut prompt = format!(
            "Analyze the outfits of user \"{}\". The {} images are, in order:\n",
            user.name,
            images.len()
        );
        for (index, (name, _)) in images.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", index + 1, name));
        }

        let mut parts = vec![Part::text(prompt)];
        parts.extend(
            images
                .iter()
                .map(|(_, bytes)| Part::inline_image(bytes, CANONICAL_MIME)),
        );

        let request = GenerateRequest::new(&self.config.model.vision)
            .with_system(SYSTEM_PROMPT)
            .with_content(Content::user(parts))
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

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::llm::GenerateResponse;
    use crate::model::OutfitRef;

    fn tiny_png() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            2,
            2,
            image::Rgba([0, 0, 0, 255]),
        ));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png)
            .expect("encoding a fresh image cannot fail");
        out.into_inner()
    }

    struct ScriptedVision {
        reply: String,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl ScriptedVision {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedVision {
        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
            self.requests.lock().expect("vision lock").push(request);
            Ok(GenerateResponse::from_text(self.reply.clone()))
        }
    }

    struct MapThumbnails {
        urls: HashMap<u64, String>,
        pending_for: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OutfitThumbnails for MapThumbnails {
        async fn batch_thumbnails(&self, outfit_ids: &[u64]) -> Result<HashMap<u64, String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.pending_for {
                return Err(Error::PendingThumbnails);
            }
            Ok(outfit_ids
                .iter()
                .filter_map(|id| self.urls.get(id).map(|u| (*id, u.clone())))
                .collect())
        }
    }

    struct PngFetcher;

    #[async_trait]
    impl ImageFetcher for PngFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(tiny_png())
        }
    }

    fn user_with_outfits(id: u64, name: &str, outfit_names: &[&str]) -> Arc<UserRecord> {
        Arc::new(UserRecord {
            id,
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            created_at: Utc::now(),
            groups: Vec::new(),
            friends: Vec::new(),
            outfits: outfit_names
                .iter()
                .enumerate()
                .map(|(i, n)| OutfitRef {
                    outfit_id: i as u64 + 1,
                    name: n.to_string(),
                })
                .collect(),
            thumbnail_url: "https://cdn.example.com/avatar.png".to_string(),
            follower_count: 0,
            following_count: 0,
        })
    }

    fn stage(reply: &str, pending_for: usize, outfit_count: usize) -> OutfitStage {
        let urls: HashMap<u64, String> = (1..=outfit_count as u64)
            .map(|id| (id, format!("https://cdn.example.com/{id}.png")))
            .collect();
        OutfitStage::new(
            Arc::new(ScriptedVision::new(reply)),
            Arc::new(MapThumbnails {
                urls,
                pending_for,
                calls: AtomicUsize::new(0),
            }),
            Arc::new(PngFetcher),
            Arc::new(Semaphore::new(3)),
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_flags_user_and_filters_evidence() {
        let reply = r#"{"username": "bob", "reason": "One outfit imitates nudity.", "evidence": ["Skin Suit", "Invented Name"], "confidence": 0.85}"#;
        let stage = stage(reply, 0, 2);
        let reasons = ReasonMap::new();

        let users = vec![user_with_outfits(2, "bob", &["Skin Suit", "Knight Armor"])];
        let outcome = stage
            .run(&users, &reasons, &CancellationToken::new())
            .await
            .expect("stage runs");

        assert_eq!(outcome.flagged, 1);
        let merged = reasons.get(2).expect("user flagged");
        let reason = &merged[&ReasonType::Outfit];
        assert_eq!(reason.confidence, 0.85);
        // The invented name was dropped, the real one kept.
        assert_eq!(reason.evidence, vec!["Skin Suit".to_string()]);
    }

    #[tokio::test]
    async fn test_no_violations_is_discarded() {
        let reply = r#"{"username": "bob", "reason": "NO_VIOLATIONS", "evidence": [], "confidence": 0.9}"#;
        let stage = stage(reply, 0, 1);
        let reasons = ReasonMap::new();

        let users = vec![user_with_outfits(2, "bob", &["Plain Shirt"])];
        let outcome = stage
            .run(&users, &reasons, &CancellationToken::new())
            .await
            .expect("stage runs");

        assert_eq!(outcome.flagged, 0);
        assert!(reasons.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_discarded() {
        let reply = r#"{"username": "bob", "reason": "x", "evidence": ["Plain Shirt"], "confidence": 0.05}"#;
        let stage = stage(reply, 0, 1);
        let reasons = ReasonMap::new();

        let users = vec![user_with_outfits(2, "bob", &["Plain Shirt"])];
        let outcome = stage
            .run(&users, &reasons, &CancellationToken::new())
            .await
            .expect("stage runs");

        assert_eq!(outcome.flagged, 0);
    }

    #[tokio::test]
    async fn test_wrong_username_is_discarded() {
        let reply = r#"{"username": "mallory", "reason": "x", "evidence": ["Plain Shirt"], "confidence": 0.8}"#;
        let stage = stage(reply, 0, 1);
        let reasons = ReasonMap::new();

        let users = vec![user_with_outfits(2, "bob", &["Plain Shirt"])];
        let outcome = stage
            .run(&users, &reasons, &CancellationToken::new())
            .await
            .expect("stage runs");

        assert_eq!(outcome.flagged, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_thumbnails_are_retried() {
        let reply = r#"{"username": "bob", "reason": "violation", "evidence": ["Skin Suit"], "confidence": 0.7}"#;
        let stage = stage(reply, 2, 1);
        let reasons = ReasonMap::new();

        let users = vec![user_with_outfits(2, "bob", &["Skin Suit"])];
        let outcome = stage
            .run(&users, &reasons, &CancellationToken::new())
            .await
            .expect("stage runs after retries");

        assert_eq!(outcome.flagged, 1);
    }

    #[tokio::test]
    async fn test_request_orders_text_then_images() {
        let vision = Arc::new(ScriptedVision::new(
            r#"{"username": "bob", "reason": "NO_VIOLATIONS", "evidence": [], "confidence": 0.5}"#,
        ));
        let stage = OutfitStage::new(
            Arc::clone(&vision) as Arc<dyn ChatClient>,
            Arc::new(MapThumbnails {
                urls: [(1u64, "https://cdn.example.com/1.png".to_string())]
                    .into_iter()
                    .collect(),
                pending_for: 0,
                calls: AtomicUsize::new(0),
            }),
            Arc::new(PngFetcher),
            Arc::new(Semaphore::new(3)),
            PipelineConfig::default(),
        );
        let reasons = ReasonMap::new();

        let users = vec![user_with_outfits(2, "bob", &["Skin Suit"])];
        stage
            .run(&users, &reasons, &CancellationToken::new())
            .await
            .expect("stage runs");

        let requests = vision.requests.lock().expect("vision lock");
        assert_eq!(requests.len(), 1);
        let parts = &requests[0].contents[0].parts;
        // Text first, then one image per outfit plus the current avatar.
        assert!(parts[0].text.as_deref().expect("text part").contains("Skin Suit"));
        assert!(parts[0].text.as_deref().expect("text part").contains(CURRENT_AVATAR));
        assert_eq!(parts.len(), 3);
        assert!(parts[1].inline_data.is_some());
        assert!(parts[2].inline_data.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let reply = r#"{"username": "bob", "reason": "x", "evidence": [], "confidence": 0.5}"#;
        let stage = stage(reply, 0, 1);
        let reasons = ReasonMap::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let users = vec![user_with_outfits(2, "bob", &["Skin Suit"])];
        let result = stage.run(&users, &reasons, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
