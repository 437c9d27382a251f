//! Friend-graph analyzer.
//!
//! Flags users whose friend lists overlap with already confirmed or flagged
//! users. Confidence blends the absolute overlap, its share of the friend
//! list, and account age. Flagged users get a one-sentence AI network
//! analysis, with a deterministic template as fallback.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::llm::{ChatClient, Content, GenerateRequest, GenerationConfig};
use crate::model::{FlagStatus, Reason, ReasonType, UserBatch, UserRecord};
use crate::reasons::ReasonMap;
use crate::retry::{acquire, retry, RetryPolicy};

use super::weights::{age_weight, friend_confidence, inappropriate_percent};

/// Users with fewer friends than this carry too little signal to analyze.
const MIN_FRIENDS: usize = 3;

const SYSTEM_PROMPT: &str = "\
You assist a moderation review of a social platform.
You receive a JSON array of users; each has a `friends` list of connections \
that were previously confirmed or flagged as inappropriate, with the reason \
types that applied.
For each user, write exactly one sentence describing what the composition of \
these connections suggests, referring to them as \"the network\".
Return JSON matching the response schema, with `name` copied verbatim from \
the input and one result per user.";

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "results": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": {"type": "STRING"},
                        "analysis": {"type": "STRING"}
                    },
                    "required": ["name", "analysis"]
                }
            }
        },
        "required": ["results"]
    })
}

#[derive(Debug, Serialize)]
struct PromptUser {
    username: String,
    friends: Vec<PromptFriend>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptFriend {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    reason_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    results: Vec<AnalysisEntry>,
}

#[derive(Debug, Deserialize)]
struct AnalysisEntry {
    name: String,
    analysis: String,
}

/// One user above the flag threshold, with the overlap that put them there.
struct Candidate {
    user: Arc<UserRecord>,
    confirmed: Vec<(u64, String, Vec<ReasonType>)>,
    flagged: Vec<(u64, String, Vec<ReasonType>)>,
    confidence: f64,
}

impl Candidate {
    fn template_message(&self) -> String {
        let confirmed = self.confirmed.len();
        let flagged = self.flagged.len();
        let percent = inappropriate_percent(confirmed, flagged, self.user.friends.len());
        format!(
            "User has {confirmed} confirmed and {flagged} flagged friends ({percent:.1}% total)."
        )
    }
}

/// Outcome of one friend-stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FriendOutcome {
    pub flagged: usize,
}

pub struct FriendStage {
    chat: Arc<dyn ChatClient>,
    semaphore: Arc<Semaphore>,
    lookup_semaphore: Arc<Semaphore>,
    config: PipelineConfig,
}

impl FriendStage {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        semaphore: Arc<Semaphore>,
        lookup_semaphore: Arc<Semaphore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            chat,
            semaphore,
            lookup_semaphore,
            config,
        }
    }

    pub async fn run(
        &self,
        batch: &UserBatch,
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<FriendOutcome> {
        let candidates = self.collect_candidates(batch, cancel).await?;
        if candidates.is_empty() {
            return Ok(FriendOutcome::default());
        }

        let tasks: Vec<_> = candidates
            .chunks(self.config.batch_size.friend.max(1))
            .map(|chunk| self.analyze_chunk(chunk, reasons, cancel))
            .collect();

        let mut outcome = FriendOutcome::default();
        for result in join_all(tasks).await {
            outcome.flagged += result?;
        }
        Ok(outcome)
    }

    /// Fan per-user friend lookups out under the lookup semaphore and keep
    /// the users above the flag threshold, in batch order.
    async fn collect_candidates(
        &self,
        batch: &UserBatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        let now = Utc::now();
        let tasks: Vec<_> = batch
            .users
            .iter()
            .map(|user| {
                let user = Arc::clone(user);
                async move {
                    let _permit = acquire(&self.lookup_semaphore, cancel).await?;
                    Ok::<_, Error>(self.evaluate_user(user, batch, now))
                }
            })
            .collect();

        let mut candidates = Vec::new();
        for result in join_all(tasks).await {
            if let Some(candidate) = result? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    fn evaluate_user(
        &self,
        user: Arc<UserRecord>,
        batch: &UserBatch,
        now: chrono::DateTime<Utc>,
    ) -> Option<Candidate> {
        if user.friends.len() < MIN_FRIENDS {
            return None;
        }

        let mut confirmed = Vec::new();
        let mut flagged = Vec::new();
        for friend in &user.friends {
            if let Some(standing) = batch.known_friends.get(&friend.friend_id) {
                let entry = (
                    friend.friend_id,
                    friend.name.clone(),
                    standing.reason_types.clone(),
                );
                match standing.status {
                    FlagStatus::Confirmed => confirmed.push(entry),
                    FlagStatus::Flagged => flagged.push(entry),
                }
            }
        }
        if confirmed.is_empty() && flagged.is_empty() {
            return None;
        }

        let age_days = (now - user.created_at).num_days();
        let confidence = friend_confidence(
            confirmed.len(),
            flagged.len(),
            user.friends.len(),
            age_weight(age_days, &self.config.age_tiers),
        );
        if confidence < self.config.thresholds.friend_flag {
            return None;
        }

        debug!(user_id = user.id, confidence, "friend analyzer flagged user");
        Some(Candidate {
            user,
            confirmed,
            flagged,
            confidence,
        })
    }

    /// Friends included in the prompt: confirmed before flagged, each group
    /// ordered by ascending friend id, truncated to the configured cap.
    fn prompt_friends(&self, candidate: &Candidate) -> Vec<PromptFriend> {
        let mut confirmed = candidate.confirmed.clone();
        let mut flagged = candidate.flagged.clone();
        confirmed.sort_by_key(|(id, _, _)| *id);
        flagged.sort_by_key(|(id, _, _)| *id);

        confirmed
            .into_iter()
            .map(|(_, name, types)| (name, "confirmed", types))
            .chain(
                flagged
                    .into_iter()
                    .map(|(_, name, types)| (name, "flagged", types)),
            )
            .take(self.config.max_friends_in_prompt)
            .map(|(name, kind, types)| PromptFriend {
                name,
                kind,
                reason_types: types.iter().map(|t| t.to_string()).collect(),
            })
            .collect()
    }

    async fn analyze_chunk(
        &self,
        chunk: &[Candidate],
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let analyses = match self.request_analyses(chunk, cancel).await {
            Ok(analyses) => analyses,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("friend network analysis failed, using templates: {e}");
                HashMap::new()
            }
        };

        let mut flagged = 0usize;
        for candidate in chunk {
            let message = analyses
                .get(candidate.user.name.as_str())
                .cloned()
                .unwrap_or_else(|| candidate.template_message());
            if reasons.add(
                candidate.user.id,
                Reason::new(ReasonType::Friend, message, candidate.confidence, vec![]),
            ) {
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn request_analyses(
        &self,
        chunk: &[Candidate],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>> {
        let payload: Vec<PromptUser> = chunk
            .iter()
            .map(|c| PromptUser {
                username: c.user.name.clone(),
                friends: self.prompt_friends(c),
            })
            .collect();

        let request = GenerateRequest::new(&self.config.model.text)
            .with_system(SYSTEM_PROMPT)
            .with_content(Content::user_text(serde_json::to_string(&payload)?))
            .with_config(GenerationConfig::json(
                response_schema(),
                self.config.model.temperature,
            ));

        let response = retry(&RetryPolicy::ai(), cancel, || {
            let request = request.clone();
            async move {
                let _permit = acquire(&self.semaphore, cancel).await?;
                self.chat.generate(request).await
            }
        })
        .await?;

        let parsed: AnalysisResponse = response.json_payload()?;
        Ok(parsed
            .results
            .into_iter()
            .map(|entry| (entry.name, entry.analysis))
            .collect())
    }
}
