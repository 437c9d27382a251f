//! Profile text analyzer.
//!
//! Runs over every batch user, not only pre-flagged ones. Non-English
//! descriptions are translated first; the model sees the translated record,
//! evidence is anchored against the translated fields, and the emitted
//! reason attaches to the original user. Entries that fail validation are
//! returned to the caller for retry scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::evidence::EvidenceValidator;
use crate::llm::{ChatClient, Content, GenerateRequest, GenerationConfig};
use crate::model::{Reason, ReasonType, UserRecord};
use crate::reasons::ReasonMap;
use crate::retry::{acquire, retry, RetryPolicy};
use crate::services::Translator;

use super::NO_VIOLATIONS;

const SYSTEM_PROMPT: &str = "\
You review social-platform user profiles for policy violations.
You receive a JSON array of profiles with `name`, `displayName` and \
`description` fields.
Return only users whose profile text violates policy. For each, give a \
one-sentence `reason`, copy the offending text verbatim into \
`flaggedContent` (exact quotes only, never paraphrased), and set \
`confidence` between 0.1 and 1.0.
If a profile has no violation, do not invent one; use the reason \
NO_VIOLATIONS if you must return the user at all.";

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "users": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": {"type": "STRING"},
                        "reason": {"type": "STRING"},
                        "flaggedContent": {"type": "ARRAY", "items": {"type": "STRING"}},
                        "confidence": {"type": "NUMBER"}
                    },
                    "required": ["name", "reason", "flaggedContent", "confidence"]
                }
            }
        },
        "required": ["users"]
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptProfile<'a> {
    name: &'a str,
    display_name: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    users: Vec<AnalysisEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisEntry {
    name: String,
    reason: String,
    #[serde(default)]
    flagged_content: Vec<String>,
    confidence: f64,
}

/// A user record with its description in the form the model sees.
struct TranslatedProfile {
    user: Arc<UserRecord>,
    description: String,
    translation_failed: bool,
}

/// Outcome of one profile-stage run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProfileOutcome {
    pub flagged: usize,
    /// Users whose returned analysis failed validation.
    pub retry_ids: Vec<u64>,
    pub translation_failures: usize,
    pub validation_rejections: usize,
}

pub struct ProfileStage {
    chat: Arc<dyn ChatClient>,
    translator: Arc<dyn Translator>,
    validator: EvidenceValidator,
    semaphore: Arc<Semaphore>,
    translation_semaphore: Arc<Semaphore>,
    config: PipelineConfig,
}

impl ProfileStage {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        translator: Arc<dyn Translator>,
        semaphore: Arc<Semaphore>,
        translation_semaphore: Arc<Semaphore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            chat,
            translator,
            validator: EvidenceValidator::new(config.thresholds.evidence_match),
            semaphore,
            translation_semaphore,
            config,
        }
    }

    pub async fn run(
        &self,
        users: &[Arc<UserRecord>],
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<ProfileOutcome> {
        if users.is_empty() {
            return Ok(ProfileOutcome::default());
        }

        let translated = self.translate_all(users, cancel).await?;

        let mut outcome = ProfileOutcome {
            translation_failures: translated.iter().filter(|t| t.translation_failed).count(),
            ..ProfileOutcome::default()
        };

        let tasks: Vec<_> = translated
            .chunks(self.config.batch_size.profile.max(1))
            .map(|chunk| self.analyze_chunk(chunk, reasons, cancel))
            .collect();

        for result in join_all(tasks).await {
            let chunk_outcome = result?;
            outcome.flagged += chunk_outcome.flagged;
            outcome.retry_ids.extend(chunk_outcome.retry_ids);
            outcome.validation_rejections += chunk_outcome.validation_rejections;
        }
        Ok(outcome)
    }

    /// Fork-join translation: one task per non-empty description, bounded by
    /// the translation semaphore.
    async fn translate_all(
        &self,
        users: &[Arc<UserRecord>],
        cancel: &CancellationToken,
    ) -> Result<Vec<TranslatedProfile>> {
        let tasks: Vec<_> = users
            .iter()
            .map(|user| {
                let user = Arc::clone(user);
                async move {
                    if user.description.is_empty() {
                        return Ok(TranslatedProfile {
                            description: String::new(),
                            user,
                            translation_failed: false,
                        });
                    }

                    let attempt = retry(&RetryPolicy::ai(), cancel, || {
                        let user = Arc::clone(&user);
                        async move {
                            let _permit = acquire(&self.translation_semaphore, cancel).await?;
                            self.translator
                                .translate(&user.description, "auto", "en")
                                .await
                        }
                    })
                    .await;

                    match attempt {
                        Ok(description) => Ok(TranslatedProfile {
                            description,
                            user,
                            translation_failed: false,
                        }),
                        Err(Error::Cancelled) => Err(Error::Cancelled),
                        Err(e) => {
                            warn!(user_id = user.id, "translation failed, using original: {e}");
                            Ok(TranslatedProfile {
                                description: user.description.clone(),
                                user,
                                translation_failed: true,
                            })
                        }
                    }
                }
            })
            .collect();

        join_all(tasks).await.into_iter().collect()
    }

    async fn analyze_chunk(
        &self,
        chunk: &[TranslatedProfile],
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<ProfileOutcome> {
        let mut outcome = ProfileOutcome::default();

        let response = match self.request_analysis(chunk, cancel).await {
            Ok(response) => response,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                // The sub-batch contributes nothing; other chunks continue.
                warn!("profile analysis failed for sub-batch of {}: {e}", chunk.len());
                return Ok(outcome);
            }
        };

        let by_name: HashMap<&str, &TranslatedProfile> = chunk
            .iter()
            .map(|t| (t.user.name.as_str(), t))
            .collect();

        for entry in response.users {
            let Some(profile) = by_name.get(entry.name.as_str()) else {
                warn!(name = %entry.name, "model returned a user outside the batch");
                outcome.validation_rejections += 1;
                continue;
            };

            if let Some(rejection) = self.validate_entry(&entry, profile) {
                debug!(user_id = profile.user.id, rejection, "profile entry rejected");
                outcome.validation_rejections += 1;
                outcome.retry_ids.push(profile.user.id);
                continue;
            }

            if reasons.add(
                profile.user.id,
                Reason::new(
                    ReasonType::Profile,
                    entry.reason,
                    entry.confidence,
                    entry.flagged_content,
                ),
            ) {
                outcome.flagged += 1;
            }
        }

        Ok(outcome)
    }

    async fn request_analysis(
        &self,
        chunk: &[TranslatedProfile],
        cancel: &CancellationToken,
    ) -> Result<AnalysisResponse> {
        let payload: Vec<PromptProfile<'_>> = chunk
            .iter()
            .map(|t| PromptProfile {
                name: &t.user.name,
                display_name: &t.user.display_name,
                description: &t.description,
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

        response.json_payload()
    }

    /// Returns the rejection cause, or None when the entry is valid.
    fn validate_entry(
        &self,
        entry: &AnalysisEntry,
        profile: &TranslatedProfile,
    ) -> Option<&'static str> {
        if entry.reason == NO_VIOLATIONS {
            return Some("reason is NO_VIOLATIONS");
        }
        if !(0.1..=1.0).contains(&entry.confidence) {
            return Some("confidence out of range");
        }
        if entry.flagged_content.is_empty() {
            return Some("no flagged content");
        }

        let targets = [
            profile.user.name.as_str(),
            profile.user.display_name.as_str(),
            profile.description.as_str(),
        ];
        if !self.validator.validate(&entry.flagged_content, &targets) {
            return Some("evidence does not anchor to profile");
        }
        None
    }
}
