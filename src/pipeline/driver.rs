//! Pipeline driver: stage composition and finalize.
//!
//! Stages run in a fixed order over one shared [`ReasonMap`]: Group ->
//! Friend -> Profile -> Outfit -> Thumbnail. A failing stage is logged and
//! the remaining stages still run, so the driver always produces a
//! best-effort result set. Only cancellation and the batch timeout abort a
//! run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::llm::{ChatClient, FileStore};
use crate::model::{BatchReport, BatchStats, FlaggedUser, UserBatch, UserRecord};
use crate::reasons::{composite_confidence, ReasonMap};
use crate::services::{FlagStore, GroupTracker, ImageFetcher, OutfitThumbnails, Translator};

use super::friend::FriendStage;
use super::group::GroupStage;
use super::outfit::OutfitStage;
use super::profile::ProfileStage;
use super::thumbnail::ThumbnailStage;

/// Every external collaborator the pipeline needs.
pub struct PipelineServices {
    pub chat: Arc<dyn ChatClient>,
    pub vision: Arc<dyn ChatClient>,
    pub translator: Arc<dyn Translator>,
    pub file_store: Arc<dyn FileStore>,
    pub image_fetcher: Arc<dyn ImageFetcher>,
    pub outfit_thumbnails: Arc<dyn OutfitThumbnails>,
    pub group_tracker: Arc<dyn GroupTracker>,
    pub flag_store: Arc<dyn FlagStore>,
}

/// The moderation analysis pipeline.
pub struct Pipeline {
    group: GroupStage,
    friend: FriendStage,
    profile: ProfileStage,
    outfit: OutfitStage,
    thumbnail: ThumbnailStage,
    flag_store: Arc<dyn FlagStore>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(services: PipelineServices, config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let friend_semaphore = Arc::new(Semaphore::new(config.concurrency.friend));
        let profile_semaphore = Arc::new(Semaphore::new(config.concurrency.profile));
        let translation_semaphore = Arc::new(Semaphore::new(config.concurrency.translation));
        let outfit_semaphore = Arc::new(Semaphore::new(config.concurrency.outfit));
        let thumbnail_semaphore = Arc::new(Semaphore::new(config.concurrency.thumbnail));
        // One lookup pool shared by the group and friend analyzers.
        let lookup_semaphore = Arc::new(Semaphore::new(config.concurrency.lookup));

        Ok(Self {
            group: GroupStage::new(
                Arc::clone(&services.group_tracker),
                Arc::clone(&lookup_semaphore),
                config.thresholds.group_flag,
            ),
            friend: FriendStage::new(
                Arc::clone(&services.chat),
                friend_semaphore,
                lookup_semaphore,
                config.clone(),
            ),
            profile: ProfileStage::new(
                Arc::clone(&services.chat),
                Arc::clone(&services.translator),
                profile_semaphore,
                translation_semaphore,
                config.clone(),
            ),
            outfit: OutfitStage::new(
                Arc::clone(&services.vision),
                Arc::clone(&services.outfit_thumbnails),
                Arc::clone(&services.image_fetcher),
                outfit_semaphore,
                config.clone(),
            ),
            thumbnail: ThumbnailStage::new(
                Arc::clone(&services.vision),
                Arc::clone(&services.file_store),
                Arc::clone(&services.image_fetcher),
                thumbnail_semaphore,
                config.clone(),
            ),
            flag_store: services.flag_store,
            config,
        })
    }

    /// Run the full pipeline over one batch.
    pub async fn run(&self, batch: UserBatch, cancel: &CancellationToken) -> Result<BatchReport> {
        let mut report = BatchReport {
            stats: BatchStats {
                users_scanned: batch.users.len(),
                ..BatchStats::default()
            },
            ..BatchReport::default()
        };
        let reasons = ReasonMap::new();

        let timeout = Duration::from_secs(self.config.batch_timeout_secs);
        let staged = self.run_stages(&batch, &reasons, cancel, &mut report);
        match tokio::time::timeout(timeout, staged).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("batch timed out after {}s", self.config.batch_timeout_secs);
                return Err(Error::timeout(timeout.as_millis() as u64));
            }
        }

        // Cancellation after the stages still means no persistence.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let users_by_id: HashMap<u64, &Arc<UserRecord>> =
            batch.users.iter().map(|u| (u.id, u)).collect();

        let mut flagged = HashMap::new();
        for (user_id, reason_set) in reasons.into_inner() {
            let Some(user) = users_by_id.get(&user_id) else {
                // Stages only ever key by batch users; anything else is a bug.
                warn!(user_id, "dropping reasons for unknown user id");
                continue;
            };
            flagged.insert(
                user_id,
                FlaggedUser {
                    user: Arc::clone(user),
                    confidence: composite_confidence(&reason_set),
                    reasons: reason_set,
                },
            );
        }

        report.stats.flagged_users = flagged.len();
        info!(
            scanned = report.stats.users_scanned,
            flagged = report.stats.flagged_users,
            "batch analysis complete"
        );

        // Finalize always hands the (possibly empty) flagged set over.
        if let Err(e) = self.flag_store.save_flagged(&flagged).await {
            // Per-stage work stands; the batch is not retried here.
            error!("failed to persist flagged users: {e}");
        }

        report.flagged = flagged;
        Ok(report)
    }

    async fn run_stages(
        &self,
        batch: &UserBatch,
        reasons: &ReasonMap,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) -> Result<()> {
        match self.group.run(batch, reasons, cancel).await {
            Ok(outcome) => report.stats.group_flagged = outcome.flagged,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("group stage failed: {e}"),
        }

        match self.friend.run(batch, reasons, cancel).await {
            Ok(outcome) => report.stats.friend_flagged = outcome.flagged,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("friend stage failed: {e}"),
        }

        match self.profile.run(&batch.users, reasons, cancel).await {
            Ok(outcome) => {
                report.stats.profile_flagged = outcome.flagged;
                report.stats.translation_failures = outcome.translation_failures;
                report.stats.validation_rejections = outcome.validation_rejections;
                report.profile_retry_ids = outcome.retry_ids;
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("profile stage failed: {e}"),
        }

        // The image stages act only on users an earlier stage flagged.
        let flagged_view: Vec<Arc<UserRecord>> = batch
            .users
            .iter()
            .filter(|u| reasons.contains(u.id))
            .cloned()
            .collect();

        match self.outfit.run(&flagged_view, reasons, cancel).await {
            Ok(outcome) => report.stats.outfit_flagged = outcome.flagged,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("outfit stage failed: {e}"),
        }

        match self.thumbnail.run(&flagged_view, reasons, cancel).await {
            Ok(outcome) => report.stats.thumbnail_flagged = outcome.flagged,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("thumbnail stage failed: {e}"),
        }

        Ok(())
    }
}
