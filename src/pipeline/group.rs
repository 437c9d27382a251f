//! Group membership analyzer.
//!
//! Flags users who belong to known flagged or confirmed inappropriate
//! groups. Per-user lookups fan out under the lookup semaphore; the only
//! other I/O is the membership-tracking side effect.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{FlagStatus, Reason, ReasonType, UserBatch, UserRecord};
use crate::reasons::ReasonMap;
use crate::retry::acquire;
use crate::services::GroupTracker;

use super::weights::{group_confidence, inappropriate_percent};

/// Users with fewer inappropriate groups than this are never flagged,
/// whatever their confidence.
const MIN_INAPPROPRIATE_GROUPS: usize = 2;

/// Outcome of one group-stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupOutcome {
    pub flagged: usize,
}

pub struct GroupStage {
    tracker: Arc<dyn GroupTracker>,
    lookup_semaphore: Arc<Semaphore>,
    flag_threshold: f64,
}

impl GroupStage {
    pub fn new(
        tracker: Arc<dyn GroupTracker>,
        lookup_semaphore: Arc<Semaphore>,
        flag_threshold: f64,
    ) -> Self {
        Self {
            tracker,
            lookup_semaphore,
            flag_threshold,
        }
    }

    pub async fn run(
        &self,
        batch: &UserBatch,
        reasons: &ReasonMap,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome> {
        let tasks: Vec<_> = batch
            .users
            .iter()
            .map(|user| {
                let user = Arc::clone(user);
                async move {
                    let _permit = acquire(&self.lookup_semaphore, cancel).await?;
                    Ok::<_, Error>(self.analyze_user(&user, batch, reasons))
                }
            })
            .collect();

        let mut outcome = GroupOutcome::default();
        // groupId -> users seen in it, submitted to tracking in one call.
        let mut memberships: HashMap<u64, Vec<u64>> = HashMap::new();
        for result in join_all(tasks).await {
            let (pairs, added): (Vec<(u64, u64)>, bool) = result?;
            for (group_id, user_id) in pairs {
                memberships.entry(group_id).or_default().push(user_id);
            }
            if added {
                outcome.flagged += 1;
            }
        }

        if !memberships.is_empty() && !cancel.is_cancelled() {
            if let Err(e) = self.tracker.track_memberships(&memberships).await {
                warn!("group membership tracking failed: {e}");
            }
        }

        Ok(outcome)
    }

    /// Look up one user's groups: returns the inappropriate (group, user)
    /// pairs for tracking, and whether a reason was merged.
    fn analyze_user(
        &self,
        user: &UserRecord,
        batch: &UserBatch,
        reasons: &ReasonMap,
    ) -> (Vec<(u64, u64)>, bool) {
        let mut confirmed = 0usize;
        let mut flagged = 0usize;
        let mut pairs = Vec::new();

        for membership in &user.groups {
            match batch.known_groups.get(&membership.group_id) {
                Some(FlagStatus::Confirmed) => {
                    confirmed += 1;
                    pairs.push((membership.group_id, user.id));
                }
                Some(FlagStatus::Flagged) => {
                    flagged += 1;
                    pairs.push((membership.group_id, user.id));
                }
                None => {}
            }
        }

        if confirmed + flagged < MIN_INAPPROPRIATE_GROUPS {
            return (pairs, false);
        }

        let total = user.groups.len();
        let confidence = group_confidence(confirmed, flagged, total);
        if confidence < self.flag_threshold {
            return (pairs, false);
        }

        let percent = inappropriate_percent(confirmed, flagged, total);
        let message = format!(
            "Member of {confirmed} confirmed and {flagged} flagged inappropriate groups ({percent:.1}% total)."
        );
        debug!(user_id = user.id, confidence, "group analyzer flagged user");
        let added = reasons.add(
            user.id,
            Reason::new(ReasonType::Group, message, confidence, vec![]),
        );
        (pairs, added)
    }
}
