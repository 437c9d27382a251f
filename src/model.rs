//! Core data model for the analysis pipeline.
//!
//! `UserRecord` is constructed by the fetcher collaborator before pipeline
//! entry and is immutable thereafter; stages share records via `Arc`.
//! `Reason` and `FlaggedUser` are the pipeline's outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Sentinel URL the platform returns when no avatar thumbnail exists.
pub const THUMBNAIL_UNAVAILABLE: &str = "-";

/// One group membership on a user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: u64,
    pub role: String,
}

/// One entry in a user's friend list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendLink {
    pub friend_id: u64,
    pub name: String,
}

/// One saved avatar outfit. Names may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutfitRef {
    pub outfit_id: u64,
    pub name: String,
}

/// An immutable platform user profile, as fetched upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub groups: Vec<GroupMembership>,
    pub friends: Vec<FriendLink>,
    pub outfits: Vec<OutfitRef>,
    pub thumbnail_url: String,
    pub follower_count: u64,
    pub following_count: u64,
}

impl UserRecord {
    /// Whether the platform returned a usable avatar thumbnail URL.
    pub fn has_thumbnail(&self) -> bool {
        !self.thumbnail_url.is_empty() && self.thumbnail_url != THUMBNAIL_UNAVAILABLE
    }
}

/// The analyzer stage that produced a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonType {
    Profile,
    Friend,
    Group,
    Outfit,
    Thumbnail,
}

impl std::fmt::Display for ReasonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Profile => write!(f, "profile"),
            Self::Friend => write!(f, "friend"),
            Self::Group => write!(f, "group"),
            Self::Outfit => write!(f, "outfit"),
            Self::Thumbnail => write!(f, "thumbnail"),
        }
    }
}

/// A single flag reason attached to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    #[serde(rename = "type")]
    pub reason_type: ReasonType,
    /// Single-sentence human explanation.
    pub message: String,
    /// Confidence in [0.1, 1.0].
    pub confidence: f64,
    /// Exact quotes or outfit names. May be empty for Friend/Group reasons.
    pub evidence: Vec<String>,
}

impl Reason {
    pub fn new(
        reason_type: ReasonType,
        message: impl Into<String>,
        confidence: f64,
        evidence: Vec<String>,
    ) -> Self {
        Self {
            reason_type,
            message: message.into(),
            confidence,
            evidence,
        }
    }

    /// Whether the confidence falls in the accepted [0.1, 1.0] range.
    pub fn confidence_in_range(&self) -> bool {
        (0.1..=1.0).contains(&self.confidence)
    }
}

/// Review standing of a user another user links to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    /// Human-confirmed inappropriate.
    Confirmed,
    /// Machine-flagged, pending review.
    Flagged,
}

/// Pre-fetched standing of a friend referenced from a friend list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendStanding {
    pub status: FlagStatus,
    pub reason_types: Vec<ReasonType>,
}

/// A user the pipeline flagged, with the full reason set and composite score.
#[derive(Debug, Clone)]
pub struct FlaggedUser {
    pub user: Arc<UserRecord>,
    pub reasons: HashMap<ReasonType, Reason>,
    /// Composite confidence in [0, 1].
    pub confidence: f64,
}

/// One batch of pipeline input: the users to analyze plus the pre-fetched
/// lookup maps the upstream fetchers supply.
#[derive(Debug, Clone, Default)]
pub struct UserBatch {
    pub users: Vec<Arc<UserRecord>>,
    /// Known flagged/confirmed groups by group id.
    pub known_groups: HashMap<u64, FlagStatus>,
    /// Known flagged/confirmed users by user id, for friend-graph overlap.
    pub known_friends: HashMap<u64, FriendStanding>,
}

impl UserBatch {
    pub fn new(users: Vec<Arc<UserRecord>>) -> Self {
        Self {
            users,
            ..Self::default()
        }
    }

    pub fn with_known_groups(mut self, known_groups: HashMap<u64, FlagStatus>) -> Self {
        self.known_groups = known_groups;
        self
    }

    pub fn with_known_friends(mut self, known_friends: HashMap<u64, FriendStanding>) -> Self {
        self.known_friends = known_friends;
        self
    }
}

/// Per-run counters, aggregated by the driver from stage outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub users_scanned: usize,
    pub flagged_users: usize,
    pub group_flagged: usize,
    pub friend_flagged: usize,
    pub profile_flagged: usize,
    pub outfit_flagged: usize,
    pub thumbnail_flagged: usize,
    pub translation_failures: usize,
    pub validation_rejections: usize,
}

/// Everything one pipeline run produces.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub flagged: HashMap<u64, FlaggedUser>,
    pub stats: BatchStats,
    /// Users whose profile analysis was rejected by validation and should be
    /// rescheduled by the caller.
    pub profile_retry_ids: Vec<u64>,
}
