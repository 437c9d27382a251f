//! # sift-core
//!
//! A moderation analysis pipeline for social-platform user profiles. Each
//! batch of users runs through five analyzer stages (group membership,
//! friend graph, profile text, outfit images, avatar thumbnail); stage
//! outputs merge into a per-user reason set, a composite confidence is
//! computed, and the flagged set is handed to the persistence collaborator.
//!
//! ## Core Components
//!
//! - **Pipeline**: stage composition, admission control and finalize
//! - **ReasonMap**: thread-safe reason merging with monotonic confidence
//! - **EvidenceValidator**: anchors model-quoted evidence to profile text
//! - **RetryPolicy**: bounded exponential backoff around external calls
//!
//! ## Example
//!
//! ```rust,ignore
//! use sift_core::{Pipeline, PipelineConfig, PipelineServices, UserBatch};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = Pipeline::new(services, PipelineConfig::default())?;
//! let report = pipeline.run(batch, &CancellationToken::new()).await?;
//! println!("flagged {} users", report.stats.flagged_users);
//! ```

pub mod config;
pub mod error;
pub mod evidence;
pub mod image;
pub mod llm;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod reasons;
pub mod retry;
pub mod services;

// Re-exports for convenience
pub use config::{AgeTier, BatchSizes, Concurrency, ModelConfig, PipelineConfig, Thresholds};
pub use error::{Error, Result};
pub use evidence::EvidenceValidator;
pub use llm::{
    CachedChatClient, ChatClient, ClientConfig, Content, FileStore, GeminiClient,
    GeminiFileStore, GenerateRequest, GenerateResponse, GenerationConfig, Part, StoredFile,
};
pub use model::{
    BatchReport, BatchStats, FlagStatus, FlaggedUser, FriendLink, FriendStanding,
    GroupMembership, OutfitRef, Reason, ReasonType, UserBatch, UserRecord,
    THUMBNAIL_UNAVAILABLE,
};
pub use pipeline::{Pipeline, PipelineServices};
pub use reasons::{composite_confidence, ReasonMap};
pub use retry::{retry, RetryPolicy};
pub use services::{
    FlagStore, GroupTracker, HttpImageFetcher, ImageFetcher, OutfitThumbnails, Translator,
};
