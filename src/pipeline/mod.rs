//! The analysis pipeline: five analyzer stages composed by a driver.
//!
//! Stage order is fixed: Group -> Friend -> Profile -> Outfit -> Thumbnail.
//! The group and friend analyzers work from pre-fetched lookup maps, the
//! profile analyzer from translated profile text, and the two image
//! analyzers from thumbnails of users an earlier stage already flagged.

mod driver;
mod friend;
mod group;
mod outfit;
mod profile;
mod proptest;
mod thumbnail;
pub mod weights;

pub use driver::{Pipeline, PipelineServices};
pub use friend::{FriendOutcome, FriendStage};
pub use group::{GroupOutcome, GroupStage};
pub use outfit::{OutfitOutcome, OutfitStage};
pub use profile::{ProfileOutcome, ProfileStage};
pub use thumbnail::{ThumbnailOutcome, ThumbnailStage};

/// Reason sentinel the models return for users without violations.
pub(crate) const NO_VIOLATIONS: &str = "NO_VIOLATIONS";
