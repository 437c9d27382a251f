//! Pipeline configuration.
//!
//! All knobs the core reads. Every field has a serde default so partial
//! config files deserialize cleanly.

use serde::{Deserialize, Serialize};

/// Users per model request, by stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSizes {
    /// Users per text LLM request.
    pub profile: usize,
    /// Users per vision request (outfit analysis is one user per request;
    /// this bounds how many are staged together).
    pub outfit: usize,
    pub thumbnail: usize,
    /// Users per friend network-analysis request.
    pub friend: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            profile: 20,
            outfit: 10,
            thumbnail: 10,
            friend: 10,
        }
    }
}

/// Max in-flight external calls, by concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    pub profile: usize,
    pub outfit: usize,
    pub thumbnail: usize,
    pub friend: usize,
    /// Concurrent translation tasks.
    pub translation: usize,
    /// Concurrent group/friend lookup tasks.
    pub lookup: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            profile: 5,
            outfit: 3,
            thumbnail: 3,
            friend: 3,
            translation: 50,
            lookup: 100,
        }
    }
}

/// Confidence and evidence cutoffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum confidence for a Group reason.
    pub group_flag: f64,
    /// Minimum confidence for a Friend reason.
    pub friend_flag: f64,
    /// Fraction of unique evidence words that must anchor to the profile.
    pub evidence_match: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            group_flag: 0.4,
            friend_flag: 0.4,
            evidence_match: 0.4,
        }
    }
}

/// One account-age bucket for the friend-stage age weight. Tiers are checked
/// in order; the last tier's weight is the catch-all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeTier {
    pub max_days: i64,
    pub weight: f64,
}

fn default_age_tiers() -> Vec<AgeTier> {
    vec![
        AgeTier { max_days: 30, weight: 1.0 },
        AgeTier { max_days: 90, weight: 0.8 },
        AgeTier { max_days: 180, weight: 0.6 },
        AgeTier { max_days: 365, weight: 0.4 },
        AgeTier { max_days: 730, weight: 0.3 },
        AgeTier { max_days: i64::MAX, weight: 0.2 },
    ]
}

/// Model selection for the text and vision endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub text: String,
    pub vision: String,
    pub temperature: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            text: "gemini-2.0-flash".to_string(),
            vision: "gemini-2.0-flash".to_string(),
            temperature: 0.15,
        }
    }
}

/// Configuration for the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: BatchSizes,
    pub concurrency: Concurrency,
    pub thresholds: Thresholds,
    /// Outfit cap per user.
    pub max_outfits: usize,
    /// Friend cap per AI request.
    pub max_friends_in_prompt: usize,
    #[serde(default = "default_age_tiers")]
    pub age_tiers: Vec<AgeTier>,
    /// Root batch timeout.
    pub batch_timeout_secs: u64,
    pub model: ModelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSizes::default(),
            concurrency: Concurrency::default(),
            thresholds: Thresholds::default(),
            max_outfits: 9,
            max_friends_in_prompt: 10,
            age_tiers: default_age_tiers(),
            batch_timeout_secs: 600,
            model: ModelConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Set the confidence cutoff for both the group and friend analyzers.
    pub fn with_flag_thresholds(mut self, group: f64, friend: f64) -> Self {
        self.thresholds.group_flag = group;
        self.thresholds.friend_flag = friend;
        self
    }

    pub fn with_max_outfits(mut self, max_outfits: usize) -> Self {
        self.max_outfits = max_outfits;
        self
    }

    pub fn with_batch_timeout_secs(mut self, secs: u64) -> Self {
        self.batch_timeout_secs = secs;
        self
    }

    /// Check the invariants the pipeline assumes.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.batch_size.profile == 0 || self.batch_size.friend == 0 {
            return Err(Error::Config("batch sizes must be non-zero".to_string()));
        }
        if self.concurrency.profile == 0
            || self.concurrency.outfit == 0
            || self.concurrency.thumbnail == 0
            || self.concurrency.friend == 0
            || self.concurrency.translation == 0
            || self.concurrency.lookup == 0
        {
            return Err(Error::Config("concurrency limits must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.thresholds.evidence_match) {
            return Err(Error::Config(format!(
                "evidence match fraction {} outside [0, 1]",
                self.thresholds.evidence_match
            )));
        }
        if self.age_tiers.is_empty() {
            return Err(Error::Config("age tiers must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size.profile, 20);
        assert_eq!(config.concurrency.translation, 50);
        assert_eq!(config.concurrency.lookup, 100);
        assert_eq!(config.thresholds.group_flag, 0.4);
        assert_eq!(config.max_outfits, 9);
        assert_eq!(config.max_friends_in_prompt, 10);
        assert_eq!(config.age_tiers.len(), 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_outfits": 4, "thresholds": {"group_flag": 0.5}}"#)
                .expect("partial config should deserialize");

        assert_eq!(config.max_outfits, 4);
        assert_eq!(config.thresholds.group_flag, 0.5);
        // Untouched fields keep their defaults.
        assert_eq!(config.thresholds.friend_flag, 0.4);
        assert_eq!(config.batch_size.profile, 20);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = PipelineConfig::default();
        config.concurrency.profile = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::default()
            .with_flag_thresholds(0.5, 0.6)
            .with_max_outfits(3)
            .with_batch_timeout_secs(60);

        assert_eq!(config.thresholds.group_flag, 0.5);
        assert_eq!(config.thresholds.friend_flag, 0.6);
        assert_eq!(config.max_outfits, 3);
        assert_eq!(config.batch_timeout_secs, 60);
    }
}
