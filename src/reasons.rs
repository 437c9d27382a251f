//! Shared reason map and composite confidence.
//!
//! The `ReasonMap` is the only cross-task mutable state in the pipeline.
//! All mutation goes through [`ReasonMap::add`], which serializes writes
//! behind an internal mutex and enforces the merge invariants: at most one
//! reason per (user, type), monotonically non-decreasing confidence, and
//! grow-only membership.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::model::{Reason, ReasonType};

/// Thread-safe map of user id to accumulated flag reasons.
#[derive(Debug, Default)]
pub struct ReasonMap {
    inner: Mutex<HashMap<u64, HashMap<ReasonType, Reason>>>,
}

impl ReasonMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, HashMap<ReasonType, Reason>>> {
        // A poisoned lock still holds consistent data: every write below is a
        // single insert.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merge one reason for one user.
    ///
    /// A reason for a (user, type) pair not seen before is inserted. A later
    /// reason with strictly higher confidence replaces message and evidence;
    /// equal or lower confidence is ignored. Returns whether the map changed.
    pub fn add(&self, user_id: u64, reason: Reason) -> bool {
        let mut map = self.lock();
        let entry = map.entry(user_id).or_default();
        match entry.get(&reason.reason_type) {
            Some(existing) if existing.confidence >= reason.confidence => false,
            _ => {
                entry.insert(reason.reason_type, reason);
                true
            }
        }
    }

    /// Whether any reason has been recorded for this user.
    pub fn contains(&self, user_id: u64) -> bool {
        self.lock().contains_key(&user_id)
    }

    /// Ids of all users with at least one reason.
    pub fn flagged_ids(&self) -> Vec<u64> {
        self.lock().keys().copied().collect()
    }

    /// Snapshot of one user's reasons.
    pub fn get(&self, user_id: u64) -> Option<HashMap<ReasonType, Reason>> {
        self.lock().get(&user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Consume the map at finalize time.
    pub fn into_inner(self) -> HashMap<u64, HashMap<ReasonType, Reason>> {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

/// Round to two decimal places.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Composite confidence over a user's reason set.
///
/// Confidences are clamped to [0, 1], sorted descending, and combined as a
/// weighted average with weights 1/2^(i-1), so a single strong reason
/// dominates and further reasons raise the composite modestly. The result is
/// rounded to two decimals and clamped to [0, 1].
pub fn composite_confidence(reasons: &HashMap<ReasonType, Reason>) -> f64 {
    let mut confidences: Vec<f64> = reasons
        .values()
        .map(|r| r.confidence.clamp(0.0, 1.0))
        .collect();
    if confidences.is_empty() {
        return 0.0;
    }
    confidences.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut weight = 1.0;
    for confidence in confidences {
        numerator += confidence * weight;
        denominator += weight;
        weight /= 2.0;
    }

    round2(numerator / denominator).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReasonType;

    fn reason(reason_type: ReasonType, confidence: f64) -> Reason {
        Reason::new(reason_type, format!("{reason_type} reason"), confidence, vec![])
    }

    #[test]
    fn test_insert_and_lookup() {
        let map = ReasonMap::new();
        assert!(!map.contains(1));
        assert!(map.add(1, reason(ReasonType::Group, 0.5)));
        assert!(map.contains(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(1).expect("user present").len(), 1);
    }

    #[test]
    fn test_higher_confidence_replaces() {
        let map = ReasonMap::new();
        map.add(1, reason(ReasonType::Profile, 0.5));
        assert!(map.add(
            1,
            Reason::new(ReasonType::Profile, "stronger", 0.8, vec!["quote".to_string()])
        ));

        let merged = map.get(1).expect("user present");
        let profile = &merged[&ReasonType::Profile];
        assert_eq!(profile.confidence, 0.8);
        assert_eq!(profile.message, "stronger");
        assert_eq!(profile.evidence, vec!["quote".to_string()]);
    }

    #[test]
    fn test_equal_or_lower_confidence_ignored() {
        let map = ReasonMap::new();
        map.add(1, Reason::new(ReasonType::Profile, "original", 0.5, vec![]));
        assert!(!map.add(1, Reason::new(ReasonType::Profile, "equal", 0.5, vec![])));
        assert!(!map.add(1, Reason::new(ReasonType::Profile, "weaker", 0.3, vec![])));

        let merged = map.get(1).expect("user present");
        assert_eq!(merged[&ReasonType::Profile].message, "original");
    }

    #[test]
    fn test_one_reason_per_type() {
        let map = ReasonMap::new();
        map.add(1, reason(ReasonType::Group, 0.5));
        map.add(1, reason(ReasonType::Friend, 0.6));
        map.add(1, reason(ReasonType::Group, 0.9));

        let merged = map.get(1).expect("user present");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&ReasonType::Group].confidence, 0.9);
    }

    #[test]
    fn test_composite_single_reason() {
        let mut reasons = HashMap::new();
        reasons.insert(ReasonType::Group, reason(ReasonType::Group, 0.8));
        assert_eq!(composite_confidence(&reasons), 0.8);
    }

    #[test]
    fn test_composite_three_reasons() {
        // {0.9, 0.6, 0.3} with weights 1, 0.5, 0.25:
        // (0.9 + 0.3 + 0.075) / 1.75 = 0.7285... -> 0.73
        let mut reasons = HashMap::new();
        reasons.insert(ReasonType::Profile, reason(ReasonType::Profile, 0.9));
        reasons.insert(ReasonType::Group, reason(ReasonType::Group, 0.6));
        reasons.insert(ReasonType::Friend, reason(ReasonType::Friend, 0.3));
        assert_eq!(composite_confidence(&reasons), 0.73);
    }

    #[test]
    fn test_composite_clamps_negative_inputs() {
        // {0.8, -0.2} clamps to {0.8, 0.0}: (0.8 + 0.0) / 1.5 = 0.533 -> 0.53
        let mut reasons = HashMap::new();
        reasons.insert(ReasonType::Profile, reason(ReasonType::Profile, 0.8));
        reasons.insert(ReasonType::Group, reason(ReasonType::Group, -0.2));
        assert_eq!(composite_confidence(&reasons), 0.53);
    }

    #[test]
    fn test_composite_empty_is_zero() {
        assert_eq!(composite_confidence(&HashMap::new()), 0.0);
    }

    #[test]
    fn test_concurrent_adds() {
        use std::sync::Arc;

        let map = Arc::new(ReasonMap::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for user_id in 0..100u64 {
                        map.add(user_id, reason(ReasonType::Group, 0.1 + (i as f64) * 0.1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        assert_eq!(map.len(), 100);
        // Highest writer wins regardless of interleaving.
        let merged = map.get(42).expect("user present");
        assert!((merged[&ReasonType::Group].confidence - 0.8).abs() < 1e-9);
    }
}
