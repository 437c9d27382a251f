//! Property-based tests for the pipeline invariants.
//!
//! These cover the merge and scoring rules the stages rely on:
//!
//! - Reason-map merges commute under the monotonic-confidence rule
//! - The map never contains users that were not added to it
//! - Composite confidence stays in [0, 1] and is dominated by the
//!   strongest reason
//! - Weight math stays bounded and monotonic
//! - Evidence drawn verbatim from the profile always anchors

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::collections::HashMap;

    use crate::config::PipelineConfig;
    use crate::evidence::EvidenceValidator;
    use crate::model::{Reason, ReasonType};
    use crate::pipeline::weights::{
        age_weight, friend_confidence, group_confidence, ratio_weight,
    };
    use crate::reasons::{composite_confidence, ReasonMap};

    fn reason_type() -> impl Strategy<Value = ReasonType> {
        prop_oneof![
            Just(ReasonType::Profile),
            Just(ReasonType::Friend),
            Just(ReasonType::Group),
            Just(ReasonType::Outfit),
            Just(ReasonType::Thumbnail),
        ]
    }

    fn confidence() -> impl Strategy<Value = f64> {
        0.1f64..=1.0f64
    }

    // =========================================================================
    // Merge Properties
    // =========================================================================

    proptest! {
        /// P1: merging two reasons for the same (user, type) yields the same
        /// confidence in either order, and the same full state when the
        /// confidences differ.
        #[test]
        fn merge_commutes(
            reason_type in reason_type(),
            conf_a in confidence(),
            conf_b in confidence(),
        ) {
            let a = Reason::new(reason_type, "a", conf_a, vec!["qa".to_string()]);
            let b = Reason::new(reason_type, "b", conf_b, vec!["qb".to_string()]);

            let ab = ReasonMap::new();
            ab.add(1, a.clone());
            ab.add(1, b.clone());
            let ab = ab.into_inner();

            let ba = ReasonMap::new();
            ba.add(1, b);
            ba.add(1, a);
            let ba = ba.into_inner();

            let left = &ab[&1][&reason_type];
            let right = &ba[&1][&reason_type];
            prop_assert_eq!(left.confidence, right.confidence);
            if conf_a != conf_b {
                prop_assert_eq!(left, right);
            }
        }

        /// Merged confidence never decreases across a sequence of adds.
        #[test]
        fn merge_confidence_is_monotonic(
            reason_type in reason_type(),
            confs in prop::collection::vec(confidence(), 1..8),
        ) {
            let map = ReasonMap::new();
            let mut best = f64::MIN;
            for (i, conf) in confs.iter().enumerate() {
                map.add(7, Reason::new(reason_type, format!("r{i}"), *conf, vec![]));
                best = best.max(*conf);
                let current = map.get(7).expect("added")[&reason_type].confidence;
                prop_assert_eq!(current, best);
            }
        }

        /// P2: the map contains exactly the ids that were added.
        #[test]
        fn map_has_no_phantom_users(
            ids in prop::collection::vec(0u64..50, 1..30),
        ) {
            let map = ReasonMap::new();
            for id in &ids {
                map.add(*id, Reason::new(ReasonType::Group, "g", 0.5, vec![]));
            }

            let mut flagged = map.flagged_ids();
            flagged.sort_unstable();
            let mut expected: Vec<u64> = ids.clone();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(flagged, expected);
        }
    }

    // =========================================================================
    // Composite Confidence Properties
    // =========================================================================

    proptest! {
        /// P3: composite stays in [0, 1] even for out-of-range inputs.
        #[test]
        fn composite_is_bounded(
            confs in prop::collection::vec(-1.0f64..2.0f64, 1..6),
        ) {
            let mut reasons = HashMap::new();
            let types = [
                ReasonType::Profile,
                ReasonType::Friend,
                ReasonType::Group,
                ReasonType::Outfit,
                ReasonType::Thumbnail,
            ];
            for (reason_type, conf) in types.iter().zip(confs.iter()) {
                reasons.insert(*reason_type, Reason::new(*reason_type, "m", *conf, vec![]));
            }

            let composite = composite_confidence(&reasons);
            prop_assert!((0.0..=1.0).contains(&composite));
        }

        /// The strongest reason dominates: the composite never exceeds it and
        /// never falls below half of it.
        #[test]
        fn composite_dominated_by_strongest(
            confs in prop::collection::vec(confidence(), 1..6),
        ) {
            let mut reasons = HashMap::new();
            let types = [
                ReasonType::Profile,
                ReasonType::Friend,
                ReasonType::Group,
                ReasonType::Outfit,
                ReasonType::Thumbnail,
            ];
            for (reason_type, conf) in types.iter().zip(confs.iter()) {
                reasons.insert(*reason_type, Reason::new(*reason_type, "m", *conf, vec![]));
            }

            let strongest = confs.iter().cloned().fold(f64::MIN, f64::max);
            let composite = composite_confidence(&reasons);
            // Rounding to two decimals adds up to half a cent of slack.
            prop_assert!(composite <= strongest + 0.005);
            prop_assert!(composite >= strongest / 2.0 - 0.005);
        }
    }

    // =========================================================================
    // Weight Properties
    // =========================================================================

    proptest! {
        /// Stage confidences stay within [0, 1].
        #[test]
        fn stage_confidences_are_bounded(
            confirmed in 0usize..30,
            flagged in 0usize..30,
            total in 0usize..60,
            age_days in 0i64..5_000,
        ) {
            let tiers = PipelineConfig::default().age_tiers;
            let group = group_confidence(confirmed, flagged, total);
            let friend = friend_confidence(
                confirmed,
                flagged,
                total,
                age_weight(age_days, &tiers),
            );

            prop_assert!((0.0..=1.0).contains(&group));
            prop_assert!((0.0..=1.0).contains(&friend));
        }

        /// More confirmed connections never lower the confidence.
        #[test]
        fn group_confidence_monotonic_in_confirmed(
            confirmed in 0usize..20,
            flagged in 0usize..20,
            total in 1usize..60,
        ) {
            let lower = group_confidence(confirmed, flagged, total);
            let higher = group_confidence(confirmed + 1, flagged, total);
            prop_assert!(higher >= lower);
        }

        /// The ratio weight is a capped fraction.
        #[test]
        fn ratio_weight_is_bounded(
            confirmed in 0usize..50,
            flagged in 0usize..50,
            total in 0usize..50,
        ) {
            let ratio = ratio_weight(confirmed, flagged, total);
            prop_assert!((0.0..=1.0).contains(&ratio));
        }
    }

    // =========================================================================
    // Evidence Anchoring Properties
    // =========================================================================

    fn word() -> impl Strategy<Value = String> {
        "[a-z]{2,8}"
    }

    proptest! {
        /// P4 support: quotes copied verbatim from the profile always anchor.
        #[test]
        fn verbatim_quotes_anchor(
            words in prop::collection::vec(word(), 2..12),
            take in 2usize..12,
        ) {
            let description = words.join(" ");
            let quote = words.iter().take(take.min(words.len())).cloned().collect::<Vec<_>>().join(" ");

            let validator = EvidenceValidator::default();
            prop_assert!(validator.validate(
                &[quote],
                &["someuser", "Some User", description.as_str()],
            ));
        }

        /// Quotes sharing no word with the profile never anchor.
        #[test]
        fn disjoint_quotes_fail(
            words in prop::collection::vec(word(), 2..8),
        ) {
            let description = words.join(" ");
            // Digits cannot occur in the generated lowercase words.
            let quote = "0000 1111 2222".to_string();

            let validator = EvidenceValidator::default();
            prop_assert!(!validator.validate(&[quote], &[description.as_str()]));
        }
    }
}
