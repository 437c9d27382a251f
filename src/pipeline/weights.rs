//! Confidence weight math shared by the group and friend analyzers.
//!
//! Both analyzers blend an absolute tier weight (how many inappropriate
//! connections exist) with a ratio weight (what share of the user's
//! connections they represent). Confirmed connections count fully; flagged
//! ones count half. The friend analyzer additionally folds in an
//! account-age weight.

use crate::config::AgeTier;
use crate::reasons::round2;

fn combined(confirmed: usize, flagged: usize) -> f64 {
    confirmed as f64 + 0.5 * flagged as f64
}

/// Tier weight for group memberships.
pub fn group_abs_weight(confirmed: usize, flagged: usize) -> f64 {
    let score = combined(confirmed, flagged);
    if confirmed >= 4 || score >= 6.0 {
        1.0
    } else if confirmed >= 3 || score >= 5.0 {
        0.8
    } else if confirmed >= 2 || score >= 4.0 {
        0.6
    } else if confirmed >= 1 || score >= 2.0 {
        0.4
    } else if score >= 1.0 {
        0.2
    } else {
        0.0
    }
}

/// Tier weight for friendships. The bar sits higher than for groups:
/// friendship is a weaker signal than co-membership.
pub fn friend_abs_weight(confirmed: usize, flagged: usize) -> f64 {
    let score = combined(confirmed, flagged);
    if confirmed >= 8 || score >= 10.0 {
        1.0
    } else if confirmed >= 6 || score >= 8.0 {
        0.8
    } else if confirmed >= 4 || score >= 6.0 {
        0.6
    } else if confirmed >= 2 || score >= 3.0 {
        0.4
    } else if score >= 1.0 {
        0.2
    } else {
        0.0
    }
}

/// Share of the user's connections that are inappropriate, capped at 1.
pub fn ratio_weight(confirmed: usize, flagged: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (combined(confirmed, flagged) / total as f64).min(1.0)
}

/// Account-age weight: younger accounts score higher. Tiers are checked in
/// order; the last tier is the catch-all.
pub fn age_weight(age_days: i64, tiers: &[AgeTier]) -> f64 {
    for tier in tiers {
        if age_days < tier.max_days {
            return tier.weight;
        }
    }
    tiers.last().map(|t| t.weight).unwrap_or(0.0)
}

/// Group-stage confidence, rounded to two decimals.
pub fn group_confidence(confirmed: usize, flagged: usize, total: usize) -> f64 {
    round2(
        0.6 * group_abs_weight(confirmed, flagged) + 0.4 * ratio_weight(confirmed, flagged, total),
    )
}

/// Friend-stage confidence, rounded to two decimals.
pub fn friend_confidence(
    confirmed: usize,
    flagged: usize,
    total: usize,
    age_weight: f64,
) -> f64 {
    round2(
        0.6 * friend_abs_weight(confirmed, flagged)
            + 0.3 * ratio_weight(confirmed, flagged, total)
            + 0.1 * age_weight,
    )
}

/// Inappropriate share of a user's connections, as a percentage for
/// template messages.
pub fn inappropriate_percent(confirmed: usize, flagged: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * (confirmed + flagged) as f64 / total as f64
}
