//! Star totals, levels and ranks.
//!
//! All functions here are pure: they take a tally or a total and never touch
//! storage.

use crate::progress_model::{RankInfo, SubjectStarTally};

/// Rank tiers, lowest first.
pub const TIERS: [&str; 7] = [
    "Bronze",
    "Silver",
    "Gold",
    "Platinum",
    "Diamond",
    "Master",
    "Grandmaster",
];

/// Stars in one rank block. Three blocks make a tier.
pub const PLATEAU: u64 = 500;

pub const LEVELS_PER_TIER: u64 = 3;

pub const STARS_PER_LEVEL: u64 = 100;

pub fn total_of(tally: &SubjectStarTally) -> u64 {
    tally.values().fold(0u64, |sum, stars| sum.saturating_add(*stars))
}

/// `floor(total / 100) + 1`.
pub fn level_for(total: u64) -> u64 {
    total / STARS_PER_LEVEL + 1
}

/// Index into [`TIERS`]; clamped at the last tier.
pub fn tier_index_for(total: u64) -> usize {
    let blocks = total / PLATEAU;
    let index = blocks / LEVELS_PER_TIER;
    usize::try_from(index).map_or(TIERS.len() - 1, |i| i.min(TIERS.len() - 1))
}

/// Computes the rank for a star total.
///
/// Within a tier the level counts down 3, 2, 1 as blocks complete. Once the
/// tier is clamped at Grandmaster the level keeps cycling through 3, 2, 1.
///
/// ```rust
/// use kindpath_progress::rank::rank_info_for;
///
/// let rank = rank_info_for(1500);
/// assert_eq!(rank.name, "Silver 3");
/// assert_eq!(rank.stars_to_next, 500);
/// ```
pub fn rank_info_for(total: u64) -> RankInfo {
    let blocks = total / PLATEAU;
    let tier = TIERS[tier_index_for(total)];
    // blocks % 3 is at most 2
    let level = (LEVELS_PER_TIER - blocks % LEVELS_PER_TIER) as u8;
    let into_block = total % PLATEAU;

    RankInfo {
        tier: tier.to_string(),
        level,
        name: format!("{tier} {level}"),
        progress: (into_block as f64 / PLATEAU as f64) * 100.0,
        stars_to_next: PLATEAU - into_block,
    }
}
