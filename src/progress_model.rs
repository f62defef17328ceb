//! Data model for progression state.
//!
//! The persisted pieces are the per-subject star tally and the badge
//! collection. Everything else here ([`RankInfo`], [`ProgressSnapshot`]) is
//! derived on demand and only ever serialized outward, to UI hosts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subject id to star count. Keys appear the first time a subject is awarded.
///
/// Ordered so the persisted JSON is stable between writes.
pub type SubjectStarTally = BTreeMap<String, u64>;

/// Subject credited when a caller does not name one. Before subjects existed
/// every star was a math star.
pub const DEFAULT_SUBJECT: &str = "math";

/// Storage key suffixes. The store prepends its configured prefix.
pub const SUBJECT_STARS_KEY: &str = "subject_stars";
pub const LEGACY_STARS_KEY: &str = "stars";
pub const BADGES_KEY: &str = "badges";

/// An achievement, unlocked at most once per `id`.
///
/// # Examples
///
/// ```rust
/// use kindpath_progress::progress_model::Badge;
///
/// let json = r#"{"id":"first_steps","name":"First Steps","icon":"👣","date":"2024-01-15T10:30:00.000Z"}"#;
/// let badge: Badge = serde_json::from_str(json)?;
/// assert_eq!(badge.id, "first_steps");
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub id: String,
    /// Display label.
    pub name: String,
    /// Emoji or glyph shown next to the label.
    pub icon: String,
    /// Time of first unlock, RFC 3339 in UTC.
    pub date: DateTime<Utc>,
}

/// Rank derived from the total star count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankInfo {
    pub tier: String,
    /// 3 is the entry level of a tier, 1 the last before promotion.
    pub level: u8,
    /// `"<tier> <level>"`, e.g. `"Silver 3"`.
    pub name: String,
    /// Percent through the current 500-star block, `0.0..100.0`.
    pub progress: f64,
    pub stars_to_next: u64,
}

/// A consistent view of the whole store, taken in one lock hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Incremented by every applied mutation.
    pub revision: u64,
    pub subject_stars: SubjectStarTally,
    pub total_stars: u64,
    pub level: u64,
    pub rank: RankInfo,
    pub badges: Vec<Badge>,
}
